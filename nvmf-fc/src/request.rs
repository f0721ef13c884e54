//! The FCP request pipeline: receive path, execution with XRI/buffer
//! backpressure, response emission and abort handling.

use nix::errno::Errno;

use crate::{
    fabric::{
        assoc::{ConnKey, QpairState, ReqTag},
        hwqp::HwqpId,
        port::ObjState,
    },
    lld::{FcXchg, IoXmt},
    poller::PollerMsg,
    transport::FcTransport,
    wire::{
        frame::{
            FrameHdr, R_CTL_CMD_REQ, R_CTL_LS_REQUEST, TYPE_FC_EXCHANGE,
            TYPE_NVMF_DATA,
        },
        iu::{
            CmndIu, ErspIu, NvmeCmd, NvmeCpl, XferDir, ERSP_IU_SIZE,
            NVME_OPC_ASYNC_EVENT_REQUEST, NVME_OPC_KEEP_ALIVE,
            NVME_SC_ABORTED_MISSING_FUSED,
        },
    },
};

pub(crate) const REQ_MAGIC_DEAD: u32 = 0xdead_beef;
pub(crate) const REQ_MAGIC_LIVE: u32 = 0x4643_5251;

/// How many pending requests one poller tick will retry.
const PENDING_REQ_BUDGET: usize = 64;

/// Request lifecycle. Transitions are one-way per frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqState {
    Init,
    ReadBdev,
    ReadXfer,
    ReadRsp,
    WriteBuffs,
    WriteXfer,
    WriteBdev,
    WriteRsp,
    NoneBdev,
    NoneRsp,
    Success,
    Failed,
    Aborted,
    BdevAborted,
    Pending,
    FusedWaiting,
}

impl ReqState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReqState::Init => "INIT",
            ReqState::ReadBdev => "READ_BDEV",
            ReqState::ReadXfer => "READ_XFER",
            ReqState::ReadRsp => "READ_RSP",
            ReqState::WriteBuffs => "WRITE_BUFFS",
            ReqState::WriteXfer => "WRITE_XFER",
            ReqState::WriteBdev => "WRITE_BDEV",
            ReqState::WriteRsp => "WRITE_RSP",
            ReqState::NoneBdev => "NONE_BDEV",
            ReqState::NoneRsp => "NONE_RSP",
            ReqState::Success => "SUCCESS",
            ReqState::Failed => "FAILED",
            ReqState::Aborted => "ABORTED",
            ReqState::BdevAborted => "BDEV_ABORTED",
            ReqState::Pending => "PENDING",
            ReqState::FusedWaiting => "FUSED_WAITING",
        }
    }
}

/// Callback fired when an aborted request has fully completed.
#[derive(Debug, Clone, Copy)]
pub enum AbortCb {
    /// a connection delete is counting down its in-flight requests
    ConnDelete { op: u64 },
    /// an ABTS poller operation found this request
    Abts { op: u64, hwqp: HwqpId },
}

/// One capsule travelling through the transport. Drawn from its
/// connection's preallocated pool, never heap-allocated per IO.
pub struct FcRequest {
    pub magic: u32,
    pub state: ReqState,
    pub cmd: NvmeCmd,
    pub ersp: ErspIu,
    pub length: u32,
    pub xfer: XferDir,
    pub oxid: u16,
    pub rpi: u16,
    pub s_id: u32,
    pub d_id: u32,
    pub csn: u32,
    /// VMID application id from the device header, when present
    pub app_id: Option<u32>,
    /// frame priority from CS_CTL, when enabled
    pub cs_ctl: Option<u8>,
    pub xchg: Option<FcXchg>,
    pub data_from_pool: bool,
    pub buf_count: u32,
    pub transferred_len: u32,
    pub is_aborted: bool,
    /// fused second without a first: fail instead of executing
    pub fused_failed: bool,
    pub abort_cbs: Vec<AbortCb>,
    pub conn: ConnKey,
    pub hwqp: HwqpId,
    pub idx: u16,
}

impl FcRequest {
    pub(crate) fn unused(conn: ConnKey, idx: u16) -> Self {
        Self {
            magic: REQ_MAGIC_DEAD,
            state: ReqState::Init,
            cmd: NvmeCmd::default(),
            ersp: ErspIu::default(),
            length: 0,
            xfer: XferDir::None,
            oxid: 0,
            rpi: 0,
            s_id: 0,
            d_id: 0,
            csn: 0,
            app_id: None,
            cs_ctl: None,
            xchg: None,
            data_from_pool: false,
            buf_count: 0,
            transferred_len: 0,
            is_aborted: false,
            fused_failed: false,
            abort_cbs: Vec::new(),
            conn,
            hwqp: 0,
            idx,
        }
    }

    pub(crate) fn reset(&mut self) {
        let conn = self.conn;
        let idx = self.idx;
        *self = FcRequest::unused(conn, idx);
        self.magic = REQ_MAGIC_LIVE;
    }

    pub(crate) fn mark_dead(&mut self) {
        self.magic = REQ_MAGIC_DEAD;
    }

    /// True while the exchange is in a transfer or response emission
    /// state owned by the driver.
    pub fn in_xfer(&self) -> bool {
        matches!(
            self.state,
            ReqState::ReadXfer
                | ReqState::ReadRsp
                | ReqState::WriteXfer
                | ReqState::WriteRsp
                | ReqState::NoneRsp
        )
    }

    fn io_xmt(&self, tag: ReqTag) -> IoXmt {
        IoXmt {
            tag,
            xchg_id: self.xchg.as_ref().map(|x| x.xchg_id),
            oxid: self.oxid,
            rpi: self.rpi,
            s_id: self.s_id,
            d_id: self.d_id,
        }
    }
}

/// Only qid-0 Keep Alive may bypass XRI allocation.
fn use_send_frame(qid: u16, cmd: &NvmeCmd) -> bool {
    qid == 0 && cmd.opc == NVME_OPC_KEEP_ALIVE
}

impl FcTransport {
    pub(crate) fn set_req_state(&mut self, tag: ReqTag, state: ReqState) {
        let req = self.req_mut(tag).expect("set_req_state: request gone");
        assert_ne!(req.magic, REQ_MAGIC_DEAD, "request used after free");
        trace!(
            "FC Request({:?}): state {} -> {}",
            tag,
            req.state.as_str(),
            state.as_str()
        );
        req.state = state;
    }

    /* ---------- receive path ---------- */

    /// Entry point the low level driver hands inbound frames to. `frame`
    /// is the raw header area, `payload` the IU.
    pub fn process_frame(
        &mut self,
        h: HwqpId,
        buf_index: u32,
        frame: &[u8],
        payload: &[u8],
    ) -> Result<(), Errno> {
        let queue = match self.hwqp(h) {
            Some(q) => q.queue,
            None => return Err(Errno::ENODEV),
        };

        let hdr = match FrameHdr::decode(frame) {
            Ok(hdr) => hdr,
            Err(_) => {
                error!("Short frame received. Dropping");
                if let Some(q) = self.hwqp_mut(h) {
                    q.counters.unknown_frame += 1;
                }
                self.lld.release_rq_buffer(queue, buf_index);
                return Err(Errno::EINVAL);
            }
        };

        debug!(
            "Process NVME frame s_id:0x{:x} d_id:0x{:x} oxid:0x{:x} rxid:0x{:x}",
            hdr.s_id, hdr.d_id, hdr.ox_id, hdr.rx_id
        );

        if hdr.r_ctl == R_CTL_LS_REQUEST && hdr.ftype == TYPE_NVMF_DATA {
            self.process_ls_frame(h, buf_index, &hdr, payload)
        } else if hdr.r_ctl == R_CTL_CMD_REQ && hdr.ftype == TYPE_FC_EXCHANGE
        {
            let rc = self.handle_fcp_request(h, &hdr, frame, payload);
            // the capsule is copied out (or dropped); either way the
            // receive buffer goes back to the chip exactly once
            self.lld.release_rq_buffer(queue, buf_index);
            rc
        } else {
            error!("Unknown frame received. Dropping");
            if let Some(q) = self.hwqp_mut(h) {
                q.counters.unknown_frame += 1;
            }
            self.lld.release_rq_buffer(queue, buf_index);
            Err(Errno::EINVAL)
        }
    }

    fn handle_fcp_request(
        &mut self,
        h: HwqpId,
        hdr: &FrameHdr,
        frame: &[u8],
        payload: &[u8],
    ) -> Result<(), Errno> {
        let iu = match CmndIu::decode(payload) {
            Ok(iu) => iu,
            Err(_) => {
                error!("IU CMD error");
                self.hwqp_mut(h).unwrap().counters.nvme_cmd_iu_err += 1;
                return Err(Errno::ENXIO);
            }
        };
        if !iu.is_valid() {
            error!("IU CMD error");
            self.hwqp_mut(h).unwrap().counters.nvme_cmd_iu_err += 1;
            return Err(Errno::ENXIO);
        }

        let xfer = XferDir::from_iu_flags(iu.flags);
        if xfer == XferDir::Bidirectional {
            error!("IU CMD xfer error");
            self.hwqp_mut(h).unwrap().counters.nvme_cmd_xfer_err += 1;
            return Err(Errno::EPERM);
        }

        let conn_key = match self.hwqp(h).unwrap().find_conn(iu.conn_id) {
            Some(k) => k,
            None => {
                error!("IU CMD conn(0x{:x}) invalid", iu.conn_id);
                self.hwqp_mut(h).unwrap().counters.invalid_conn_err += 1;
                return Err(Errno::ENODEV);
            }
        };

        let (conn_s_id, conn_d_id, conn_rpi, conn_state, qpair_state) = {
            let conn = self.conn(conn_key).unwrap();
            (conn.s_id, conn.d_id, conn.rpi, conn.state, conn.qpair_state)
        };

        if hdr.s_id != conn_s_id {
            error!("Frame s_id invalid for connection 0x{:x}", iu.conn_id);
            self.hwqp_mut(h).unwrap().counters.rport_invalid += 1;
            return Err(Errno::ENODEV);
        }
        if hdr.d_id != conn_d_id {
            error!("Frame d_id invalid for connection 0x{:x}", iu.conn_id);
            self.hwqp_mut(h).unwrap().counters.nport_invalid += 1;
            return Err(Errno::ENODEV);
        }

        let assoc_state = self.assoc(conn_key.assoc).unwrap().state;
        if assoc_state != ObjState::Created {
            error!("Association state not valid for connection");
            return Err(Errno::EACCES);
        }
        if conn_state != ObjState::Created {
            error!("Connection 0x{:x} state not valid", iu.conn_id);
            return Err(Errno::EACCES);
        }
        if qpair_state != QpairState::Active {
            error!("Connection 0x{:x} qpair state not valid", iu.conn_id);
            return Err(Errno::EACCES);
        }

        if iu.data_len > self.opts.max_io_size {
            error!("IO length requested is greater than MDTS");
            return Err(Errno::EINVAL);
        }

        let idx = match self.conn_mut(conn_key).unwrap().alloc_request() {
            Some(idx) => idx,
            None => {
                error!("Alloc request buffer failed");
                return Err(Errno::ENOMEM);
            }
        };
        let tag = ReqTag {
            conn: conn_key,
            idx,
        };

        {
            let app_id = hdr.vm_app_id(frame);
            let cs_ctl = hdr.priority();
            let req = self.req_mut(tag).unwrap();
            req.length = iu.data_len;
            req.cmd = iu.cmd;
            req.ersp.rsp.cid = iu.cmd.cid;
            req.oxid = hdr.ox_id;
            req.rpi = conn_rpi;
            req.s_id = hdr.s_id;
            req.d_id = hdr.d_id;
            req.csn = iu.cmnd_seq_num;
            req.xfer = xfer;
            req.hwqp = h;
            req.app_id = app_id;
            req.cs_ctl = cs_ctl;
        }
        self.hwqp_mut(h).unwrap().in_use_reqs.push(tag);
        self.set_req_state(tag, ReqState::Init);

        match iu.cmd.fuse() {
            1 => {
                // first half: park until the second shows up
                self.set_req_state(tag, ReqState::FusedWaiting);
                self.conn_mut(conn_key).unwrap().fused_waiting.push_back(idx);
            }
            2 => {
                let first =
                    self.conn_mut(conn_key).unwrap().fused_waiting.pop_front();
                match first {
                    Some(first_idx) => {
                        let first_tag = ReqTag {
                            conn: conn_key,
                            idx: first_idx,
                        };
                        self.set_req_state(first_tag, ReqState::Init);
                        self.start_or_queue(h, first_tag);
                        self.start_or_queue(h, tag);
                    }
                    None => {
                        // second without a first
                        self.req_mut(tag)
                            .unwrap()
                            .ersp
                            .rsp
                            .set_status_code(NVME_SC_ABORTED_MISSING_FUSED);
                        self.req_mut(tag).unwrap().fused_failed = true;
                        self.start_or_queue(h, tag);
                    }
                }
            }
            _ => self.start_or_queue(h, tag),
        }
        Ok(())
    }

    /// Either dispatch the request now or park it behind earlier arrivals
    /// waiting for resources.
    pub(crate) fn start_or_queue(&mut self, h: HwqpId, tag: ReqTag) {
        let backlog = !self.hwqp(h).unwrap().pending_reqs.is_empty();
        if backlog || self.request_execute(tag).is_err() {
            self.hwqp_mut(h).unwrap().pending_reqs.push_back(tag);
            self.set_req_state(tag, ReqState::Pending);
        }
    }

    /* ---------- execute ---------- */

    /// Acquire the exchange and data buffers and hand the capsule off.
    /// `EAGAIN` means a resource ran dry and the request should stay
    /// pending; nothing is partially held in that case.
    pub(crate) fn request_execute(&mut self, tag: ReqTag) -> Result<(), Errno> {
        let (h, qid, cmd, length, xfer, fused_failed, has_xchg) = {
            let req = self.req(tag).ok_or(Errno::ENOENT)?;
            let qid = self.conn(tag.conn).unwrap().qid;
            (
                req.hwqp,
                qid,
                req.cmd,
                req.length,
                req.xfer,
                req.fused_failed,
                req.xchg.is_some(),
            )
        };
        let queue = self.hwqp(h).unwrap().queue;

        if !use_send_frame(qid, &cmd) && !has_xchg {
            match self.lld.acquire_xri(queue) {
                Some(xchg) => self.req_mut(tag).unwrap().xchg = Some(xchg),
                None => {
                    self.hwqp_mut(h).unwrap().counters.no_xchg += 1;
                    return Err(Errno::EAGAIN);
                }
            }
        }

        let needs_bufs = length > 0 && !fused_failed;
        if needs_bufs && !self.req(tag).unwrap().data_from_pool {
            let needed = self.bufs_needed(length);
            let fgroup = self.hwqp(h).unwrap().fgroup;
            let got = match fgroup {
                Some(g) => self.poll_groups.lock()[g].get_buffers(needed),
                None => false,
            };
            if !got {
                self.hwqp_mut(h).unwrap().counters.buf_alloc_err += 1;
                if let Some(xchg) = self.req_mut(tag).unwrap().xchg.take() {
                    self.lld.release_xri(queue, xchg);
                }
                return Err(Errno::EAGAIN);
            }
            let req = self.req_mut(tag).unwrap();
            req.data_from_pool = true;
            req.buf_count = needed;
        }

        if fused_failed {
            // respond straight away with the prepared error status
            self.set_req_state(tag, ReqState::NoneRsp);
            if self.handle_rsp(tag).is_err() {
                self.hwqp_mut(h).unwrap().counters.unexpected_err += 1;
                self.request_release(tag);
            }
            return Ok(());
        }

        if xfer == XferDir::HostToController {
            debug!("WRITE CMD");
            self.set_req_state(tag, ReqState::WriteXfer);
            let io = self.req(tag).unwrap().io_xmt(tag);
            if self.lld.post_xfer_ready(queue, &io, 0, length).is_err() {
                // dropped, return success to the caller
                self.hwqp_mut(h).unwrap().counters.unexpected_err += 1;
                self.request_release(tag);
            }
        } else {
            debug!("READ/NONE CMD");
            if xfer == XferDir::ControllerToHost {
                self.set_req_state(tag, ReqState::ReadBdev);
            } else {
                self.set_req_state(tag, ReqState::NoneBdev);
            }
            self.with_backend(|be, t| be.request_exec(t, tag));
        }
        Ok(())
    }

    /// Retry capsules that were waiting for an XRI or data buffers.
    pub(crate) fn process_pending_reqs(&mut self, h: HwqpId) {
        if self.hwqp(h).map(|q| q.fgroup.is_none()).unwrap_or(true) {
            // the LS queue stages its own pending work
            return;
        }
        let mut budget = PENDING_REQ_BUDGET;
        let tags: Vec<ReqTag> =
            self.hwqp(h).unwrap().pending_reqs.iter().copied().collect();
        for tag in tags {
            if budget == 0 {
                return;
            }
            budget -= 1;
            if self.request_execute(tag).is_ok() {
                let q = self.hwqp_mut(h).unwrap();
                q.pending_reqs.retain(|t| *t != tag);
            }
        }
    }

    /* ---------- completion & response ---------- */

    /// Extended response is required for every ERSP-ratio window, fabric
    /// commands, any interesting status, or a short transfer.
    pub(crate) fn send_ersp_required(
        &self,
        tag: ReqTag,
        rsp_cnt: u16,
        xfer_len: u32,
    ) -> bool {
        let req = self.req(tag).unwrap();
        let conn = self.conn(tag.conn).unwrap();
        let rsp = &req.ersp.rsp;
        rsp_cnt % conn.esrp_ratio == 0
            || req.cmd.is_fabric()
            || rsp.status & 0xfffe != 0
            || rsp.cdw0 != 0
            || rsp.cdw1 != 0
            || req.length != xfer_len
    }

    /// Emit the RSP or ERSP for a completed capsule.
    pub(crate) fn handle_rsp(&mut self, tag: ReqTag) -> Result<(), Errno> {
        let (sqhd, rsp_count) = {
            let conn = self.conn_mut(tag.conn).unwrap();
            let sqhd = conn.advance_sq_head();
            conn.rsp_count = conn.rsp_count.wrapping_add(1);
            (sqhd, conn.rsp_count)
        };
        self.req_mut(tag).unwrap().ersp.rsp.sqhd = sqhd;

        let xfer_len = self.req(tag).unwrap().transferred_len;
        let h = self.req(tag).unwrap().hwqp;
        let queue = self.hwqp(h).unwrap().queue;

        if self.send_ersp_required(tag, rsp_count, xfer_len) {
            let rsn = {
                let conn = self.conn_mut(tag.conn).unwrap();
                let rsn = conn.rsn;
                conn.rsn = conn.rsn.wrapping_add(1);
                rsn
            };
            let (io, bytes) = {
                let req = self.req_mut(tag).unwrap();
                req.ersp.ersp_len = (ERSP_IU_SIZE / 4) as u16;
                req.ersp.response_seq_no = rsn;
                req.ersp.transferred_data_len = xfer_len;
                (req.io_xmt(tag), req.ersp.to_bytes())
            };
            debug!("Posting ERSP");
            self.lld.post_response(queue, &io, Some(&bytes))
        } else {
            debug!("Posting RSP");
            let io = self.req(tag).unwrap().io_xmt(tag);
            self.lld.post_response(queue, &io, None)
        }
    }

    /// Completion from the NVMe-oF layer.
    pub fn request_complete(&mut self, tag: ReqTag, cpl: NvmeCpl) {
        let (h, is_aborted, xfer) = match self.req_mut(tag) {
            Some(req) => {
                let sqhd = req.ersp.rsp.sqhd;
                req.ersp.rsp = cpl;
                req.ersp.rsp.sqhd = sqhd;
                (req.hwqp, req.is_aborted, req.xfer)
            }
            None => return,
        };

        if is_aborted {
            // defer so the io cleanup never runs in this call stack
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
            return;
        }

        let rc = if cpl.is_success() && xfer == XferDir::ControllerToHost {
            self.set_req_state(tag, ReqState::ReadXfer);
            let queue = self.hwqp(h).unwrap().queue;
            let (io, length) = {
                let req = self.req(tag).unwrap();
                (req.io_xmt(tag), req.length)
            };
            self.lld.post_data_send(queue, &io, length)
        } else {
            let state = match xfer {
                XferDir::HostToController => ReqState::WriteRsp,
                XferDir::ControllerToHost => ReqState::ReadRsp,
                _ => ReqState::NoneRsp,
            };
            self.set_req_state(tag, state);
            self.handle_rsp(tag)
        };

        if rc.is_err() {
            error!("Error in request complete");
            self.request_release(tag);
        }
    }

    /// XFER_RDY went out and the write data has landed.
    pub fn write_data_received(&mut self, tag: ReqTag, status: i32) {
        let (h, is_aborted, length) = match self.req(tag) {
            Some(req) => (req.hwqp, req.is_aborted, req.length),
            None => return,
        };
        if is_aborted {
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
            return;
        }
        if status != 0 {
            error!("Write transfer failed");
            self.request_release(tag);
            return;
        }
        self.req_mut(tag).unwrap().transferred_len = length;
        self.set_req_state(tag, ReqState::WriteBdev);
        self.with_backend(|be, t| be.request_exec(t, tag));
    }

    /// Read data emission finished.
    pub fn read_data_sent(&mut self, tag: ReqTag, status: i32) {
        let (h, is_aborted, length) = match self.req(tag) {
            Some(req) => (req.hwqp, req.is_aborted, req.length),
            None => return,
        };
        if is_aborted {
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
            return;
        }
        if status != 0 {
            error!("Read transfer failed");
            self.request_release(tag);
            return;
        }
        self.req_mut(tag).unwrap().transferred_len = length;
        self.set_req_state(tag, ReqState::ReadRsp);
        if self.handle_rsp(tag).is_err() {
            self.request_release(tag);
        }
    }

    /// Response emission finished; the capsule is done.
    pub fn rsp_sent(&mut self, tag: ReqTag, status: i32) {
        let (h, is_aborted) = match self.req(tag) {
            Some(req) => (req.hwqp, req.is_aborted),
            None => return,
        };
        if is_aborted {
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
            return;
        }
        if status == 0 {
            self.set_req_state(tag, ReqState::Success);
        }
        self.request_release(tag);
    }

    /* ---------- free ---------- */

    /// Return everything the request holds and give it back to its pool.
    pub(crate) fn request_release(&mut self, tag: ReqTag) {
        let (h, xchg, buf_count, state) = match self.req_mut(tag) {
            Some(req) => {
                if req.magic == REQ_MAGIC_DEAD {
                    return;
                }
                (req.hwqp, req.xchg.take(), req.buf_count, req.state)
            }
            None => return,
        };

        if let Some(xchg) = xchg {
            let queue = self.hwqp(h).unwrap().queue;
            self.lld.release_xri(queue, xchg);
        }

        if buf_count > 0 {
            if let Some(g) = self.hwqp(h).and_then(|q| q.fgroup) {
                self.poll_groups.lock()[g].put_buffers(buf_count);
            }
            let req = self.req_mut(tag).unwrap();
            req.buf_count = 0;
            req.data_from_pool = false;
        }

        if state != ReqState::Success {
            // keep the terminal state visible for post-hoc diagnosis
            self.set_req_state(tag, ReqState::Failed);
        }

        if let Some(q) = self.hwqp_mut(h) {
            q.in_use_reqs.retain(|t| *t != tag);
        }
        self.conn_mut(tag.conn).unwrap().free_request(tag.idx);
    }

    /// Transport op the generic layer calls to drop a request it owns.
    pub fn request_free(&mut self, tag: ReqTag) {
        let is_aborted = match self.req(tag) {
            Some(req) => req.is_aborted,
            None => return,
        };
        if !is_aborted {
            self.set_req_state(tag, ReqState::BdevAborted);
            self.request_abort(tag, true, None);
        } else {
            self.request_abort_complete(tag);
        }
    }

    /* ---------- abort ---------- */

    /// Abort a request wherever it currently is. All paths converge on
    /// [`FcTransport::request_abort_complete`] on the owning HWQP.
    pub fn request_abort(
        &mut self,
        tag: ReqTag,
        send_abts: bool,
        cb: Option<AbortCb>,
    ) {
        let h = match self.req(tag) {
            Some(req) => req.hwqp,
            None => return,
        };
        if let Some(cb) = cb {
            self.req_mut(tag).unwrap().abort_cbs.push(cb);
        }

        if !self.req(tag).unwrap().is_aborted {
            self.hwqp_mut(h).unwrap().counters.num_aborted += 1;
        }

        let port_dead = self
            .hwqp(h)
            .and_then(|q| self.port(q.port_hdl))
            .map(|p| p.is_dead())
            .unwrap_or(false);

        if port_dead && self.req(tag).unwrap().in_xfer() {
            // no way to reach the driver any more
            self.req_mut(tag).unwrap().is_aborted = true;
            self.set_req_state(tag, ReqState::Aborted);
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
            return;
        }

        if self.req(tag).unwrap().is_aborted {
            return;
        }
        self.req_mut(tag).unwrap().is_aborted = true;

        let (state, xchg_id) = {
            let req = self.req_mut(tag).unwrap();
            if let Some(xchg) = req.xchg.as_mut() {
                xchg.send_abts = send_abts;
                xchg.aborted = true;
            }
            (req.state, req.xchg.as_ref().map(|x| x.xchg_id))
        };

        let complete = match state {
            ReqState::BdevAborted => true,
            ReqState::ReadBdev | ReqState::WriteBdev | ReqState::NoneBdev => {
                self.hwqp(h).unwrap().send_msg(PollerMsg::BdevAbort { tag });
                false
            }
            ReqState::ReadXfer
            | ReqState::ReadRsp
            | ReqState::WriteXfer
            | ReqState::WriteRsp
            | ReqState::NoneRsp => {
                let queue = self.hwqp(h).unwrap().queue;
                if send_abts {
                    self.hwqp_mut(h).unwrap().counters.num_abts_sent += 1;
                }
                if let Some(xchg_id) = xchg_id {
                    let _ = self.lld.issue_abort(queue, xchg_id, send_abts);
                }
                false
            }
            ReqState::Pending => {
                self.hwqp_mut(h).unwrap().pending_reqs.retain(|t| *t != tag);
                true
            }
            ReqState::FusedWaiting => {
                self.conn_mut(tag.conn)
                    .unwrap()
                    .fused_waiting
                    .retain(|i| *i != tag.idx);
                true
            }
            _ => {
                error!("Request in invalid state: {}", state.as_str());
                true
            }
        };

        if complete {
            self.set_req_state(tag, ReqState::Aborted);
            self.hwqp(h)
                .unwrap()
                .send_msg(PollerMsg::ReqAbortComplete { tag });
        }
    }

    /// Final stop of every abort path: free the request, then notify
    /// whoever was waiting for it.
    pub(crate) fn request_abort_complete(&mut self, tag: ReqTag) {
        let (state, cbs) = match self.req_mut(tag) {
            Some(req) => {
                (req.state, std::mem::replace(&mut req.abort_cbs, Vec::new()))
            }
            None => return,
        };
        info!(
            "FC Request({:?}) in state {} aborted",
            tag,
            state.as_str()
        );
        self.request_release(tag);
        for cb in cbs {
            match cb {
                AbortCb::ConnDelete { op } => self.conn_abort_done(op),
                AbortCb::Abts { op, hwqp } => self.abts_poller_done(op, hwqp),
            }
        }
    }

    /// A backend-state abort only has to deal with a parked AER; other
    /// admin and fabric commands run to completion.
    pub(crate) fn bdev_abort(&mut self, tag: ReqTag) {
        let (is_admin, opc) = {
            let req = match self.req(tag) {
                Some(r) => r,
                None => return,
            };
            let conn = self.conn(tag.conn).unwrap();
            (conn.is_admin_queue(), req.cmd.opc)
        };
        if is_admin && opc == NVME_OPC_ASYNC_EVENT_REQUEST {
            info!("Abort AER request");
            let conn = tag.conn;
            self.with_backend(|be, t| be.free_aer(t, conn));
        }
    }
}
