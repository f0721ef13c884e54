//! Shared test harness: a scripted low level driver, a scripted NVMe-oF
//! generic layer and helpers that build wire-accurate frames.

#![allow(dead_code)]

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use nix::errno::Errno;
use parking_lot::Mutex;

use nvmf_fc::{
    backend::NvmfBackend,
    config::FcConfig,
    fabric::{
        assoc::{AssocSerial, ConnKey, ReqTag},
        hwqp::HwqpId,
        port::Wwn,
    },
    lld::{
        BlsRsp, FcLldOps, FcSrsrBufs, FcXchg, IoXmt, LldCompletion, LldQueue,
    },
    ls::LsRequest,
    transport::{
        events::{EventCb, FcEvent, FcEventArgs},
        FcTransport,
    },
    wire::{
        frame::{
            FrameHdr, R_CTL_CMD_REQ, R_CTL_LS_REQUEST, TYPE_FC_EXCHANGE,
            TYPE_NVMF_DATA,
        },
        iu::{CmndIu, NvmeCmd, NvmeCpl, NVME_OPC_ASYNC_EVENT_REQUEST},
        ls::{CrAssocRqst, CrConnRqst, DisconnRqst},
    },
};

pub const PORT: u8 = 0;
pub const NPORT: u16 = 1;
pub const D_ID: u32 = 0x01_02_03;
pub const S_ID: u32 = 0x0a_0b_0c;
pub const RPI: u16 = 0x100;
pub const NODE_WWN: Wwn = Wwn(0x20_0000_0001);
pub const PORT_WWN: Wwn = Wwn(0x21_0000_0001);
pub const SUBNQN: &str =
    "nqn.2017-11.io.spdk:sn.390c0dc7c87b4304b85c8ca48c28e635:subsystem.good";
pub const HOSTNQN: &str = "nqn.2017-11.fc_host";

pub const LS_QUEUE: LldQueue = 100;
pub const IO_QUEUE_BASE: LldQueue = 200;

/* ---------- mock low level driver ---------- */

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutKind {
    XferRdy,
    Data,
    Rsp,
}

pub struct MockState {
    pub xri_capacity: usize,
    pub xri_in_use: usize,
    next_xri: u32,
    next_conn: u64,
    pub queues: Vec<LldQueue>,
    pub auto_complete: bool,
    pub auto_sync: bool,
    pub ls_rsp_fail: bool,
    pub sync_support: bool,
    /// (oxid, response bytes)
    pub sent_ls_rsps: Vec<(u16, Vec<u8>)>,
    pub sent_bls: Vec<BlsRsp>,
    pub sent_srsr: Vec<Vec<u8>>,
    pub posted_rsp: Vec<(IoXmt, Option<Vec<u8>>)>,
    pub aborts: Vec<(u32, bool)>,
    pub sync_markers: Vec<(LldQueue, u64, u16)>,
    pub released_bufs: Vec<(LldQueue, u32)>,
    pub conn_assignments: Vec<(u16, u64)>,
    outstanding: Vec<(LldQueue, OutKind, IoXmt)>,
    completions: HashMap<LldQueue, VecDeque<LldCompletion>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            xri_capacity: 64,
            xri_in_use: 0,
            next_xri: 0,
            next_conn: 0,
            queues: Vec::new(),
            auto_complete: true,
            auto_sync: true,
            ls_rsp_fail: false,
            sync_support: true,
            sent_ls_rsps: Vec::new(),
            sent_bls: Vec::new(),
            sent_srsr: Vec::new(),
            posted_rsp: Vec::new(),
            aborts: Vec::new(),
            sync_markers: Vec::new(),
            released_bufs: Vec::new(),
            conn_assignments: Vec::new(),
            outstanding: Vec::new(),
            completions: HashMap::new(),
        }
    }
}

#[derive(Clone)]
pub struct MockLld(pub Arc<Mutex<MockState>>);

impl MockLld {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(MockState::default())))
    }

    pub fn complete(&self, q: LldQueue, c: LldCompletion) {
        self.0.lock().completions.entry(q).or_default().push_back(c);
    }

    pub fn outstanding_count(&self) -> usize {
        self.0.lock().outstanding.len()
    }
}

impl FcLldOps for MockLld {
    fn init_queue(
        &mut self,
        q: LldQueue,
        _hwqp_id: u16,
        _rq_size: u32,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        s.queues.push(q);
        s.completions.entry(q).or_default();
        Ok(())
    }

    fn reinit_queue(&mut self, _q_prev: LldQueue, _q_curr: LldQueue) {}

    fn set_queue_online(
        &mut self,
        _q: LldQueue,
        _online: bool,
    ) -> Result<(), Errno> {
        Ok(())
    }

    fn acquire_xri(&mut self, _q: LldQueue) -> Option<FcXchg> {
        let mut s = self.0.lock();
        if s.xri_in_use >= s.xri_capacity {
            return None;
        }
        s.xri_in_use += 1;
        s.next_xri += 1;
        Some(FcXchg::new(s.next_xri))
    }

    fn release_xri(&mut self, _q: LldQueue, _xchg: FcXchg) {
        let mut s = self.0.lock();
        assert!(s.xri_in_use > 0, "XRI released twice");
        s.xri_in_use -= 1;
    }

    fn post_xfer_ready(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        _offset: u32,
        _burst_len: u32,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        if s.auto_complete {
            s.completions.entry(q).or_default().push_back(
                LldCompletion::XferRdyDone {
                    tag: io.tag,
                    status: 0,
                },
            );
        } else {
            s.outstanding.push((q, OutKind::XferRdy, *io));
        }
        Ok(())
    }

    fn post_data_send(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        _data_len: u32,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        if s.auto_complete {
            s.completions.entry(q).or_default().push_back(
                LldCompletion::DataSendDone {
                    tag: io.tag,
                    status: 0,
                },
            );
        } else {
            s.outstanding.push((q, OutKind::Data, *io));
        }
        Ok(())
    }

    fn post_response(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        ersp: Option<&[u8]>,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        s.posted_rsp.push((*io, ersp.map(|b| b.to_vec())));
        if s.auto_complete {
            s.completions.entry(q).or_default().push_back(
                LldCompletion::RspDone {
                    tag: io.tag,
                    status: 0,
                },
            );
        } else {
            s.outstanding.push((q, OutKind::Rsp, *io));
        }
        Ok(())
    }

    fn post_ls_response(
        &mut self,
        q: LldQueue,
        ls: LsRequest,
    ) -> Result<(), (Errno, LsRequest)> {
        let mut s = self.0.lock();
        if s.ls_rsp_fail {
            return Err((Errno::EIO, ls));
        }
        s.sent_ls_rsps
            .push((ls.oxid, ls.rsp[.. ls.rsp_len].to_vec()));
        // the driver owns the exchange and buffer from here; give the
        // buffer straight back
        s.released_bufs.push((q, ls.buf_index));
        if ls.xchg.is_some() {
            assert!(s.xri_in_use > 0);
            s.xri_in_use -= 1;
        }
        Ok(())
    }

    fn issue_abort(
        &mut self,
        _q: LldQueue,
        xchg_id: u32,
        send_abts: bool,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        s.aborts.push((xchg_id, send_abts));
        // any outstanding emission on this exchange completes canceled
        let mut i = 0;
        while i < s.outstanding.len() {
            if s.outstanding[i].2.xchg_id == Some(xchg_id) {
                let (q, kind, io) = s.outstanding.remove(i);
                let status = -(Errno::ECANCELED as i32);
                let c = match kind {
                    OutKind::XferRdy => LldCompletion::XferRdyDone {
                        tag: io.tag,
                        status,
                    },
                    OutKind::Data => LldCompletion::DataSendDone {
                        tag: io.tag,
                        status,
                    },
                    OutKind::Rsp => LldCompletion::RspDone {
                        tag: io.tag,
                        status,
                    },
                };
                s.completions.entry(q).or_default().push_back(c);
            } else {
                i += 1;
            }
        }
        Ok(())
    }

    fn post_bls_response(
        &mut self,
        _q: LldQueue,
        bls: BlsRsp,
    ) -> Result<(), Errno> {
        self.0.lock().sent_bls.push(bls);
        Ok(())
    }

    fn post_srsr_request(
        &mut self,
        _q: LldQueue,
        bufs: FcSrsrBufs,
    ) -> Result<(), (Errno, FcSrsrBufs)> {
        self.0.lock().sent_srsr.push(bufs.rqst.clone());
        Ok(())
    }

    fn queue_sync_available(&self) -> bool {
        self.0.lock().sync_support
    }

    fn issue_queue_sync_marker(
        &mut self,
        q: LldQueue,
        u_id: u64,
        skip_rq: u16,
    ) -> Result<(), Errno> {
        let mut s = self.0.lock();
        s.sync_markers.push((q, u_id, skip_rq));
        if s.auto_sync {
            let queues = s.queues.clone();
            for qq in queues {
                s.completions
                    .entry(qq)
                    .or_default()
                    .push_back(LldCompletion::QueueSyncDone { u_id });
            }
        }
        Ok(())
    }

    fn release_rq_buffer(&mut self, q: LldQueue, buf_index: u32) {
        self.0.lock().released_bufs.push((q, buf_index));
    }

    fn poll_queue(&mut self, q: LldQueue) -> Vec<LldCompletion> {
        let mut s = self.0.lock();
        match s.completions.get_mut(&q) {
            Some(pending) => pending.drain(..).collect(),
            None => Vec::new(),
        }
    }

    fn assign_conn_to_hwqp(
        &mut self,
        _q: LldQueue,
        hwqp_id: u16,
        _sq_size: u16,
    ) -> Option<u64> {
        let mut s = self.0.lock();
        s.next_conn += 1;
        let conn_id = (s.next_conn << 8) | u64::from(hwqp_id & 0xff);
        s.conn_assignments.push((hwqp_id, conn_id));
        Some(conn_id)
    }

    fn release_conn(&mut self, _q: LldQueue, _conn_id: u64, _sq_size: u16) {}

    fn alloc_srsr_bufs(
        &mut self,
        rqst_len: usize,
        rsp_len: usize,
    ) -> Option<FcSrsrBufs> {
        Some(FcSrsrBufs {
            rqst: Vec::with_capacity(rqst_len),
            rsp_len,
            rpi: 0,
        })
    }

    fn free_srsr_bufs(&mut self, _bufs: FcSrsrBufs) {}
}

/* ---------- scripted generic layer ---------- */

pub struct BackendState {
    /// (subnqn, allowed host nqns; empty allows everyone)
    pub subsystems: Vec<(String, Vec<String>)>,
    pub pg: usize,
    pub auto_activate: bool,
    pub auto_complete: bool,
    pub exec_reqs: Vec<ReqTag>,
    pub disconnects: Vec<ConnKey>,
    pub freed_aers: Vec<ConnKey>,
    pub listeners: Vec<(u8, u16)>,
    pub fatal_assocs: Vec<AssocSerial>,
}

#[derive(Clone)]
pub struct TestBackend(pub Arc<Mutex<BackendState>>);

impl TestBackend {
    pub fn new(subsystems: Vec<(String, Vec<String>)>) -> Self {
        Self(Arc::new(Mutex::new(BackendState {
            subsystems,
            pg: 0,
            auto_activate: true,
            auto_complete: true,
            exec_reqs: Vec::new(),
            disconnects: Vec::new(),
            freed_aers: Vec::new(),
            listeners: Vec::new(),
            fatal_assocs: Vec::new(),
        })))
    }
}

impl NvmfBackend for TestBackend {
    fn find_subsystem(&mut self, subnqn: &str) -> bool {
        self.0.lock().subsystems.iter().any(|(nqn, _)| nqn == subnqn)
    }

    fn host_allowed(&mut self, subnqn: &str, hostnqn: &str) -> bool {
        self.0
            .lock()
            .subsystems
            .iter()
            .find(|(nqn, _)| nqn == subnqn)
            .map(|(_, hosts)| {
                hosts.is_empty() || hosts.iter().any(|h| h == hostnqn)
            })
            .unwrap_or(false)
    }

    fn new_qpair(&mut self, t: &mut FcTransport, conn: ConnKey) {
        let (pg, auto_activate) = {
            let s = self.0.lock();
            (s.pg, s.auto_activate)
        };
        if t.poll_group_add(pg, conn).is_err() {
            t.qpair_fini(conn, None);
            return;
        }
        if auto_activate {
            t.qpair_activate(conn);
        }
    }

    fn request_exec(&mut self, t: &mut FcTransport, tag: ReqTag) {
        let auto = {
            let mut s = self.0.lock();
            s.exec_reqs.push(tag);
            s.auto_complete
        };
        if auto {
            let cid = t.req(tag).map(|r| r.cmd.cid).unwrap_or(0);
            let mut cpl = NvmeCpl::default();
            cpl.cid = cid;
            t.request_complete(tag, cpl);
        }
    }

    fn qpair_disconnect(
        &mut self,
        t: &mut FcTransport,
        conn: ConnKey,
        op: u64,
    ) {
        self.0.lock().disconnects.push(conn);
        t.qpair_disconnect_complete(op);
    }

    fn free_aer(&mut self, t: &mut FcTransport, conn: ConnKey) {
        self.0.lock().freed_aers.push(conn);
        let aer = t.conn(conn).and_then(|c| {
            c.in_use_reqs
                .iter()
                .find(|idx| {
                    c.request(**idx)
                        .map(|r| r.cmd.opc == NVME_OPC_ASYNC_EVENT_REQUEST)
                        .unwrap_or(false)
                })
                .copied()
        });
        if let Some(idx) = aer {
            t.request_free(ReqTag { conn, idx });
        }
    }

    fn add_listener(
        &mut self,
        _t: &mut FcTransport,
        port: u8,
        nport: u16,
    ) -> Result<(), Errno> {
        self.0.lock().listeners.push((port, nport));
        Ok(())
    }

    fn remove_listener(
        &mut self,
        _t: &mut FcTransport,
        port: u8,
        nport: u16,
    ) -> Result<(), Errno> {
        self.0.lock().listeners.retain(|l| *l != (port, nport));
        Ok(())
    }

    fn ctrlr_fatal(&mut self, _t: &mut FcTransport, assoc: AssocSerial) {
        self.0.lock().fatal_assocs.push(assoc);
    }
}

/* ---------- harness ---------- */

pub struct TestCtx {
    pub t: FcTransport,
    pub lld: MockLld,
    pub be: TestBackend,
    pub pg: usize,
    next_buf: u32,
}

pub fn setup() -> TestCtx {
    setup_with(FcConfig::default())
}

pub fn setup_with(config: FcConfig) -> TestCtx {
    nvmf_fc::logger::init("info");
    let lld = MockLld::new();
    let be =
        TestBackend::new(vec![(SUBNQN.to_string(), vec![HOSTNQN.to_string()])]);
    let mut t = FcTransport::create(
        config,
        Box::new(lld.clone()),
        Box::new(be.clone()),
    )
    .unwrap();
    let pg = t.poll_group_create();
    TestCtx {
        t,
        lld,
        be,
        pg,
        next_buf: 0,
    }
}

pub type EventLog = Arc<Mutex<Vec<(FcEvent, i32)>>>;

pub fn event_log() -> EventLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn record_cb(log: &EventLog) -> EventCb {
    let log = log.clone();
    Box::new(move |_port, event, err| log.lock().push((event, err)))
}

/// Drive every executor until the transport goes quiet. Queues already
/// detached from their poll group are drained directly, the way their
/// (now idle) thread would.
pub fn pump(ctx: &mut TestCtx) {
    for _ in 0 .. 64 {
        let mut n = 0;
        n += ctx.t.accept_poll();
        n += ctx.t.poll_group_poll(ctx.pg);
        let ios: Vec<HwqpId> = ctx
            .t
            .port(PORT)
            .map(|p| p.io_hwqps.clone())
            .unwrap_or_default();
        for h in ios {
            n += ctx.t.poll_hwqp(h);
        }
        if n == 0 {
            return;
        }
    }
    panic!("transport did not go quiet");
}

/// Bring up a port with `num_io` IO queues, one nport and one logged-in
/// initiator.
pub fn setup_port(ctx: &mut TestCtx, num_io: usize) {
    let log = event_log();
    ctx.t.enqueue_event(
        FcEventArgs::HwPortInit {
            port_handle: PORT,
            ls_queue: LS_QUEUE,
            ls_queue_size: 16,
            io_queues: (0 .. num_io)
                .map(|i| IO_QUEUE_BASE + i as u64)
                .collect(),
            io_queue_size: 128,
            fcp_rq_id: 4,
        },
        Some(record_cb(&log)),
    );
    ctx.t.enqueue_event(
        FcEventArgs::HwPortOnline { port_handle: PORT },
        Some(record_cb(&log)),
    );
    ctx.t.enqueue_event(
        FcEventArgs::NportCreate {
            port_handle: PORT,
            nport_handle: NPORT,
            d_id: D_ID,
            fc_nodename: NODE_WWN,
            fc_portname: PORT_WWN,
        },
        Some(record_cb(&log)),
    );
    ctx.t.enqueue_event(
        FcEventArgs::ItAdd {
            port_handle: PORT,
            nport_handle: NPORT,
            rpi: RPI,
            s_id: S_ID,
            initiator_prli_info: 0x20,
            fc_nodename: Wwn(0x20_0000_0099),
            fc_portname: Wwn(0x21_0000_0099),
        },
        Some(record_cb(&log)),
    );
    pump(ctx);
    let events = log.lock();
    assert_eq!(events.len(), 4);
    for (event, err) in events.iter() {
        assert_eq!(*err, 0, "{:?} failed", event);
    }
}

pub fn next_buf(ctx: &mut TestCtx) -> u32 {
    ctx.next_buf += 1;
    ctx.next_buf
}

/* ---------- frame builders ---------- */

pub fn ls_frame(oxid: u16) -> Vec<u8> {
    let hdr = FrameHdr {
        r_ctl: R_CTL_LS_REQUEST,
        d_id: D_ID,
        cs_ctl: 0,
        s_id: S_ID,
        ftype: TYPE_NVMF_DATA,
        f_ctl: 0,
        seq_id: 0,
        df_ctl: 0,
        seq_cnt: 0,
        ox_id: oxid,
        rx_id: 0xffff,
        parameter: 0,
    };
    let mut buf = Vec::new();
    hdr.encode(&mut buf);
    buf
}

pub fn cmd_frame(oxid: u16) -> Vec<u8> {
    let hdr = FrameHdr {
        r_ctl: R_CTL_CMD_REQ,
        d_id: D_ID,
        cs_ctl: 0,
        s_id: S_ID,
        ftype: TYPE_FC_EXCHANGE,
        f_ctl: 0,
        seq_id: 0,
        df_ctl: 0,
        seq_cnt: 0,
        ox_id: oxid,
        rx_id: 0xffff,
        parameter: 0,
    };
    let mut buf = Vec::new();
    hdr.encode(&mut buf);
    buf
}

pub fn cass_payload(sqsize: u16, ersp_ratio: u16) -> Vec<u8> {
    let rqst = CrAssocRqst {
        ersp_ratio,
        sqsize,
        hostid: *b"0123456789abcdef",
        hostnqn: HOSTNQN.to_string(),
        subnqn: SUBNQN.to_string(),
        ..Default::default()
    };
    let mut buf = Vec::new();
    rqst.encode(&mut buf);
    buf
}

pub fn cioc_payload(
    assoc_id: u64,
    qid: u16,
    sqsize: u16,
    ersp_ratio: u16,
) -> Vec<u8> {
    let rqst = CrConnRqst {
        assoc_id,
        qid,
        sqsize,
        ersp_ratio,
        ..Default::default()
    };
    let mut buf = Vec::new();
    rqst.encode(&mut buf);
    buf
}

pub fn disc_payload(assoc_id: u64) -> Vec<u8> {
    let rqst = DisconnRqst {
        assoc_id,
        ..Default::default()
    };
    let mut buf = Vec::new();
    rqst.encode(&mut buf);
    buf
}

pub fn cmnd_payload(
    conn_id: u64,
    flags: u8,
    data_len: u32,
    cmd: NvmeCmd,
) -> Vec<u8> {
    let mut iu = CmndIu::for_conn(conn_id, flags, cmd);
    iu.data_len = data_len;
    let mut buf = Vec::new();
    iu.encode(&mut buf);
    buf
}

/* ---------- driving helpers ---------- */

/// Inject an LS request on the port's LS queue.
pub fn send_ls(ctx: &mut TestCtx, oxid: u16, payload: &[u8]) {
    let ls_hwqp = ctx.t.port(PORT).unwrap().ls_hwqp;
    let frame = ls_frame(oxid);
    let buf = next_buf(ctx);
    ctx.t
        .process_frame(ls_hwqp, buf, &frame, payload)
        .expect("LS frame dropped");
}

/// Inject an FCP command capsule on the HWQP owning `conn_id`.
pub fn send_cmd(
    ctx: &mut TestCtx,
    conn_id: u64,
    oxid: u16,
    flags: u8,
    data_len: u32,
    cmd: NvmeCmd,
) -> Result<(), Errno> {
    let h = io_hwqp(ctx, conn_id);
    let frame = cmd_frame(oxid);
    let payload = cmnd_payload(conn_id, flags, data_len, cmd);
    let buf = next_buf(ctx);
    ctx.t.process_frame(h, buf, &frame, &payload)
}

/// Arena id of the IO HWQP encoded in a connection id's low byte.
pub fn io_hwqp(ctx: &TestCtx, conn_id: u64) -> HwqpId {
    let hwqp_id = (conn_id & 0xff) as u16;
    let port = ctx.t.port(PORT).unwrap();
    *port
        .io_hwqps
        .iter()
        .find(|h| ctx.t.hwqp(**h).unwrap().hwqp_id == hwqp_id)
        .expect("no hwqp for conn id")
}

/// Connection key reachable through its HWQP's lookup table.
pub fn conn_key(ctx: &TestCtx, conn_id: u64) -> ConnKey {
    let h = io_hwqp(ctx, conn_id);
    ctx.t
        .hwqp(h)
        .unwrap()
        .find_conn(conn_id)
        .expect("conn not registered")
}

/// Create an association (CASS) and return (assoc_id, admin conn_id).
pub fn create_association(ctx: &mut TestCtx, oxid: u16) -> (u64, u64) {
    let before = ctx.lld.0.lock().sent_ls_rsps.len();
    let payload = cass_payload(32, 16);
    send_ls(ctx, oxid, &payload);
    pump(ctx);
    let s = ctx.lld.0.lock();
    assert_eq!(s.sent_ls_rsps.len(), before + 1, "no CASS response");
    let (rsp_oxid, bytes) = s.sent_ls_rsps.last().unwrap();
    assert_eq!(*rsp_oxid, oxid);
    let (hdr, acc) =
        nvmf_fc::wire::ls::CrAssocAcc::decode(bytes).expect("not an accept");
    assert_eq!(hdr.ls_cmd, nvmf_fc::wire::ls::LS_ACC);
    (acc.assoc_id, acc.conn_id)
}
