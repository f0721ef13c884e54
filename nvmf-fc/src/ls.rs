//! The LS command processor: Create Association, Create Connection and
//! Disconnect, plus the teardown chains they share with the
//! administrative plane.

use crate::{
    error::Error,
    fabric::{
        assoc::{
            AssocSerial, ConnKey, DelAssocCb, DelConnCb, DelConnDone,
            FcAssociation, LsAcc, LsAddConnCtx, QpairState, ReqTag,
        },
        hwqp::HwqpId,
        port::{traddr, ObjState},
    },
    lld::FcXchg,
    poller::{PollerApiRet, PollerCbCtx, PollerMsg},
    request::AbortCb,
    transport::{DelConnOp, FcTransport, OpCtx},
    wire::{
        frame::FrameHdr,
        ls::{
            self, encode_disconnect_acc, format_rjt, CrAssocAcc, CrAssocRqst,
            CrConnAcc, CrConnRqst, DisconnRqst, CA_CMD_MIN_LEN,
            CA_DESC_LIST_MIN_LEN, CA_DESC_MIN_LEN, CR_ASSOC_ACC_SIZE,
            CR_CONN_ACC_SIZE, CR_CONN_RQST_SIZE, DISCONNECT_ACC_SIZE,
            DISCONNECT_RQST_SIZE, LSDESC_ASSOC_ID_SIZE,
            LSDESC_CREATE_ASSOC_CMD, LSDESC_CREATE_CONN_CMD,
            LSDESC_CR_CONN_CMD_SIZE, LSDESC_DISCONN_CMD,
            LSDESC_DISCONN_CMD_SIZE, LS_CREATE_ASSOCIATION,
            LS_CREATE_CONNECTION, LS_DISCONNECT, LS_RJT_SIZE,
        },
    },
};

/// An inbound link service exchange making its way to a response. Owns a
/// copy of the request payload and the response scratch buffer; the RQ
/// buffer index travels along so the buffer can be returned to the chip
/// exactly once.
pub struct LsRequest {
    pub rqst: Vec<u8>,
    pub rsp: Vec<u8>,
    pub rsp_len: usize,
    pub rpi: u16,
    pub oxid: u16,
    pub s_id: u32,
    pub d_id: u32,
    pub port_hdl: u8,
    pub nport_hdl: u16,
    pub hwqp: HwqpId,
    pub buf_index: u32,
    pub xchg: Option<FcXchg>,
}

impl std::fmt::Debug for LsRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsRequest")
            .field("oxid", &self.oxid)
            .field("rpi", &self.rpi)
            .field("s_id", &self.s_id)
            .field("d_id", &self.d_id)
            .field("rqst_len", &self.rqst.len())
            .finish()
    }
}

pub(crate) enum NportLookupErr {
    NoNport,
    NoRport,
}

impl FcTransport {
    /* ---------- lookup helpers ---------- */

    /// Resolve the nport and remote port a frame on this queue belongs
    /// to, by D_ID and S_ID.
    pub(crate) fn find_nport_and_rport(
        &self,
        h: HwqpId,
        d_id: u32,
        s_id: u32,
    ) -> Result<(u8, u16, u16, ObjState, ObjState), NportLookupErr> {
        let port_hdl = self
            .hwqp(h)
            .map(|q| q.port_hdl)
            .ok_or(NportLookupErr::NoNport)?;
        let port = self.port(port_hdl).ok_or(NportLookupErr::NoNport)?;
        let nport = port
            .nports
            .iter()
            .find(|n| n.d_id == d_id)
            .ok_or(NportLookupErr::NoNport)?;
        let rport = nport
            .rports
            .iter()
            .find(|r| r.s_id == s_id)
            .ok_or(NportLookupErr::NoRport)?;
        Ok((
            port_hdl,
            nport.nport_hdl,
            rport.rpi,
            nport.state,
            rport.state,
        ))
    }

    pub(crate) fn find_assoc(
        &self,
        port_hdl: u8,
        nport_hdl: u16,
        assoc_id: u64,
    ) -> Option<AssocSerial> {
        let nport = self.nport(port_hdl, nport_hdl)?;
        for serial in &nport.assocs {
            if let Some(assoc) = self.assoc(*serial) {
                if assoc.assoc_id == assoc_id {
                    if assoc.state == ObjState::Zombie {
                        return None;
                    }
                    return Some(*serial);
                }
            }
        }
        None
    }

    /* ---------- LS frame intake ---------- */

    pub(crate) fn process_ls_frame(
        &mut self,
        h: HwqpId,
        buf_index: u32,
        hdr: &FrameHdr,
        payload: &[u8],
    ) -> Result<(), nix::errno::Errno> {
        debug!("Process LS NVME frame");
        let queue = self.hwqp(h).unwrap().queue;

        let lookup = self.find_nport_and_rport(h, hdr.d_id, hdr.s_id);
        let (port_hdl, nport_hdl, rpi, nport_state, rport_state) = match lookup
        {
            Ok(t) => t,
            Err(NportLookupErr::NoNport) => {
                error!("Nport not found. Dropping");
                self.hwqp_mut(h).unwrap().counters.nport_invalid += 1;
                self.lld.release_rq_buffer(queue, buf_index);
                return Err(nix::errno::Errno::ENOENT);
            }
            Err(NportLookupErr::NoRport) => {
                error!("Rport not found. Dropping");
                self.hwqp_mut(h).unwrap().counters.rport_invalid += 1;
                self.lld.release_rq_buffer(queue, buf_index);
                return Err(nix::errno::Errno::ENOENT);
            }
        };

        if nport_state != ObjState::Created || rport_state != ObjState::Created
        {
            error!(
                "{} state not created. Dropping",
                if nport_state != ObjState::Created {
                    "Nport"
                } else {
                    "Rport"
                }
            );
            self.lld.release_rq_buffer(queue, buf_index);
            return Err(nix::errno::Errno::EACCES);
        }

        let mut ls_rqst = LsRequest {
            rqst: payload.to_vec(),
            rsp: Self::new_ls_rsp_buf(),
            rsp_len: 0,
            rpi,
            oxid: hdr.ox_id,
            s_id: hdr.s_id,
            d_id: hdr.d_id,
            port_hdl,
            nport_hdl,
            hwqp: h,
            buf_index,
            xchg: None,
        };

        if self.hwqp(h).unwrap().ls_pending.is_empty() {
            ls_rqst.xchg = self.lld.acquire_xri(queue);
        }

        if ls_rqst.xchg.is_some() {
            self.handle_ls_rqst(ls_rqst);
        } else {
            // no exchange available, retried from the poller
            self.hwqp_mut(h).unwrap().counters.no_xchg += 1;
            self.hwqp_mut(h).unwrap().ls_pending.push_back(ls_rqst);
        }
        Ok(())
    }

    /// Retry pending LS requests head first until the XRIs run dry.
    pub(crate) fn process_pending_ls_rqsts(&mut self, h: HwqpId) {
        let queue = match self.hwqp(h) {
            Some(q) => q.queue,
            None => return,
        };
        loop {
            let mut ls_rqst =
                match self.hwqp_mut(h).unwrap().ls_pending.pop_front() {
                    Some(ls) => ls,
                    None => return,
                };

            let lookup =
                self.find_nport_and_rport(h, ls_rqst.d_id, ls_rqst.s_id);
            match lookup {
                Err(NportLookupErr::NoNport) => {
                    error!("Nport not found. Dropping");
                    self.hwqp_mut(h).unwrap().counters.nport_invalid += 1;
                    self.release_ls_rqst(ls_rqst);
                    continue;
                }
                Err(NportLookupErr::NoRport) => {
                    error!("Rport not found. Dropping");
                    self.hwqp_mut(h).unwrap().counters.rport_invalid += 1;
                    self.release_ls_rqst(ls_rqst);
                    continue;
                }
                Ok((_, _, _, nport_state, rport_state)) => {
                    if nport_state != ObjState::Created
                        || rport_state != ObjState::Created
                    {
                        error!("Nport/Rport state not created. Dropping");
                        self.release_ls_rqst(ls_rqst);
                        continue;
                    }
                }
            }

            match self.lld.acquire_xri(queue) {
                Some(xchg) => {
                    ls_rqst.xchg = Some(xchg);
                    self.handle_ls_rqst(ls_rqst);
                }
                None => {
                    // out of XRIs, stop processing
                    self.hwqp_mut(h).unwrap().counters.no_xchg += 1;
                    self.hwqp_mut(h).unwrap().ls_pending.push_front(ls_rqst);
                    return;
                }
            }
        }
    }

    /// Drop queued LS requests belonging to a remote port that is going
    /// away. No response is generated.
    pub(crate) fn delete_ls_pending(
        &mut self,
        h: HwqpId,
        d_id: u32,
        s_id: u32,
    ) -> usize {
        let mut doomed = Vec::new();
        if let Some(q) = self.hwqp_mut(h) {
            let mut keep = std::collections::VecDeque::new();
            while let Some(ls) = q.ls_pending.pop_front() {
                if ls.d_id == d_id && ls.s_id == s_id {
                    doomed.push(ls);
                } else {
                    keep.push_back(ls);
                }
            }
            q.ls_pending = keep;
        }
        let num = doomed.len();
        for ls in doomed {
            self.release_ls_rqst(ls);
        }
        num
    }

    /// Return the exchange and the RQ buffer without emitting a response.
    pub(crate) fn release_ls_rqst(&mut self, mut ls_rqst: LsRequest) {
        let queue = match self.hwqp(ls_rqst.hwqp) {
            Some(q) => q.queue,
            None => return,
        };
        if let Some(xchg) = ls_rqst.xchg.take() {
            self.lld.release_xri(queue, xchg);
        }
        self.lld.release_rq_buffer(queue, ls_rqst.buf_index);
    }

    /// Send an LS response. On failure the request is cleaned up here.
    pub(crate) fn xmt_ls_rsp(&mut self, ls_rqst: LsRequest) -> Result<(), ()> {
        let queue = match self.hwqp(ls_rqst.hwqp) {
            Some(q) => q.queue,
            None => {
                self.release_ls_rqst(ls_rqst);
                return Err(());
            }
        };
        match self.lld.post_ls_response(queue, ls_rqst) {
            Ok(()) => Ok(()),
            Err((e, ls_rqst)) => {
                error!("Send LS response failed: {}", e);
                self.release_ls_rqst(ls_rqst);
                Err(())
            }
        }
    }

    /* ---------- LS command dispatch ---------- */

    pub(crate) fn handle_ls_rqst(&mut self, ls_rqst: LsRequest) {
        let ls_cmd = ls_rqst.rqst.first().copied().unwrap_or(0);
        debug!("LS cmd={}", ls_cmd);
        match ls_cmd {
            LS_CREATE_ASSOCIATION => self.ls_process_cass(ls_rqst),
            LS_CREATE_CONNECTION => self.ls_process_cioc(ls_rqst),
            LS_DISCONNECT => self.ls_process_disc(ls_rqst),
            _ => {
                error!("Invalid LS cmd={}", ls_cmd);
                let mut ls_rqst = ls_rqst;
                ls_rqst.rsp_len = format_rjt(
                    &mut ls_rqst.rsp,
                    ls_cmd,
                    ls::RJT_RC_INVAL,
                    ls::RJT_EXP_NONE,
                    0,
                );
                let _ = self.xmt_ls_rsp(ls_rqst);
            }
        }
    }

    fn ls_reject(
        &mut self,
        mut ls_rqst: LsRequest,
        ls_cmd: u8,
        reason: u8,
        explanation: u8,
    ) {
        ls_rqst.rsp_len =
            format_rjt(&mut ls_rqst.rsp, ls_cmd, reason, explanation, 0);
        let _ = self.xmt_ls_rsp(ls_rqst);
    }

    fn ls_process_cass(&mut self, ls_rqst: LsRequest) {
        let rqst_len = ls_rqst.rqst.len();
        if rqst_len < CA_CMD_MIN_LEN {
            error!(
                "assoc_cmd req len = {}, should be at least {}",
                rqst_len, CA_CMD_MIN_LEN
            );
            error!("Create Association LS failed: Bad CR_ASSOC Length");
            return self.ls_reject(
                ls_rqst,
                LS_CREATE_ASSOCIATION,
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
            );
        }

        let rqst = CrAssocRqst::decode(&ls_rqst.rqst)
            .expect("length checked above");

        debug!(
            "LS_CASS: ls_rqst_len={}, desc_list_len={}, cmd_len={}, \
             sq_size={}, subnqn: {}, hostnqn: {}",
            rqst_len,
            rqst.desc_list_len,
            rqst.desc_len,
            rqst.sqsize,
            rqst.subnqn,
            rqst.hostnqn
        );

        let (rc, ec, errmsg) = if rqst.desc_list_len < CA_DESC_LIST_MIN_LEN {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad CR_ASSOC Rqst Length",
            )
        } else if rqst.desc_tag != LSDESC_CREATE_ASSOC_CMD {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_NONE, "Not CR_ASSOC Cmd")
        } else if rqst.desc_len < CA_DESC_MIN_LEN {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad CR_ASSOC Cmd Length",
            )
        } else if rqst.sqsize == 0 || rqst.sqsize > self.opts.max_aq_depth {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_SQ_SIZE,
                "SQ size = 0 or too big",
            )
        } else if rqst.ersp_ratio == 0 || rqst.ersp_ratio >= rqst.sqsize {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_INV_ESRP, "Bad Ersp Ratio")
        } else {
            (ls::RJT_RC_NONE, ls::RJT_EXP_NONE, "")
        };

        if rc != ls::RJT_RC_NONE {
            error!("Create Association LS failed: {}", errmsg);
            return self.ls_reject(ls_rqst, LS_CREATE_ASSOCIATION, rc, ec);
        }

        if !self
            .backend
            .as_mut()
            .expect("generic layer re-entered")
            .find_subsystem(&rqst.subnqn)
        {
            error!(
                "Create Association LS failed: Invalid subnqn or subsystem \
                 not found"
            );
            return self.ls_reject(
                ls_rqst,
                LS_CREATE_ASSOCIATION,
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_SUBNQN,
            );
        }

        if !self
            .backend
            .as_mut()
            .expect("generic layer re-entered")
            .host_allowed(&rqst.subnqn, &rqst.hostnqn)
        {
            error!(
                "Create Association LS failed: Invalid hostnqn or subsystem \
                 doesn't allow host"
            );
            return self.ls_reject(
                ls_rqst,
                LS_CREATE_ASSOCIATION,
                ls::RJT_RC_INV_HOST,
                ls::RJT_EXP_INV_HOSTNQN,
            );
        }

        // build the association and its admin connection
        let serial = self.new_association(&ls_rqst, &rqst);
        let (d_id, trid) = {
            let nport = self
                .nport(ls_rqst.port_hdl, ls_rqst.nport_hdl)
                .expect("nport checked on receive");
            (nport.d_id, traddr(nport.fc_nodename, nport.fc_portname))
        };
        let slot = {
            let rpi = ls_rqst.rpi;
            let assoc = self.assoc_mut(serial).unwrap();
            assoc
                .new_connection(0, rqst.ersp_ratio, rpi, rqst.sqsize, d_id, trid)
                .expect("fresh association has a free admin slot")
        };
        let conn_key = ConnKey {
            assoc: serial,
            slot,
        };

        // the accept carries ids assigned once the poller owns the
        // connection
        let acc = LsAcc::Assoc(CrAssocAcc::default());
        self.ls_add_conn_to_poller(serial, ls_rqst, conn_key, acc);
    }

    fn ls_process_cioc(&mut self, ls_rqst: LsRequest) {
        let rqst_len = ls_rqst.rqst.len();
        if rqst_len < CR_CONN_RQST_SIZE {
            error!("Create Connection LS failed: Bad CR_CONN Length");
            return self.ls_reject(
                ls_rqst,
                LS_CREATE_CONNECTION,
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
            );
        }
        let rqst =
            CrConnRqst::decode(&ls_rqst.rqst).expect("length checked above");

        debug!(
            "LS_CIOC: ls_rqst_len={}, desc_list_len={}, assoc_id=0x{:x}, \
             sq_size={}, esrp={}",
            rqst_len,
            rqst.desc_list_len,
            rqst.assoc_id,
            rqst.sqsize,
            rqst.ersp_ratio
        );

        let (rc, ec, errmsg) = if rqst.desc_list_len
            != crate::wire::lsdesc_len(CR_CONN_RQST_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad CR_CONN Rqst Length",
            )
        } else if rqst.assoc_id_tag != ls::LSDESC_ASSOC_ID {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_NONE, "Not Association ID")
        } else if rqst.assoc_id_len
            != crate::wire::lsdesc_len(LSDESC_ASSOC_ID_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad Association ID Length",
            )
        } else if rqst.cmd_tag != LSDESC_CREATE_CONN_CMD {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_NONE, "Not CR_CONN Cmd")
        } else if rqst.cmd_len
            != crate::wire::lsdesc_len(LSDESC_CR_CONN_CMD_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad CR_CONN Cmd Length",
            )
        } else if rqst.sqsize == 0 || rqst.sqsize > self.opts.max_queue_depth {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_SQ_SIZE,
                "SQ size = 0 or too big",
            )
        } else if rqst.ersp_ratio == 0 || rqst.ersp_ratio >= rqst.sqsize {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_INV_ESRP, "Bad Ersp Ratio")
        } else {
            (ls::RJT_RC_NONE, ls::RJT_EXP_NONE, "")
        };

        if rc != ls::RJT_RC_NONE {
            error!("Create Connection LS failed: {}", errmsg);
            return self.ls_reject(ls_rqst, LS_CREATE_CONNECTION, rc, ec);
        }

        let serial = self.find_assoc(
            ls_rqst.port_hdl,
            ls_rqst.nport_hdl,
            rqst.assoc_id,
        );
        let (rc, ec, errmsg) = match serial {
            None => (
                ls::RJT_RC_INV_ASSOC,
                ls::RJT_EXP_NONE,
                "No Association",
            ),
            Some(serial) => {
                let assoc = self.assoc(serial).unwrap();
                if assoc.state == ObjState::ToBeDeleted {
                    // being deleted, don't allow more connections
                    (ls::RJT_RC_INV_ASSOC, ls::RJT_EXP_NONE, "No Association")
                } else if assoc.conn_count >= self.opts.max_qpairs_per_ctrlr {
                    (
                        ls::RJT_RC_INV_PARAM,
                        ls::RJT_EXP_INV_Q_ID,
                        "Too many connections for association",
                    )
                } else {
                    (ls::RJT_RC_NONE, ls::RJT_EXP_NONE, "")
                }
            }
        };

        if rc != ls::RJT_RC_NONE {
            error!("Create Connection LS failed: {}", errmsg);
            return self.ls_reject(ls_rqst, LS_CREATE_CONNECTION, rc, ec);
        }
        let serial = serial.unwrap();

        let (d_id, trid) = {
            let nport = self
                .nport(ls_rqst.port_hdl, ls_rqst.nport_hdl)
                .expect("nport checked on receive");
            (nport.d_id, traddr(nport.fc_nodename, nport.fc_portname))
        };
        let slot = {
            let rpi = ls_rqst.rpi;
            let assoc = self.assoc_mut(serial).unwrap();
            assoc.new_connection(
                rqst.qid,
                rqst.ersp_ratio,
                rpi,
                rqst.sqsize,
                d_id,
                trid,
            )
        };
        let slot = match slot {
            Some(slot) => slot,
            None => {
                error!("Create Connection LS failed: Queue Allocation Failed");
                return self.ls_reject(
                    ls_rqst,
                    LS_CREATE_CONNECTION,
                    ls::RJT_RC_INSUFF_RES,
                    ls::RJT_EXP_NONE,
                );
            }
        };

        let conn_key = ConnKey {
            assoc: serial,
            slot,
        };
        let acc = LsAcc::Conn(CrConnAcc::default());
        self.ls_add_conn_to_poller(serial, ls_rqst, conn_key, acc);
    }

    fn ls_process_disc(&mut self, mut ls_rqst: LsRequest) {
        let rqst_len = ls_rqst.rqst.len();
        if rqst_len < DISCONNECT_RQST_SIZE {
            error!("Disconnect LS failed: Bad DISCONN Length");
            return self.ls_reject(
                ls_rqst,
                LS_DISCONNECT,
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
            );
        }
        let rqst =
            DisconnRqst::decode(&ls_rqst.rqst).expect("length checked above");

        debug!(
            "LS_DISC: ls_rqst_len={}, desc_list_len={}, assoc_id=0x{:x}",
            rqst_len, rqst.desc_list_len, rqst.assoc_id
        );

        let (rc, ec, errmsg) = if rqst.desc_list_len
            != crate::wire::lsdesc_len(DISCONNECT_RQST_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad DISCONN Rqst Length",
            )
        } else if rqst.assoc_id_tag != ls::LSDESC_ASSOC_ID {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_NONE, "Not Association ID")
        } else if rqst.assoc_id_len
            != crate::wire::lsdesc_len(LSDESC_ASSOC_ID_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad Association ID Length",
            )
        } else if rqst.cmd_tag != LSDESC_DISCONN_CMD {
            (ls::RJT_RC_INV_PARAM, ls::RJT_EXP_NONE, "Not DISCONN Cmd")
        } else if rqst.cmd_len
            != crate::wire::lsdesc_len(LSDESC_DISCONN_CMD_SIZE)
        {
            (
                ls::RJT_RC_INV_PARAM,
                ls::RJT_EXP_INV_LEN,
                "Bad DISCONN Cmd Length",
            )
        } else {
            (ls::RJT_RC_NONE, ls::RJT_EXP_NONE, "")
        };

        if rc != ls::RJT_RC_NONE {
            error!("Disconnect LS failed: {}", errmsg);
            return self.ls_reject(ls_rqst, LS_DISCONNECT, rc, ec);
        }

        let serial = match self.find_assoc(
            ls_rqst.port_hdl,
            ls_rqst.nport_hdl,
            rqst.assoc_id,
        ) {
            Some(serial) => serial,
            None => {
                error!("Disconnect LS failed: No Association");
                return self.ls_reject(
                    ls_rqst,
                    LS_DISCONNECT,
                    ls::RJT_RC_INV_ASSOC,
                    ls::RJT_EXP_NONE,
                );
            }
        };

        // prepare the accept now; it is emitted once every connection
        // delete has called back
        ls_rqst.rsp.clear();
        encode_disconnect_acc(&mut ls_rqst.rsp);
        ls_rqst.rsp_len = DISCONNECT_ACC_SIZE;

        self.delete_association_by_serial(
            serial,
            false,
            false,
            Some(DelAssocCb::Disconnect { ls: ls_rqst }),
        );
    }

    /* ---------- association / connection creation ---------- */

    fn new_association(
        &mut self,
        ls_rqst: &LsRequest,
        rqst: &CrAssocRqst,
    ) -> AssocSerial {
        debug!(
            "New Association request for port {} nport {} rpi 0x{:x}",
            ls_rqst.port_hdl, ls_rqst.nport_hdl, ls_rqst.rpi
        );

        let serial = self.alloc_assoc_serial();
        let max_conns = self.opts.max_qpairs_per_ctrlr;
        let mut assoc = FcAssociation::new(
            serial,
            ls_rqst.port_hdl,
            ls_rqst.nport_hdl,
            ls_rqst.s_id,
            ls_rqst.rpi,
            rqst.hostid,
            rqst.hostnqn.clone(),
            rqst.subnqn.clone(),
            max_conns,
        );

        if self.config.send_ls_disconnect {
            match self
                .lld
                .alloc_srsr_bufs(DISCONNECT_RQST_SIZE, LS_RJT_SIZE)
            {
                Some(mut bufs) => {
                    bufs.rpi = ls_rqst.rpi;
                    assoc.snd_disconn_bufs = Some(bufs);
                }
                None => {
                    error!("no buffers for association's ls disconnect");
                }
            }
        }

        self.assocs.insert(serial, assoc);

        // bind to the nport and the remote port
        let (s_id, rpi) = (ls_rqst.s_id, ls_rqst.rpi);
        let nport = self
            .nport_mut(ls_rqst.port_hdl, ls_rqst.nport_hdl)
            .expect("nport checked on receive");
        nport.assocs.push(serial);
        nport.assoc_count += 1;
        if let Some(i) = nport.find_rport(s_id, rpi) {
            nport.rports[i].assoc_count += 1;
        }

        serial
    }

    /// Hand the new connection's qpair to the generic layer. The LS
    /// accept travels in the connection's create context and is emitted
    /// from [`FcTransport::ls_add_conn_cb`].
    fn ls_add_conn_to_poller(
        &mut self,
        serial: AssocSerial,
        ls_rqst: LsRequest,
        conn_key: ConnKey,
        acc: LsAcc,
    ) {
        debug!("Add Connection to poller for assoc 0x{:x}", serial);

        {
            let conn = self.conn_mut(conn_key).unwrap();
            conn.create_reqpool();
            conn.create_ctx = Some(LsAddConnCtx { ls: ls_rqst, acc });
        }

        // let the generic layer decide which poll group to use
        self.with_backend(|be, t| be.new_qpair(t, conn_key));
    }

    /// The poller registered (or failed to register) the connection.
    pub(crate) fn ls_add_conn_cb(
        &mut self,
        conn_key: ConnKey,
        ret: PollerApiRet,
    ) {
        if ret != PollerApiRet::Success {
            error!("Poller add connection returned {:?}", ret);
        }

        let ctx = match self.conn_mut(conn_key).and_then(|c| c.create_ctx.take())
        {
            Some(ctx) => ctx,
            None => return,
        };

        let assoc_state = self.assoc(conn_key.assoc).map(|a| a.state);
        if assoc_state != Some(ObjState::Created) {
            // association is already being deleted, drop the response
            self.release_ls_rqst(ctx.ls);
            return;
        }

        let conn_id = self.conn(conn_key).unwrap().conn_id;
        let aq_conn = ctx.aq_conn();
        let mut ls_rqst = ctx.ls;
        ls_rqst.rsp.clear();
        match ctx.acc {
            LsAcc::Assoc(mut acc) => {
                acc.conn_id = conn_id;
                acc.assoc_id = conn_id;
                acc.encode(&mut ls_rqst.rsp);
                ls_rqst.rsp_len = CR_ASSOC_ACC_SIZE;
            }
            LsAcc::Conn(mut acc) => {
                acc.conn_id = conn_id;
                acc.encode(&mut ls_rqst.rsp);
                ls_rqst.rsp_len = CR_CONN_ACC_SIZE;
            }
        }

        debug!(
            "add_conn_cb: conn_id = 0x{:x}, aq_conn = {}",
            conn_id, aq_conn
        );

        if self.xmt_ls_rsp(ls_rqst).is_err() {
            error!(
                "Send LS response for {} failed - cleaning up",
                if aq_conn { "association" } else { "connection" }
            );
            self.ls_poller_delete_conn(conn_key, false, None, false, None);
        }
    }

    /// The generic layer never took the qpair: reject the LS and give the
    /// connection back.
    pub(crate) fn ls_add_conn_failure(
        &mut self,
        conn_key: ConnKey,
        ctx: LsAddConnCtx,
    ) {
        let aq_conn = ctx.aq_conn();
        let mut ls_rqst = ctx.ls;
        ls_rqst.rsp_len = format_rjt(
            &mut ls_rqst.rsp,
            if aq_conn {
                LS_CREATE_ASSOCIATION
            } else {
                LS_CREATE_CONNECTION
            },
            ls::RJT_RC_INSUFF_RES,
            ls::RJT_EXP_NONE,
            0,
        );
        let _ = self.xmt_ls_rsp(ls_rqst);
        self.del_connection(conn_key.assoc, conn_key.slot);
    }

    /* ---------- association / connection teardown ---------- */

    /// Public delete-association entry. Idempotent: a second call only
    /// registers its callback.
    pub fn delete_association(
        &mut self,
        port_hdl: u8,
        nport_hdl: u16,
        assoc_id: u64,
        send_abts: bool,
        backend_initiated: bool,
        cb: Option<Box<dyn FnOnce(&mut FcTransport, u32) + Send>>,
    ) -> Result<(), Error> {
        let serial = self
            .find_assoc(port_hdl, nport_hdl, assoc_id)
            .ok_or(Error::NoAssociation {
                nport: nport_hdl,
                assoc_id,
            })?;
        self.delete_association_by_serial(
            serial,
            send_abts,
            backend_initiated,
            cb.map(DelAssocCb::Callback),
        );
        Ok(())
    }

    pub(crate) fn delete_association_by_serial(
        &mut self,
        serial: AssocSerial,
        send_abts: bool,
        backend_initiated: bool,
        cb: Option<DelAssocCb>,
    ) {
        debug!("Delete association, serial 0x{:x}", serial);
        let slots = {
            let assoc = match self.assoc_mut(serial) {
                Some(a) => a,
                None => return,
            };
            if let Some(cb) = cb {
                assoc.ls_del_cbs.push(cb);
            }
            if assoc.state == ObjState::ToBeDeleted {
                // already being deleted, the registered callback fires
                // with the teardown already in flight
                return;
            }
            assoc.state = ObjState::ToBeDeleted;
            assoc.active_conns().to_vec()
        };

        for slot in slots {
            let key = ConnKey {
                assoc: serial,
                slot,
            };
            self.ls_poller_delete_conn(
                key,
                send_abts,
                None,
                backend_initiated,
                None,
            );
        }
    }

    /// Public delete-connection entry (used by the generic layer when a
    /// qpair dies underneath us). A delete aimed at a connection that is
    /// already gone completes right away: there is no connection id left
    /// to tear down.
    pub fn delete_connection(
        &mut self,
        conn_key: ConnKey,
        send_abts: bool,
        backend_initiated: bool,
        done: Option<DelConnDone>,
    ) {
        let gone = self
            .conn(conn_key)
            .map(|c| c.state == ObjState::Zombie)
            .unwrap_or(true);
        if gone {
            debug!("delete for unknown connection id");
            if let Some(done) = done {
                done(self);
            }
            return;
        }
        self.ls_poller_delete_conn(
            conn_key,
            send_abts,
            None,
            backend_initiated,
            done,
        );
    }

    pub(crate) fn ls_poller_delete_conn(
        &mut self,
        conn_key: ConnKey,
        send_abts: bool,
        ls: Option<LsRequest>,
        backend_initiated: bool,
        done: Option<DelConnDone>,
    ) {
        let (state, hwqp) = match self.conn_mut(conn_key) {
            Some(conn) => {
                conn.ls_del_cbs.push(DelConnCb { ls, done });
                (conn.state, conn.hwqp)
            }
            None => return,
        };
        assert_ne!(state, ObjState::Zombie);

        if state != ObjState::Created {
            return;
        }
        self.conn_mut(conn_key).unwrap().state = ObjState::ToBeDeleted;

        let h = match hwqp {
            Some(h) => h,
            None => {
                // never reached a poller; finish on the spot
                let cbs = std::mem::replace(
                    &mut self.conn_mut(conn_key).unwrap().ls_del_cbs,
                    Vec::new(),
                );
                self.del_connection(conn_key.assoc, conn_key.slot);
                self.do_del_conn_cbs(cbs);
                return;
            }
        };

        let op = self.alloc_op(OpCtx::DelConn(DelConnOp {
            conn: conn_key,
            hwqp: h,
            send_abts,
            backend_initiated,
            pending_reqs: 0,
        }));
        if let Some(q) = self.hwqp(h) {
            q.send_msg(PollerMsg::DelConnection { op });
        }
    }

    /// DEL_CONNECTION runs on the connection's HWQP: abort every in-use
    /// request, then unhook the lookup state.
    pub(crate) fn poller_del_connection(&mut self, h: HwqpId, op: u64) {
        let (conn_key, send_abts) = match self.ops.get(&op) {
            Some(OpCtx::DelConn(o)) => (o.conn, o.send_abts),
            _ => return,
        };

        let conn_id = match self.conn(conn_key) {
            Some(c) => c.conn_id,
            None => {
                self.poller_done(
                    PollerCbCtx::ConnDeleted { op },
                    PollerApiRet::NoConnId,
                );
                return;
            }
        };
        debug!("Poller delete connection, conn_id 0x{:x}", conn_id);

        if self.hwqp(h).unwrap().find_conn(conn_id).is_none() {
            self.poller_done(
                PollerCbCtx::ConnDeleted { op },
                PollerApiRet::NoConnId,
            );
            return;
        }

        let (is_admin, in_use) = {
            let conn = self.conn(conn_key).unwrap();
            (conn.is_admin_queue(), conn.in_use_reqs.clone())
        };

        let mut aborts = Vec::new();
        for idx in in_use {
            let tag = ReqTag {
                conn: conn_key,
                idx,
            };
            let opc = self.req(tag).map(|r| r.cmd.opc);
            if is_admin
                && opc
                    == Some(
                        crate::wire::iu::NVME_OPC_ASYNC_EVENT_REQUEST,
                    )
            {
                // the AER is cleaned up by the qpair disconnect
                continue;
            }
            aborts.push(tag);
        }

        if let Some(OpCtx::DelConn(o)) = self.ops.get_mut(&op) {
            o.pending_reqs = aborts.len() as u32;
        }

        if aborts.is_empty() {
            self.finish_del_conn_on_hwqp(h, op);
            return;
        }
        for tag in aborts {
            self.request_abort(
                tag,
                send_abts,
                Some(AbortCb::ConnDelete { op }),
            );
        }
    }

    /// One aborted request of a dying connection has completed.
    pub(crate) fn conn_abort_done(&mut self, op: u64) {
        let (conn_key, h, remaining) = match self.ops.get_mut(&op) {
            Some(OpCtx::DelConn(o)) => {
                if o.pending_reqs > 0 {
                    o.pending_reqs -= 1;
                }
                (o.conn, o.hwqp, o.pending_reqs)
            }
            _ => return,
        };
        if remaining > 0 {
            return;
        }

        let conn_id = self.conn(conn_key).map(|c| c.conn_id);
        let in_table = conn_id
            .and_then(|id| self.hwqp(h).and_then(|q| q.find_conn(id)))
            .is_some();
        if in_table {
            self.finish_del_conn_on_hwqp(h, op);
        } else {
            // duplicate delete: one came via a disconnect, the other from
            // a port reset
            debug!("Duplicate conn delete");
            self.qpair_disconnect_complete(op);
        }
    }

    fn finish_del_conn_on_hwqp(&mut self, h: HwqpId, op: u64) {
        let (conn_key, backend_initiated) = match self.ops.get(&op) {
            Some(OpCtx::DelConn(o)) => (o.conn, o.backend_initiated),
            _ => return,
        };
        let (conn_id, rpi, depth, qpair_state) = {
            let conn = self.conn(conn_key).unwrap();
            (conn.conn_id, conn.rpi, conn.max_queue_depth, conn.qpair_state)
        };

        let queue = self.hwqp(h).unwrap().queue;
        {
            let q = self.hwqp_mut(h).unwrap();
            q.del_conn_lookup(conn_id, rpi, conn_key);
            q.num_conns -= 1;
        }
        self.lld.release_conn(queue, conn_id, depth);
        debug!("Connection deleted, conn_id 0x{:x}", conn_id);

        if !backend_initiated && qpair_state != QpairState::Deactivating {
            self.conn_mut(conn_key).unwrap().qpair_state =
                QpairState::Deactivating;
            self.with_backend(|be, t| be.qpair_disconnect(t, conn_key, op));
        } else {
            self.qpair_disconnect_complete(op);
        }
    }

    /// The generic layer finished disconnecting the qpair (or no
    /// disconnect was needed).
    pub fn qpair_disconnect_complete(&mut self, op: u64) {
        self.poller_done(
            PollerCbCtx::ConnDeleted { op },
            PollerApiRet::Success,
        );
    }

    /// Main-thread completion of a connection delete: give the slot back
    /// and run every registered callback.
    pub(crate) fn ls_poller_delete_conn_cb(
        &mut self,
        op: u64,
        _ret: PollerApiRet,
    ) {
        let conn_key = match self.take_op(op) {
            Some(OpCtx::DelConn(o)) => o.conn,
            _ => return,
        };

        let (state, cbs) = match self.conn_mut(conn_key) {
            Some(conn) => (
                conn.state,
                std::mem::replace(&mut conn.ls_del_cbs, Vec::new()),
            ),
            None => return,
        };

        if state != ObjState::Zombie {
            self.del_connection(conn_key.assoc, conn_key.slot);
        }
        self.do_del_conn_cbs(cbs);
    }

    fn do_del_conn_cbs(&mut self, cbs: Vec<DelConnCb>) {
        debug!("performing delete conn. callbacks");
        for cb in cbs {
            if let Some(ls) = cb.ls {
                if self.xmt_ls_rsp(ls).is_err() {
                    error!("Send LS response for delete connection failed");
                }
            }
            if let Some(done) = cb.done {
                done(self);
            }
        }
    }

    /// Return the connection to the association's free pool; when it was
    /// the last one, tear the association down with it.
    pub(crate) fn del_connection(&mut self, serial: AssocSerial, slot: u16) {
        let (count, assoc_id) = {
            let assoc = match self.assoc_mut(serial) {
                Some(a) => a,
                None => return,
            };
            assoc.release_connection(slot);
            (assoc.conn_count, assoc.assoc_id)
        };
        if count != 0 {
            return;
        }
        debug!("remove assoc. 0x{:x}", assoc_id);

        let (port_hdl, nport_hdl, s_id, rpi) = {
            let assoc = self.assoc(serial).unwrap();
            (assoc.port_hdl, assoc.nport_hdl, assoc.s_id, assoc.rport_rpi)
        };

        // unhook from the nport and drop the remote port reference
        if let Some(nport) = self.nport_mut(port_hdl, nport_hdl) {
            nport.assocs.retain(|s| *s != serial);
            nport.assoc_count -= 1;
            if let Some(i) = nport.find_rport(s_id, rpi) {
                nport.rports[i].assoc_count -= 1;
            }
        }

        let mut assoc = self.assocs.remove(&serial).unwrap();
        let cbs = std::mem::replace(&mut assoc.ls_del_cbs, Vec::new());

        if let Some(mut bufs) = assoc.snd_disconn_bufs.take() {
            let port_online =
                self.port(port_hdl).map(|p| p.is_online()).unwrap_or(false);
            if port_online {
                debug!("Send LS disconnect");
                bufs.rqst.clear();
                DisconnRqst {
                    assoc_id,
                    ..Default::default()
                }
                .encode(&mut bufs.rqst);
                let ls_queue = self
                    .port(port_hdl)
                    .and_then(|p| self.hwqp(p.ls_hwqp))
                    .map(|q| q.queue);
                match ls_queue {
                    Some(q) => {
                        if let Err((e, bufs)) =
                            self.lld.post_srsr_request(q, bufs)
                        {
                            error!("Error sending LS disconnect: {}", e);
                            self.lld.free_srsr_bufs(bufs);
                        }
                    }
                    None => self.lld.free_srsr_bufs(bufs),
                }
            } else {
                self.lld.free_srsr_bufs(bufs);
            }
        }

        self.do_del_assoc_cbs(cbs, 0);
    }

    pub(crate) fn do_del_assoc_cbs(&mut self, cbs: Vec<DelAssocCb>, err: u32) {
        for cb in cbs {
            debug!("performing delete assoc. callback");
            match cb {
                DelAssocCb::Disconnect { ls } => {
                    let _ = self.xmt_ls_rsp(ls);
                }
                DelAssocCb::ItDelete { op } => {
                    self.it_del_assoc_done(op, err);
                }
                DelAssocCb::Callback(f) => f(self, err),
            }
        }
    }

    /* ---------- qpair fini from the generic layer ---------- */

    pub(crate) fn close_qpair(
        &mut self,
        conn_key: ConnKey,
        done: Option<DelConnDone>,
    ) {
        let (conn_id, state, has_create) = match self.conn(conn_key) {
            Some(conn) => (
                conn.conn_id,
                conn.state,
                conn.create_ctx.is_some(),
            ),
            None => {
                if let Some(done) = done {
                    done(self);
                }
                return;
            }
        };

        if conn_id == crate::lld::INVALID_CONN_ID {
            if has_create {
                let ctx =
                    self.conn_mut(conn_key).unwrap().create_ctx.take().unwrap();
                self.ls_add_conn_failure(conn_key, ctx);
            }
            if let Some(done) = done {
                done(self);
            }
        } else if state == ObjState::Created {
            self.delete_connection(conn_key, false, true, done);
        } else if let Some(done) = done {
            done(self);
        }
    }
}
