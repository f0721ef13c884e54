//! Associations and their connections. An association owns all of its
//! connection slots in one preallocated pool so connection setup never
//! allocates on the LS path; each connection likewise owns a preallocated
//! request pool sized at twice its SQ depth.

use std::collections::VecDeque;

use crate::{
    fabric::{hwqp::HwqpId, port::ObjState},
    lld::{FcSrsrBufs, INVALID_CONN_ID},
    ls::LsRequest,
    request::FcRequest,
    transport::FcTransport,
    wire::ls::{ASSOC_HOSTID_LEN, CrAssocAcc, CrConnAcc},
};

/// Stable internal key of an association. The wire association id is only
/// assigned once the admin connection id exists, so it cannot name the
/// object during creation.
pub type AssocSerial = u64;

/// A connection slot within its owning association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub assoc: AssocSerial,
    pub slot: u16,
}

/// A request within its owning connection's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqTag {
    pub conn: ConnKey,
    pub idx: u16,
}

/// Qpair activity as seen by the NVMe-oF generic layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpairState {
    Uninitialized,
    Active,
    Deactivating,
}

/// Continuation invoked once a connection delete has fully completed.
pub type DelConnDone = Box<dyn FnOnce(&mut FcTransport) + Send>;

/// One registered delete-connection callback: an optional LS response to
/// emit plus an optional continuation.
pub struct DelConnCb {
    pub ls: Option<LsRequest>,
    pub done: Option<DelConnDone>,
}

/// One registered delete-association callback.
pub enum DelAssocCb {
    /// LS Disconnect handling: emit the prepared response when teardown
    /// is complete
    Disconnect { ls: LsRequest },
    /// an I_T delete is waiting for this association
    ItDelete { op: u64 },
    /// plain continuation with an error code
    Callback(Box<dyn FnOnce(&mut FcTransport, u32) + Send>),
}

/// Accept payload prepared while the new connection travels through the
/// poller; the connection id is patched in before emission.
pub enum LsAcc {
    Assoc(CrAssocAcc),
    Conn(CrConnAcc),
}

/// Pending create-connection state parked on the connection until the
/// poller confirms (or the qpair is torn down underneath us).
pub struct LsAddConnCtx {
    pub ls: LsRequest,
    pub acc: LsAcc,
}

impl LsAddConnCtx {
    pub fn aq_conn(&self) -> bool {
        matches!(self.acc, LsAcc::Assoc(_))
    }
}

/// One NVMe submission/completion queue pair mapped to an FC exchange
/// stream.
pub struct FcConn {
    pub slot: u16,
    pub assoc: AssocSerial,
    pub conn_id: u64,
    pub qid: u16,
    pub esrp_ratio: u16,
    pub rsp_count: u16,
    /// response sequence number
    pub rsn: u32,
    pub max_queue_depth: u16,
    pub sq_head: u16,
    pub sq_head_max: u16,
    pub hwqp: Option<HwqpId>,
    pub rpi: u16,
    pub s_id: u32,
    pub d_id: u32,
    pub state: ObjState,
    pub qpair_state: QpairState,
    /// pool indices of requests currently carrying a capsule
    pub in_use_reqs: Vec<u16>,
    /// first halves of fused commands waiting for their second
    pub fused_waiting: VecDeque<u16>,
    pool: Vec<FcRequest>,
    pool_free: Vec<u16>,
    pub ls_del_cbs: Vec<DelConnCb>,
    pub create_ctx: Option<LsAddConnCtx>,
    /// target port address for subsystem listener validation
    pub trid: String,
}

impl FcConn {
    pub(crate) fn unused(assoc: AssocSerial, slot: u16) -> Self {
        Self {
            slot,
            assoc,
            conn_id: INVALID_CONN_ID,
            qid: 0,
            esrp_ratio: 0,
            rsp_count: 0,
            rsn: 0,
            max_queue_depth: 0,
            sq_head: 0,
            sq_head_max: 0,
            hwqp: None,
            rpi: 0,
            s_id: 0,
            d_id: 0,
            state: ObjState::Zombie,
            qpair_state: QpairState::Uninitialized,
            in_use_reqs: Vec::new(),
            fused_waiting: VecDeque::new(),
            pool: Vec::new(),
            pool_free: Vec::new(),
            ls_del_cbs: Vec::new(),
            create_ctx: None,
            trid: String::new(),
        }
    }

    /// (Re)initialize a slot taken from the association's free pool.
    pub(crate) fn open(
        &mut self,
        qid: u16,
        esrp_ratio: u16,
        rpi: u16,
        sq_size: u16,
        s_id: u32,
        d_id: u32,
        trid: String,
    ) {
        self.conn_id = INVALID_CONN_ID;
        self.qid = qid;
        self.esrp_ratio = esrp_ratio;
        self.rsp_count = 0;
        self.rsn = 0;
        self.max_queue_depth = sq_size + 1;
        self.sq_head = 0;
        self.sq_head_max = sq_size;
        self.hwqp = None;
        self.rpi = rpi;
        self.s_id = s_id;
        self.d_id = d_id;
        self.state = ObjState::Created;
        self.qpair_state = QpairState::Uninitialized;
        self.in_use_reqs.clear();
        self.fused_waiting.clear();
        self.ls_del_cbs.clear();
        self.create_ctx = None;
        self.trid = trid;
    }

    /// Preallocate the request pool: twice the SQ depth, so a response
    /// still on the wire cannot starve a back-to-back new command.
    pub(crate) fn create_reqpool(&mut self) {
        let key = ConnKey {
            assoc: self.assoc,
            slot: self.slot,
        };
        let qd = usize::from(self.max_queue_depth) * 2;
        self.pool = (0 .. qd)
            .map(|i| FcRequest::unused(key, i as u16))
            .collect();
        self.pool_free = (0 .. qd as u16).rev().collect();
    }

    pub(crate) fn free_reqpool(&mut self) {
        self.pool.clear();
        self.pool_free.clear();
    }

    pub fn pool_free_elems(&self) -> usize {
        self.pool_free.len()
    }

    pub fn pool_size(&self) -> usize {
        self.pool.len()
    }

    pub(crate) fn alloc_request(&mut self) -> Option<u16> {
        let idx = self.pool_free.pop()?;
        self.pool[usize::from(idx)].reset();
        self.in_use_reqs.push(idx);
        Some(idx)
    }

    pub(crate) fn free_request(&mut self, idx: u16) {
        self.in_use_reqs.retain(|i| *i != idx);
        self.pool[usize::from(idx)].mark_dead();
        self.pool_free.push(idx);
    }

    pub fn request(&self, idx: u16) -> Option<&FcRequest> {
        self.pool.get(usize::from(idx))
    }

    pub fn request_mut(&mut self, idx: u16) -> Option<&mut FcRequest> {
        self.pool.get_mut(usize::from(idx))
    }

    /// Advance the SQ head, wrapping as needed. Done on dequeue, before
    /// completion, to preserve the NVMe flow control contract.
    pub fn advance_sq_head(&mut self) -> u16 {
        self.sq_head = if self.sq_head == self.sq_head_max {
            0
        } else {
            self.sq_head + 1
        };
        self.sq_head
    }

    pub fn is_admin_queue(&self) -> bool {
        self.qid == 0
    }
}

/// An NVMe-oF session between one host and one subsystem over an FC
/// initiator/target pair.
pub struct FcAssociation {
    pub serial: AssocSerial,
    /// wire association id: the admin connection's connection id
    pub assoc_id: u64,
    pub port_hdl: u8,
    pub nport_hdl: u16,
    pub s_id: u32,
    pub rport_rpi: u16,
    pub state: ObjState,
    pub host_id: [u8; ASSOC_HOSTID_LEN],
    pub host_nqn: String,
    pub sub_nqn: String,
    /// slot of the admin queue connection
    pub aq_slot: Option<u16>,
    pub conn_count: u16,
    active_conns: Vec<u16>,
    avail_conns: VecDeque<u16>,
    conn_slots: Vec<FcConn>,
    pub ls_del_cbs: Vec<DelAssocCb>,
    /// disconnect command buffers (sent to the initiator on teardown)
    pub snd_disconn_bufs: Option<FcSrsrBufs>,
}

impl FcAssociation {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        serial: AssocSerial,
        port_hdl: u8,
        nport_hdl: u16,
        s_id: u32,
        rport_rpi: u16,
        host_id: [u8; ASSOC_HOSTID_LEN],
        host_nqn: String,
        sub_nqn: String,
        max_conns: u16,
    ) -> Self {
        // all connection slots in one go, so create-connection never
        // allocates
        let conn_slots = (0 .. max_conns)
            .map(|slot| FcConn::unused(serial, slot))
            .collect();
        Self {
            serial,
            assoc_id: 0,
            port_hdl,
            nport_hdl,
            s_id,
            rport_rpi,
            state: ObjState::Created,
            host_id,
            host_nqn,
            sub_nqn,
            aq_slot: None,
            conn_count: 0,
            active_conns: Vec::new(),
            avail_conns: (0 .. max_conns).collect(),
            conn_slots,
            ls_del_cbs: Vec::new(),
            snd_disconn_bufs: None,
        }
    }

    pub fn conn(&self, slot: u16) -> Option<&FcConn> {
        self.conn_slots.get(usize::from(slot))
    }

    pub fn conn_mut(&mut self, slot: u16) -> Option<&mut FcConn> {
        self.conn_slots.get_mut(usize::from(slot))
    }

    pub fn active_conns(&self) -> &[u16] {
        &self.active_conns
    }

    /// Take a slot from the free pool and open it.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new_connection(
        &mut self,
        qid: u16,
        esrp_ratio: u16,
        rpi: u16,
        sq_size: u16,
        d_id: u32,
        trid: String,
    ) -> Option<u16> {
        let slot = self.avail_conns.pop_front()?;
        let s_id = self.s_id;
        self.conn_slots[usize::from(slot)]
            .open(qid, esrp_ratio, rpi, sq_size, s_id, d_id, trid);
        self.active_conns.push(slot);
        self.conn_count += 1;
        if qid == 0 {
            self.aq_slot = Some(slot);
        }
        Some(slot)
    }

    /// Give a connection back to the free pool; the caller handles the
    /// association-level bookkeeping that follows when the count drops to
    /// zero.
    pub(crate) fn release_connection(&mut self, slot: u16) {
        let conn = &mut self.conn_slots[usize::from(slot)];
        conn.free_reqpool();
        conn.state = ObjState::Zombie;
        conn.ls_del_cbs.clear();
        self.active_conns.retain(|s| *s != slot);
        self.avail_conns.push_back(slot);
        self.conn_count -= 1;
    }
}
