//! Hardware queue pairs. Each HWQP is owned by exactly one poll group and
//! everything it holds (lookup tables, in-use list, pending queues) is
//! only ever touched from that group's thread.

use std::collections::{HashMap, VecDeque};

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::{
    fabric::assoc::{ConnKey, ReqTag},
    lld::LldQueue,
    ls::LsRequest,
    poller::PollerMsg,
};

/// Index of a HWQP in the transport's queue arena.
pub type HwqpId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwqpState {
    Offline,
    Online,
}

/// Per-queue error and drop accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FcErrors {
    pub no_xchg: u32,
    pub nport_invalid: u32,
    pub rport_invalid: u32,
    pub unknown_frame: u32,
    pub buf_alloc_err: u32,
    pub unexpected_err: u32,
    pub nvme_cmd_iu_err: u32,
    pub nvme_cmd_xfer_err: u32,
    pub invalid_conn_err: u32,
    pub num_aborted: u32,
    pub num_abts_sent: u32,
}

/// A queue-sync callback parked on the queue until the driver reports the
/// marker went through.
#[derive(Debug, Clone, Copy)]
pub struct SyncCb {
    pub u_id: u64,
    /// owning ABTS operation
    pub op: u64,
}

pub struct Hwqp {
    pub hwqp_id: u16,
    pub port_hdl: u8,
    pub is_ls_queue: bool,
    pub state: HwqpState,
    /// vendor queue set handle
    pub queue: LldQueue,
    pub rq_size: u32,
    pub counters: FcErrors,
    pub in_use_reqs: Vec<ReqTag>,
    /// FCP capsules waiting for an XRI or data buffers
    pub pending_reqs: VecDeque<ReqTag>,
    /// LS requests waiting for an XRI
    pub ls_pending: VecDeque<LsRequest>,
    pub sync_cbs: Vec<SyncCb>,
    pub conn_table: HashMap<u64, ConnKey>,
    pub rport_table: HashMap<u16, Vec<ConnKey>>,
    pub num_conns: u32,
    /// owning poll group, if assigned
    pub fgroup: Option<usize>,
    msg_tx: Sender<PollerMsg>,
    msg_rx: Receiver<PollerMsg>,
}

impl Hwqp {
    pub fn new(
        port_hdl: u8,
        hwqp_id: u16,
        queue: LldQueue,
        rq_size: u32,
        is_ls_queue: bool,
    ) -> Self {
        let (msg_tx, msg_rx) = unbounded();
        Self {
            hwqp_id,
            port_hdl,
            is_ls_queue,
            state: HwqpState::Offline,
            queue,
            rq_size,
            counters: FcErrors::default(),
            in_use_reqs: Vec::new(),
            pending_reqs: VecDeque::new(),
            ls_pending: VecDeque::new(),
            sync_cbs: Vec::new(),
            conn_table: HashMap::new(),
            rport_table: HashMap::new(),
            num_conns: 0,
            fgroup: None,
            msg_tx,
            msg_rx,
        }
    }

    /// Post a poller operation onto this queue's mailbox; it runs the
    /// next time the owning poll group polls the queue.
    pub fn send_msg(&self, msg: PollerMsg) {
        self.msg_tx.send(msg).expect("hwqp mailbox closed");
    }

    pub fn try_recv_msg(&self) -> Option<PollerMsg> {
        self.msg_rx.try_recv().ok()
    }

    /// Register a connection in both lookup tables.
    pub fn add_conn_lookup(&mut self, conn_id: u64, rpi: u16, key: ConnKey) {
        self.conn_table.insert(conn_id, key);
        self.rport_table.entry(rpi).or_insert_with(Vec::new).push(key);
    }

    /// Remove a connection from both lookup tables. The conn-id entry
    /// goes first; the RPI entry disappears with its last connection.
    pub fn del_conn_lookup(&mut self, conn_id: u64, rpi: u16, key: ConnKey) {
        if self.conn_table.remove(&conn_id).is_none() {
            error!("Failed to del connection(0x{:x}) hash entry", conn_id);
        }
        match self.rport_table.get_mut(&rpi) {
            Some(conns) => {
                conns.retain(|k| *k != key);
                if conns.is_empty() {
                    self.rport_table.remove(&rpi);
                }
            }
            None => error!("RPI(0x{:x}) hash entry not found", rpi),
        }
    }

    pub fn find_conn(&self, conn_id: u64) -> Option<ConnKey> {
        self.conn_table.get(&conn_id).copied()
    }
}
