//! The FC transport object: ports, queue arena, associations, poll
//! groups, mailboxes and the generic transport operations.

use std::collections::HashMap;

use crossbeam::channel::{unbounded, Receiver, Sender};
use once_cell::sync::Lazy;
use parking_lot::Mutex;

use crate::{
    backend::NvmfBackend,
    config::FcConfig,
    error::Error,
    fabric::{
        assoc::{
            AssocSerial, ConnKey, DelConnDone, FcAssociation, FcConn,
            QpairState, ReqTag,
        },
        hwqp::{Hwqp, HwqpId, HwqpState},
        port::{FcPort, Nport},
    },
    lld::{FcLldOps, LldCompletion},
    poller::{PollerApiRet, PollerCbCtx},
    request::FcRequest,
    transport::{
        events::{EventCb, FcEventArgs},
        poll_group::PollGroup,
    },
    wire::ls::MAX_LS_RSP_SIZE,
};

pub mod events;
pub mod poll_group;

pub const DEFAULT_MAX_QUEUE_DEPTH: u16 = 128;
pub const DEFAULT_AQ_DEPTH: u16 = 32;
pub const DEFAULT_MAX_QPAIRS_PER_CTRLR: u16 = 5;
pub const DEFAULT_IN_CAPSULE_DATA_SIZE: u32 = 0;
pub const DEFAULT_MAX_IO_SIZE: u32 = 65536;
pub const DEFAULT_IO_UNIT_SIZE: u32 = 4096;
pub const DEFAULT_NUM_SHARED_BUFFERS: u32 = 8192;
pub const DEFAULT_ACCEPTOR_POLL_RATE_US: u32 = 10000;
pub const DEFAULT_MAX_SGE: u32 = DEFAULT_MAX_IO_SIZE / DEFAULT_IO_UNIT_SIZE;

/// Generic transport options.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct FcTransportOpts {
    pub max_queue_depth: u16,
    pub max_qpairs_per_ctrlr: u16,
    pub in_capsule_data_size: u32,
    pub max_io_size: u32,
    pub io_unit_size: u32,
    pub max_aq_depth: u16,
    pub num_shared_buffers: u32,
    pub acceptor_poll_rate: u32,
}

impl Default for FcTransportOpts {
    fn default() -> Self {
        Self {
            max_queue_depth: DEFAULT_MAX_QUEUE_DEPTH,
            max_qpairs_per_ctrlr: DEFAULT_MAX_QPAIRS_PER_CTRLR,
            in_capsule_data_size: DEFAULT_IN_CAPSULE_DATA_SIZE,
            max_io_size: DEFAULT_MAX_IO_SIZE,
            io_unit_size: DEFAULT_IO_UNIT_SIZE,
            max_aq_depth: DEFAULT_AQ_DEPTH,
            num_shared_buffers: DEFAULT_NUM_SHARED_BUFFERS,
            acceptor_poll_rate: DEFAULT_ACCEPTOR_POLL_RATE_US,
        }
    }
}

/// The registered transport operations table; initialized once at program
/// start, never mutated.
pub struct FcTransportCaps {
    pub name: &'static str,
    /// NVMe-oF TRTYPE
    pub trtype: u8,
}

static FC_TRANSPORT_CAPS: Lazy<FcTransportCaps> = Lazy::new(|| {
    FcTransportCaps {
        name: "FC",
        trtype: 2,
    }
});

pub fn transport_caps() -> &'static FcTransportCaps {
    &FC_TRANSPORT_CAPS
}

/// Discovery log page entry for a listener.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveryLogEntry {
    pub trtype: u8,
    pub traddr: String,
    pub trsvcid: String,
}

/// Which executor is currently driving the transport. Used to assert the
/// thread-affinity rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadCtx {
    None,
    Main,
    Hwqp(HwqpId),
}

/// assert at admin entry points that we run on the main thread
#[macro_export]
macro_rules! assert_fc_main_thread {
    ($t:expr) => {
        assert_eq!(
            $t.cur_thread,
            $crate::transport::ThreadCtx::Main,
            "admin operation off the main thread"
        );
    };
}

/// Messages serialized onto the main thread.
pub(crate) enum MainMsg {
    /// administrative event from the driver
    Event {
        args: FcEventArgs,
        cb: Option<EventCb>,
    },
    /// a poller operation completed on its HWQP
    PollerDone {
        ctx: PollerCbCtx,
        ret: PollerApiRet,
    },
    /// generic layer is done with a qpair
    CloseQpair {
        conn: ConnKey,
        done: Option<DelConnDone>,
    },
}

/// Long lived context of a multi-step operation.
pub(crate) enum OpCtx {
    DelConn(DelConnOp),
    ItDelete(ItDeleteOp),
    NportDelete(NportDeleteOp),
    PortOffline(PortOfflineOp),
    PortQuiesce(PortQuiesceOp),
    Abts(crate::abts::AbtsCtx),
}

pub(crate) struct DelConnOp {
    pub conn: ConnKey,
    pub hwqp: HwqpId,
    pub send_abts: bool,
    pub backend_initiated: bool,
    pub pending_reqs: u32,
}

pub(crate) enum ItDone {
    User(Option<EventCb>),
    NportDelete { op: u64 },
}

pub(crate) struct ItDeleteOp {
    pub port_hdl: u8,
    pub nport_hdl: u16,
    pub s_id: u32,
    pub rpi: u16,
    pub done: ItDone,
}

pub(crate) struct NportDeleteOp {
    pub port_hdl: u8,
    pub nport_hdl: u16,
    pub cbs: Vec<EventCb>,
}

pub(crate) struct PortOfflineOp {
    pub port_hdl: u8,
    pub pending: u32,
    pub cb: Option<EventCb>,
}

pub(crate) struct PortQuiesceOp {
    pub port_hdl: u8,
    pub pending: u32,
    pub cb: Option<EventCb>,
    pub reason: String,
}

pub struct FcTransport {
    pub opts: FcTransportOpts,
    pub(crate) config: FcConfig,
    pub(crate) lld: Box<dyn FcLldOps>,
    pub(crate) backend: Option<Box<dyn NvmfBackend>>,
    pub(crate) ports: Vec<FcPort>,
    pub(crate) hwqps: Vec<Option<Hwqp>>,
    pub(crate) assocs: HashMap<AssocSerial, FcAssociation>,
    pub(crate) next_assoc_serial: AssocSerial,
    /// poll group registry; the one cross-group lock in the transport
    pub(crate) poll_groups: Mutex<Vec<PollGroup>>,
    main_tx: Sender<MainMsg>,
    main_rx: Receiver<MainMsg>,
    pub(crate) ops: HashMap<u64, OpCtx>,
    next_op_id: u64,
    pub(crate) next_abts_uid: u64,
    pub cur_thread: ThreadCtx,
}

impl FcTransport {
    /// Build the transport. Fails when the IO unit size would need more
    /// scatter-gather entries than the driver supports.
    pub fn create(
        config: FcConfig,
        lld: Box<dyn FcLldOps>,
        backend: Box<dyn NvmfBackend>,
    ) -> Result<Self, Error> {
        let opts = config.opts.clone();
        info!(
            "FC transport init: max_ioq_depth={}, max_io_size={}, \
             max_io_qpairs_per_ctrlr={}, io_unit_size={}, max_aq_depth={}",
            opts.max_queue_depth,
            opts.max_io_size,
            opts.max_qpairs_per_ctrlr.saturating_sub(1),
            opts.io_unit_size,
            opts.max_aq_depth
        );

        let sge_count = opts.max_io_size / opts.io_unit_size;
        if sge_count > DEFAULT_MAX_SGE {
            return Err(Error::SgeCount {
                io_unit_size: opts.io_unit_size,
            });
        }

        let (main_tx, main_rx) = unbounded();
        Ok(Self {
            opts,
            config,
            lld,
            backend: Some(backend),
            ports: Vec::new(),
            hwqps: Vec::new(),
            assocs: HashMap::new(),
            next_assoc_serial: 1,
            poll_groups: Mutex::new(Vec::new()),
            main_tx,
            main_rx,
            ops: HashMap::new(),
            next_op_id: 1,
            next_abts_uid: 0,
            cur_thread: ThreadCtx::Main,
        })
    }

    /// Tear the transport down. All ports must have been freed first.
    pub fn destroy(mut self) {
        self.poll_groups.lock().clear();
        while self.main_rx.try_recv().is_ok() {}
        self.ops.clear();
    }

    /* ---------- object resolution helpers ---------- */

    pub(crate) fn port_idx(&self, port_hdl: u8) -> Option<usize> {
        self.ports.iter().position(|p| p.port_hdl == port_hdl)
    }

    pub fn port(&self, port_hdl: u8) -> Option<&FcPort> {
        self.ports.iter().find(|p| p.port_hdl == port_hdl)
    }

    pub(crate) fn port_mut(&mut self, port_hdl: u8) -> Option<&mut FcPort> {
        self.ports.iter_mut().find(|p| p.port_hdl == port_hdl)
    }

    pub fn nport(&self, port_hdl: u8, nport_hdl: u16) -> Option<&Nport> {
        let port = self.port(port_hdl)?;
        let i = port.find_nport(nport_hdl)?;
        port.nports.get(i)
    }

    pub(crate) fn nport_mut(
        &mut self,
        port_hdl: u8,
        nport_hdl: u16,
    ) -> Option<&mut Nport> {
        let port = self.port_mut(port_hdl)?;
        let i = port.find_nport(nport_hdl)?;
        port.nports.get_mut(i)
    }

    pub fn hwqp(&self, h: HwqpId) -> Option<&Hwqp> {
        self.hwqps.get(h).and_then(|q| q.as_ref())
    }

    pub(crate) fn hwqp_mut(&mut self, h: HwqpId) -> Option<&mut Hwqp> {
        self.hwqps.get_mut(h).and_then(|q| q.as_mut())
    }

    pub fn assoc(&self, serial: AssocSerial) -> Option<&FcAssociation> {
        self.assocs.get(&serial)
    }

    pub(crate) fn assoc_mut(
        &mut self,
        serial: AssocSerial,
    ) -> Option<&mut FcAssociation> {
        self.assocs.get_mut(&serial)
    }

    pub fn conn(&self, key: ConnKey) -> Option<&FcConn> {
        self.assocs.get(&key.assoc)?.conn(key.slot)
    }

    pub(crate) fn conn_mut(&mut self, key: ConnKey) -> Option<&mut FcConn> {
        self.assocs.get_mut(&key.assoc)?.conn_mut(key.slot)
    }

    pub fn req(&self, tag: ReqTag) -> Option<&FcRequest> {
        self.conn(tag.conn)?.request(tag.idx)
    }

    pub(crate) fn req_mut(&mut self, tag: ReqTag) -> Option<&mut FcRequest> {
        self.conn_mut(tag.conn)?.request_mut(tag.idx)
    }

    pub(crate) fn alloc_assoc_serial(&mut self) -> AssocSerial {
        let s = self.next_assoc_serial;
        self.next_assoc_serial += 1;
        s
    }

    /// Number of live associations across all ports.
    pub fn num_associations(&self) -> usize {
        self.assocs.len()
    }

    /* ---------- operation contexts & mailboxes ---------- */

    pub(crate) fn alloc_op(&mut self, op: OpCtx) -> u64 {
        let id = self.next_op_id;
        self.next_op_id += 1;
        self.ops.insert(id, op);
        id
    }

    pub(crate) fn take_op(&mut self, id: u64) -> Option<OpCtx> {
        self.ops.remove(&id)
    }

    pub(crate) fn send_main(&self, msg: MainMsg) {
        self.main_tx.send(msg).expect("main mailbox closed");
    }

    /// Route a poller operation result back to the main thread.
    pub(crate) fn poller_done(&self, ctx: PollerCbCtx, ret: PollerApiRet) {
        self.send_main(MainMsg::PollerDone { ctx, ret });
    }

    /// Run a closure against the generic layer. The backend is moved out
    /// for the duration so it may call back into the transport.
    pub(crate) fn with_backend<R>(
        &mut self,
        f: impl FnOnce(&mut dyn NvmfBackend, &mut FcTransport) -> R,
    ) -> R {
        let mut be = self.backend.take().expect("generic layer re-entered");
        let r = f(be.as_mut(), self);
        self.backend = Some(be);
        r
    }

    /* ---------- poll entry points ---------- */

    /// Drain the main-thread mailbox: administrative events and poller
    /// completions.
    pub fn poll_main(&mut self) -> u32 {
        let prev = self.cur_thread;
        self.cur_thread = ThreadCtx::Main;
        let mut count = 0;
        let rx = self.main_rx.clone();
        while let Ok(msg) = rx.try_recv() {
            self.dispatch_main(msg);
            count += 1;
        }
        self.cur_thread = prev;
        count
    }

    /// The acceptor poller: main mailbox plus the LS queue of every
    /// online port.
    pub fn accept_poll(&mut self) -> u32 {
        let mut count = self.poll_main();
        let ls_queues = self
            .ports
            .iter()
            .filter(|p| p.is_online())
            .map(|p| p.ls_hwqp)
            .collect::<Vec<_>>();
        for h in ls_queues {
            count += self.poll_hwqp(h);
        }
        count
    }

    /// Poll every HWQP owned by the given poll group. Ownership is
    /// decided by the queue's group backref, so a queue in flight to the
    /// group (ADD_HWQP still queued) is already served.
    pub fn poll_group_poll(&mut self, pg: usize) -> u32 {
        let hwqps: Vec<HwqpId> = self
            .hwqps
            .iter()
            .enumerate()
            .filter_map(|(i, q)| match q {
                Some(q) if q.fgroup == Some(pg) => Some(i),
                _ => None,
            })
            .collect();
        let mut count = 0;
        for h in hwqps {
            count += self.poll_hwqp(h);
        }
        count
    }

    /// Process one HWQP: its mailbox, then the driver queue, then any
    /// pending work that was waiting for resources.
    pub fn poll_hwqp(&mut self, h: HwqpId) -> u32 {
        let prev = self.cur_thread;
        self.cur_thread = ThreadCtx::Hwqp(h);
        let mut count = 0;

        loop {
            let msg = match self.hwqp(h) {
                Some(q) => q.try_recv_msg(),
                None => None,
            };
            match msg {
                Some(m) => {
                    self.dispatch_poller_msg(h, m);
                    count += 1;
                }
                None => break,
            }
        }

        let (queue, online, is_ls) = match self.hwqp(h) {
            Some(q) => {
                (q.queue, q.state == HwqpState::Online, q.is_ls_queue)
            }
            None => {
                self.cur_thread = prev;
                return count;
            }
        };

        if online {
            let completions = self.lld.poll_queue(queue);
            for c in completions {
                self.dispatch_lld(h, c);
                count += 1;
            }
            self.process_pending_reqs(h);
            if is_ls {
                self.process_pending_ls_rqsts(h);
            }
        }

        self.cur_thread = prev;
        count
    }

    fn dispatch_main(&mut self, msg: MainMsg) {
        match msg {
            MainMsg::Event { args, cb } => self.handle_event(args, cb),
            MainMsg::PollerDone { ctx, ret } => {
                self.handle_poller_done(ctx, ret)
            }
            MainMsg::CloseQpair { conn, done } => {
                self.close_qpair(conn, done);
            }
        }
    }

    fn dispatch_lld(&mut self, h: HwqpId, c: LldCompletion) {
        match c {
            LldCompletion::Frame {
                buf_index,
                frame,
                payload,
            } => {
                let _ = self.process_frame(h, buf_index, &frame, &payload);
            }
            LldCompletion::XferRdyDone { tag, status } => {
                self.write_data_received(tag, status);
            }
            LldCompletion::DataSendDone { tag, status } => {
                self.read_data_sent(tag, status);
            }
            LldCompletion::RspDone { tag, status } => {
                self.rsp_sent(tag, status);
            }
            LldCompletion::QueueSyncDone { u_id } => {
                self.queue_sync_done(h, u_id);
            }
        }
    }

    /* ---------- poll groups ---------- */

    /// One poll group per worker thread.
    pub fn poll_group_create(&mut self) -> usize {
        let mut groups = self.poll_groups.lock();
        groups.push(PollGroup::new(self.opts.num_shared_buffers));
        groups.len() - 1
    }

    pub fn poll_group_destroy(&mut self, pg: usize) {
        let mut groups = self.poll_groups.lock();
        if let Some(group) = groups.get_mut(pg) {
            group.hwqps.clear();
            group.hwqp_count = 0;
        }
    }

    /// Find the poll group with the least HWQPs assigned to it and hand
    /// the queue over.
    pub(crate) fn poll_group_add_hwqp(&mut self, h: HwqpId) {
        let chosen = {
            let mut groups = self.poll_groups.lock();
            let mut best: Option<(usize, u32)> = None;
            for (i, g) in groups.iter().enumerate() {
                match best {
                    Some((_, count)) if g.hwqp_count >= count => {}
                    _ => best = Some((i, g.hwqp_count)),
                }
            }
            if let Some((i, _)) = best {
                groups[i].hwqp_count += 1;
            }
            best.map(|(i, _)| i)
        };

        let chosen = match chosen {
            Some(i) => i,
            None => {
                error!("Could not assign poll group for hwqp");
                return;
            }
        };

        if let Some(q) = self.hwqp_mut(h) {
            q.fgroup = Some(chosen);
            q.send_msg(crate::poller::PollerMsg::AddHwqp);
        }
    }

    /// Detach a queue from its poll group; `op` is the port-offline
    /// operation waiting for the acknowledgements.
    pub(crate) fn poll_group_remove_hwqp(&mut self, h: HwqpId, op: u64) {
        let fgroup = self.hwqp(h).and_then(|q| q.fgroup);
        match fgroup {
            None => {
                error!("HWQP not assigned to a poll group");
                self.hwqp_removed(op, h);
            }
            Some(g) => {
                self.poll_groups.lock()[g].hwqp_count -= 1;
                if let Some(q) = self.hwqp(h) {
                    q.send_msg(crate::poller::PollerMsg::RemoveHwqp { op });
                }
            }
        }
    }

    /// The qpair from the generic layer lands on a poll group: bind the
    /// connection to a compatible HWQP and register it with the poller.
    pub fn poll_group_add(
        &mut self,
        pg: usize,
        conn_key: ConnKey,
    ) -> Result<(), Error> {
        let port_hdl = {
            let assoc = self.assoc(conn_key.assoc).ok_or_else(|| {
                Error::NoAssociation {
                    nport: 0,
                    assoc_id: conn_key.assoc,
                }
            })?;
            assoc.port_hdl
        };

        let chosen = self.hwqps.iter().enumerate().find_map(|(i, q)| match q {
            Some(q)
                if q.fgroup == Some(pg) && q.port_hdl == port_hdl
                    && !q.is_ls_queue =>
            {
                Some(i)
            }
            _ => None,
        });
        let h = match chosen {
            Some(h) => h,
            None => {
                error!("No valid hwqp found for new QP");
                return Err(Error::PortNotFound { port: port_hdl });
            }
        };

        let (queue, hwqp_id) = {
            let q = self.hwqp(h).unwrap();
            (q.queue, q.hwqp_id)
        };
        let sq_size = self.conn(conn_key).map(|c| c.max_queue_depth).unwrap();
        let conn_id =
            match self.lld.assign_conn_to_hwqp(queue, hwqp_id, sq_size) {
                Some(id) => id,
                None => {
                    error!("Failed to get a connection id for new QP");
                    return Err(Error::PortNotFound { port: port_hdl });
                }
            };

        let qid = {
            let conn = self.conn_mut(conn_key).unwrap();
            conn.hwqp = Some(h);
            conn.conn_id = conn_id;
            conn.qid
        };
        if qid == 0 {
            self.assoc_mut(conn_key.assoc).unwrap().assoc_id = conn_id;
        }

        if let Some(q) = self.hwqp(h) {
            q.send_msg(crate::poller::PollerMsg::AddConnection {
                conn: conn_key,
            });
        }
        Ok(())
    }

    /* ---------- qpair interface used by the generic layer ---------- */

    /// The fabric Connect finished; capsules may now flow.
    pub fn qpair_activate(&mut self, conn_key: ConnKey) {
        if let Some(conn) = self.conn_mut(conn_key) {
            if conn.qpair_state == QpairState::Uninitialized {
                conn.qpair_state = QpairState::Active;
            }
        }
    }

    /// Generic layer is done with the qpair (controller teardown). Always
    /// routed through the main thread.
    pub fn qpair_fini(&mut self, conn_key: ConnKey, done: Option<DelConnDone>) {
        self.send_main(MainMsg::CloseQpair {
            conn: conn_key,
            done,
        });
    }

    pub fn listen(&mut self, _traddr: &str) -> Result<(), Error> {
        Ok(())
    }

    pub fn stop_listen(&mut self, _traddr: &str) {}

    /// Fill a discovery log page entry for a listener address.
    pub fn listener_discover(&self, traddr: &str) -> DiscoveryLogEntry {
        DiscoveryLogEntry {
            trtype: transport_caps().trtype,
            traddr: traddr.to_string(),
            trsvcid: "none".to_string(),
        }
    }

    /// Peer transport address of a connection.
    pub fn qpair_peer_trid(&self, conn_key: ConnKey) -> Option<String> {
        self.conn(conn_key).map(|c| c.trid.clone())
    }

    /// Point a HWQP at a fresh driver queue set after a port reset and
    /// clear its drop accounting.
    pub fn hwqp_reinit(&mut self, h: HwqpId, queues_curr: crate::lld::LldQueue) {
        let prev = match self.hwqp(h) {
            Some(q) => q.queue,
            None => return,
        };
        self.lld.reinit_queue(prev, queues_curr);
        if let Some(q) = self.hwqp_mut(h) {
            q.queue = queues_curr;
            q.counters = crate::fabric::hwqp::FcErrors::default();
        }
    }

    /* ---------- small shared utilities ---------- */

    /// Byte budget of an IO expressed in pool buffers.
    pub(crate) fn bufs_needed(&self, length: u32) -> u32 {
        if length == 0 {
            0
        } else {
            (length + self.opts.io_unit_size - 1) / self.opts.io_unit_size
        }
    }

    /// Build an empty LS response buffer.
    pub(crate) fn new_ls_rsp_buf() -> Vec<u8> {
        Vec::with_capacity(MAX_LS_RSP_SIZE)
    }

    pub(crate) fn alloc_abts_uid(&mut self) -> u64 {
        self.next_abts_uid += 1;
        self.next_abts_uid
    }
}
