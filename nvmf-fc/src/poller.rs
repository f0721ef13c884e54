//! Per-HWQP poller operations. Administrative flows never touch a queue
//! directly: they post one of these messages onto the queue's mailbox and
//! the owning poll group runs the handler; completions travel back to the
//! main thread as [`PollerCbCtx`] values.

use crate::{
    fabric::{
        assoc::{ConnKey, ReqTag},
        hwqp::{HwqpId, HwqpState, SyncCb},
    },
    transport::FcTransport,
};

/// Result of a poller operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerApiRet {
    Success,
    Error,
    InvalidArg,
    NoConnId,
    DupConnId,
    OxidNotFound,
}

/// Operations posted to a HWQP's mailbox.
#[derive(Debug)]
pub enum PollerMsg {
    AddConnection { conn: ConnKey },
    DelConnection { op: u64 },
    QuiesceQueue { op: u64 },
    ActivateQueue,
    AbtsReceived { op: u64 },
    ReqAbortComplete { tag: ReqTag },
    BdevAbort { tag: ReqTag },
    QueueSync { u_id: u64, op: u64 },
    AddHwqp,
    RemoveHwqp { op: u64 },
}

/// Completion context routed back to the main thread.
#[derive(Debug)]
pub(crate) enum PollerCbCtx {
    LsAddConn { conn: ConnKey },
    ConnDeleted { op: u64 },
    AbtsRecvd { op: u64, hwqp: HwqpId },
    QueueSynced { op: u64, hwqp: HwqpId },
    QueueQuiesced { op: u64, hwqp: HwqpId },
    HwqpRemoved { op: u64, hwqp: HwqpId },
}

impl FcTransport {
    pub(crate) fn dispatch_poller_msg(&mut self, h: HwqpId, msg: PollerMsg) {
        match msg {
            PollerMsg::AddConnection { conn } => {
                self.poller_add_connection(h, conn)
            }
            PollerMsg::DelConnection { op } => {
                self.poller_del_connection(h, op)
            }
            PollerMsg::QuiesceQueue { op } => self.poller_quiesce_queue(h, op),
            PollerMsg::ActivateQueue => self.poller_activate_queue(h),
            PollerMsg::AbtsReceived { op } => self.poller_abts_received(h, op),
            PollerMsg::ReqAbortComplete { tag } => {
                self.request_abort_complete(tag)
            }
            PollerMsg::BdevAbort { tag } => self.bdev_abort(tag),
            PollerMsg::QueueSync { u_id, op } => {
                self.poller_queue_sync(h, u_id, op)
            }
            PollerMsg::AddHwqp => self.poller_add_hwqp(h),
            PollerMsg::RemoveHwqp { op } => self.poller_remove_hwqp(h, op),
        }
    }

    pub(crate) fn handle_poller_done(
        &mut self,
        ctx: PollerCbCtx,
        ret: PollerApiRet,
    ) {
        match ctx {
            PollerCbCtx::LsAddConn { conn } => self.ls_add_conn_cb(conn, ret),
            PollerCbCtx::ConnDeleted { op } => {
                self.ls_poller_delete_conn_cb(op, ret)
            }
            PollerCbCtx::AbtsRecvd { op, hwqp } => {
                self.abts_handled_cb(op, hwqp, ret)
            }
            PollerCbCtx::QueueSynced { op, hwqp } => {
                self.queue_synced_cb(op, hwqp)
            }
            PollerCbCtx::QueueQuiesced { op, hwqp } => {
                self.queue_quiesced_cb(op, hwqp)
            }
            PollerCbCtx::HwqpRemoved { op, hwqp } => {
                self.hwqp_removed(op, hwqp)
            }
        }
    }

    /// Register a new connection in the queue's lookup tables.
    fn poller_add_connection(&mut self, h: HwqpId, conn_key: ConnKey) {
        let (conn_id, rpi) = match self.conn(conn_key) {
            Some(conn) => (conn.conn_id, conn.rpi),
            None => {
                self.poller_done(
                    PollerCbCtx::LsAddConn { conn: conn_key },
                    PollerApiRet::InvalidArg,
                );
                return;
            }
        };
        debug!("Poller add connection, conn_id 0x{:x}", conn_id);

        let q = self.hwqp_mut(h).unwrap();
        let ret = if q.find_conn(conn_id).is_some() {
            error!("duplicate connection found");
            PollerApiRet::DupConnId
        } else {
            q.add_conn_lookup(conn_id, rpi, conn_key);
            q.num_conns += 1;
            PollerApiRet::Success
        };

        self.poller_done(PollerCbCtx::LsAddConn { conn: conn_key }, ret);
    }

    /// Quiesce: stop queue processing and kill commands that are both in
    /// a transfer state and already being aborted. We can run into those
    /// when an adapter reset lands while an I_T nexus delete is in
    /// progress.
    fn poller_quiesce_queue(&mut self, h: HwqpId, op: u64) {
        if let Some(q) = self.hwqp_mut(h) {
            q.state = HwqpState::Offline;
        }
        let tags: Vec<ReqTag> = self
            .hwqp(h)
            .map(|q| q.in_use_reqs.clone())
            .unwrap_or_default();
        for tag in tags {
            let flush = self
                .req(tag)
                .map(|r| r.in_xfer() && r.is_aborted)
                .unwrap_or(false);
            if flush {
                self.hwqp(h)
                    .unwrap()
                    .send_msg(PollerMsg::ReqAbortComplete { tag });
            }
        }
        self.poller_done(
            PollerCbCtx::QueueQuiesced { op, hwqp: h },
            PollerApiRet::Success,
        );
    }

    fn poller_activate_queue(&mut self, h: HwqpId) {
        if let Some(q) = self.hwqp_mut(h) {
            q.state = HwqpState::Online;
        }
    }

    /// Park the sync context until the driver reports the marker.
    fn poller_queue_sync(&mut self, h: HwqpId, u_id: u64, op: u64) {
        debug!("HWQP sync requested for u_id = 0x{:x}", u_id);
        if let Some(q) = self.hwqp_mut(h) {
            q.sync_cbs.push(SyncCb { u_id, op });
        }
    }

    /// The sync marker made it through this queue.
    pub(crate) fn queue_sync_done(&mut self, h: HwqpId, u_id: u64) {
        let found = {
            let q = match self.hwqp_mut(h) {
                Some(q) => q,
                None => return,
            };
            match q.sync_cbs.iter().position(|cb| cb.u_id == u_id) {
                Some(i) => Some(q.sync_cbs.remove(i)),
                None => None,
            }
        };
        match found {
            Some(cb) => {
                debug!("HWQP sync done for u_id = 0x{:x}", u_id);
                self.poller_done(
                    PollerCbCtx::QueueSynced {
                        op: cb.op,
                        hwqp: h,
                    },
                    PollerApiRet::Success,
                );
            }
            None => {
                // stale marker, nothing waits for it
            }
        }
    }

    fn poller_add_hwqp(&mut self, h: HwqpId) {
        let fgroup = self.hwqp(h).and_then(|q| q.fgroup);
        if let Some(g) = fgroup {
            let mut groups = self.poll_groups.lock();
            if let Some(group) = groups.get_mut(g) {
                group.hwqps.push(h);
            }
        }
    }

    fn poller_remove_hwqp(&mut self, h: HwqpId, op: u64) {
        let fgroup = self.hwqp(h).and_then(|q| q.fgroup);
        if let Some(g) = fgroup {
            let mut groups = self.poll_groups.lock();
            if let Some(group) = groups.get_mut(g) {
                group.hwqps.retain(|id| *id != h);
            }
        }
        if let Some(q) = self.hwqp_mut(h) {
            q.fgroup = None;
        }
        self.poller_done(
            PollerCbCtx::HwqpRemoved { op, hwqp: h },
            PollerApiRet::Success,
        );
    }
}
