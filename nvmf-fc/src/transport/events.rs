//! The administrative event machine: eleven event types serialized onto
//! the designated main thread, each with a strictly ordered
//! create/teardown sequence and an exactly-once completion callback.

use crate::{
    assert_fc_main_thread,
    error::Error,
    fabric::{
        assoc::DelAssocCb,
        hwqp::{Hwqp, HwqpId, HwqpState},
        port::{
            prli_service_params, FcPort, FcPortState, Nport, ObjState,
            RemotePort, Wwn, MAX_NUM_FC_PORTS,
        },
    },
    lld::LldQueue,
    poller::PollerMsg,
    transport::{
        FcTransport, ItDeleteOp, ItDone, MainMsg, NportDeleteOp, OpCtx,
        PortOfflineOp, PortQuiesceOp,
    },
};

/// Completion callback into the embedding FC driver.
pub type EventCb = Box<dyn FnOnce(u8, FcEvent, i32) + Send>;

/// The administrative events, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FcEvent {
    HwPortInit = 0,
    HwPortFree = 1,
    HwPortOnline = 2,
    HwPortOffline = 3,
    HwPortReset = 4,
    NportCreate = 5,
    NportDelete = 6,
    ItAdd = 7,
    ItDelete = 8,
    AbtsRecv = 9,
    UnrecoverableErr = 10,
}

/// Per-event argument structures.
#[derive(Debug)]
pub enum FcEventArgs {
    HwPortInit {
        port_handle: u8,
        ls_queue: LldQueue,
        ls_queue_size: u32,
        io_queues: Vec<LldQueue>,
        io_queue_size: u32,
        fcp_rq_id: u16,
    },
    HwPortFree {
        port_handle: u8,
    },
    HwPortOnline {
        port_handle: u8,
    },
    HwPortOffline {
        port_handle: u8,
    },
    HwPortReset {
        port_handle: u8,
        dump_queues: bool,
        /// dump reason, up to 256 bytes
        reason: String,
    },
    NportCreate {
        port_handle: u8,
        nport_handle: u16,
        d_id: u32,
        fc_nodename: Wwn,
        fc_portname: Wwn,
    },
    NportDelete {
        port_handle: u8,
        nport_handle: u16,
    },
    ItAdd {
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        s_id: u32,
        initiator_prli_info: u32,
        fc_nodename: Wwn,
        fc_portname: Wwn,
    },
    ItDelete {
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        s_id: u32,
    },
    AbtsRecv {
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        oxid: u16,
        rxid: u16,
    },
    UnrecoverableErr {
        port_handle: u8,
    },
}

impl FcEventArgs {
    pub fn event_type(&self) -> FcEvent {
        match self {
            FcEventArgs::HwPortInit { .. } => FcEvent::HwPortInit,
            FcEventArgs::HwPortFree { .. } => FcEvent::HwPortFree,
            FcEventArgs::HwPortOnline { .. } => FcEvent::HwPortOnline,
            FcEventArgs::HwPortOffline { .. } => FcEvent::HwPortOffline,
            FcEventArgs::HwPortReset { .. } => FcEvent::HwPortReset,
            FcEventArgs::NportCreate { .. } => FcEvent::NportCreate,
            FcEventArgs::NportDelete { .. } => FcEvent::NportDelete,
            FcEventArgs::ItAdd { .. } => FcEvent::ItAdd,
            FcEventArgs::ItDelete { .. } => FcEvent::ItDelete,
            FcEventArgs::AbtsRecv { .. } => FcEvent::AbtsRecv,
            FcEventArgs::UnrecoverableErr { .. } => FcEvent::UnrecoverableErr,
        }
    }

    pub fn port_handle(&self) -> u8 {
        match self {
            FcEventArgs::HwPortInit { port_handle, .. }
            | FcEventArgs::HwPortFree { port_handle }
            | FcEventArgs::HwPortOnline { port_handle }
            | FcEventArgs::HwPortOffline { port_handle }
            | FcEventArgs::HwPortReset { port_handle, .. }
            | FcEventArgs::NportCreate { port_handle, .. }
            | FcEventArgs::NportDelete { port_handle, .. }
            | FcEventArgs::ItAdd { port_handle, .. }
            | FcEventArgs::ItDelete { port_handle, .. }
            | FcEventArgs::AbtsRecv { port_handle, .. }
            | FcEventArgs::UnrecoverableErr { port_handle } => *port_handle,
        }
    }
}

fn event_done(cb: Option<EventCb>, port: u8, event: FcEvent, err: i32) {
    if let Some(cb) = cb {
        cb(port, event, err);
    }
}

impl FcTransport {
    /// Queue up an event for the main thread. Used by the FC driver to
    /// notify the transport of port and login state changes.
    pub fn enqueue_event(&self, args: FcEventArgs, cb: Option<EventCb>) {
        debug!("Enqueue event {:?}.", args.event_type());
        self.send_main(MainMsg::Event { args, cb });
    }

    pub(crate) fn handle_event(
        &mut self,
        args: FcEventArgs,
        cb: Option<EventCb>,
    ) {
        assert_fc_main_thread!(self);
        let event = args.event_type();
        let port = args.port_handle();

        match args {
            FcEventArgs::HwPortInit {
                port_handle,
                ls_queue,
                ls_queue_size,
                io_queues,
                io_queue_size,
                fcp_rq_id,
            } => {
                let err = self
                    .evnt_hw_port_init(
                        port_handle,
                        ls_queue,
                        ls_queue_size,
                        io_queues,
                        io_queue_size,
                        fcp_rq_id,
                    )
                    .err()
                    .map(|e| e.to_errno())
                    .unwrap_or(0);
                debug!("HW port {} initialize done, rc = {}", port, err);
                event_done(cb, port, event, err);
            }
            FcEventArgs::HwPortFree { port_handle } => {
                let err = self
                    .evnt_hw_port_free(port_handle)
                    .err()
                    .map(|e| e.to_errno())
                    .unwrap_or(0);
                debug!("HW port {} free done, rc = {}", port, err);
                event_done(cb, port, event, err);
            }
            FcEventArgs::HwPortOnline { port_handle } => {
                let err = self
                    .evnt_hw_port_online(port_handle)
                    .err()
                    .map(|e| e.to_errno())
                    .unwrap_or(0);
                debug!("HW port {} online done, rc = {}", port, err);
                event_done(cb, port, event, err);
            }
            FcEventArgs::HwPortOffline { port_handle } => {
                self.evnt_hw_port_offline(port_handle, cb);
            }
            FcEventArgs::HwPortReset {
                port_handle,
                dump_queues,
                mut reason,
            } => {
                reason.truncate(256);
                self.evnt_hw_port_reset(port_handle, dump_queues, reason, cb);
            }
            FcEventArgs::NportCreate {
                port_handle,
                nport_handle,
                d_id,
                fc_nodename,
                fc_portname,
            } => {
                let err = self
                    .evnt_nport_create(
                        port_handle,
                        nport_handle,
                        d_id,
                        fc_nodename,
                        fc_portname,
                    )
                    .err()
                    .map(|e| e.to_errno())
                    .unwrap_or(0);
                event_done(cb, port, event, err);
            }
            FcEventArgs::NportDelete {
                port_handle,
                nport_handle,
            } => {
                self.evnt_nport_delete(port_handle, nport_handle, cb);
            }
            FcEventArgs::ItAdd {
                port_handle,
                nport_handle,
                rpi,
                s_id,
                initiator_prli_info,
                fc_nodename,
                fc_portname,
            } => {
                let err = self
                    .evnt_i_t_add(
                        port_handle,
                        nport_handle,
                        rpi,
                        s_id,
                        initiator_prli_info,
                        fc_nodename,
                        fc_portname,
                    )
                    .err()
                    .map(|e| e.to_errno())
                    .unwrap_or(0);
                debug!("IT add on nport {} done, rc = {}", nport_handle, err);
                event_done(cb, port, event, err);
            }
            FcEventArgs::ItDelete {
                port_handle,
                nport_handle,
                rpi,
                s_id,
            } => {
                debug!("IT delete on nport:{} begin", nport_handle);
                self.i_t_delete_begin(
                    port_handle,
                    nport_handle,
                    rpi,
                    s_id,
                    ItDone::User(cb),
                );
            }
            FcEventArgs::AbtsRecv {
                port_handle,
                nport_handle,
                rpi,
                oxid,
                rxid,
            } => {
                let err = self.evnt_abts_recv(
                    port_handle,
                    nport_handle,
                    rpi,
                    oxid,
                    rxid,
                );
                event_done(cb, port, event, err);
            }
            FcEventArgs::UnrecoverableErr { port_handle } => {
                let err = self.evnt_unrecoverable_err(port_handle);
                event_done(cb, port, event, err);
            }
        }
    }

    /* ---------- port events ---------- */

    fn alloc_hwqp(&mut self, hwqp: Hwqp) -> HwqpId {
        for (i, slot) in self.hwqps.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(hwqp);
                return i;
            }
        }
        self.hwqps.push(Some(hwqp));
        self.hwqps.len() - 1
    }

    fn evnt_hw_port_init(
        &mut self,
        port_handle: u8,
        ls_queue: LldQueue,
        ls_queue_size: u32,
        io_queues: Vec<LldQueue>,
        io_queue_size: u32,
        fcp_rq_id: u16,
    ) -> Result<(), Error> {
        if self.port(port_handle).is_some() {
            error!("Duplicate port found {}.", port_handle);
            return Err(Error::PortExists { port: port_handle });
        }

        // a high id for the LS queue so it never collides with the IO
        // queue ids encoded into connection ids
        let ls_hwqp_id = MAX_NUM_FC_PORTS * io_queues.len() as u16;
        let mut ls_hwqp =
            Hwqp::new(port_handle, ls_hwqp_id, ls_queue, ls_queue_size, true);
        self.lld
            .init_queue(ls_queue, ls_hwqp_id, ls_queue_size)
            .map_err(|source| Error::Lld {
                source,
                msg: "init LS queue".to_string(),
            })?;
        ls_hwqp.state = HwqpState::Offline;
        let ls = self.alloc_hwqp(ls_hwqp);

        let mut ios = Vec::with_capacity(io_queues.len());
        for (i, q) in io_queues.iter().enumerate() {
            let hwqp_id = i as u16;
            let hwqp =
                Hwqp::new(port_handle, hwqp_id, *q, io_queue_size, false);
            if let Err(source) =
                self.lld.init_queue(*q, hwqp_id, io_queue_size)
            {
                for h in ios.iter().chain(std::iter::once(&ls)) {
                    self.hwqps[*h] = None;
                }
                return Err(Error::Lld {
                    source,
                    msg: "init IO queue".to_string(),
                });
            }
            ios.push(self.alloc_hwqp(hwqp));
        }

        self.ports.push(FcPort {
            port_hdl: port_handle,
            state: FcPortState::Offline,
            fcp_rq_id,
            ls_hwqp: ls,
            io_hwqps: ios,
            nports: Vec::new(),
            num_nports: 0,
        });
        Ok(())
    }

    /// Discard parked queue-sync callbacks when their queues go away.
    fn clean_sync_cbs(&mut self, h: HwqpId) {
        let cbs = match self.hwqp_mut(h) {
            Some(q) => std::mem::replace(&mut q.sync_cbs, Vec::new()),
            None => return,
        };
        for cb in cbs {
            let done = match self.ops.get_mut(&cb.op) {
                Some(OpCtx::Abts(ctx)) => {
                    ctx.hwqps_responded += 1;
                    ctx.hwqps_responded >= ctx.num_hwqps
                }
                _ => false,
            };
            if done {
                self.take_op(cb.op);
            }
        }
    }

    fn evnt_hw_port_free(&mut self, port_handle: u8) -> Result<(), Error> {
        let (ls, ios, has_nports) = match self.port(port_handle) {
            Some(p) => {
                (p.ls_hwqp, p.io_hwqps.clone(), !p.nports.is_empty())
            }
            None => {
                error!("Unable to find the FC port {}", port_handle);
                return Err(Error::PortNotFound { port: port_handle });
            }
        };
        if has_nports {
            error!("Hw port {}: nports not cleared up yet.", port_handle);
            return Err(Error::NportsRemain { port: port_handle });
        }

        self.clean_sync_cbs(ls);
        self.hwqps[ls] = None;
        for h in ios {
            self.clean_sync_cbs(h);
            self.hwqps[h] = None;
        }

        let i = self.port_idx(port_handle).unwrap();
        self.ports.remove(i);
        Ok(())
    }

    pub(crate) fn hwqp_set_online(&mut self, h: HwqpId) {
        let queue = match self.hwqp_mut(h) {
            Some(q) => {
                if q.state == HwqpState::Online {
                    return;
                }
                q.state = HwqpState::Online;
                q.num_conns = 0;
                q.queue
            }
            None => return,
        };
        let _ = self.lld.set_queue_online(queue, true);
    }

    pub(crate) fn hwqp_set_offline(&mut self, h: HwqpId) {
        let queue = match self.hwqp_mut(h) {
            Some(q) => {
                if q.state == HwqpState::Offline {
                    return;
                }
                q.state = HwqpState::Offline;
                q.queue
            }
            None => return,
        };
        let _ = self.lld.set_queue_online(queue, false);
    }

    fn evnt_hw_port_online(&mut self, port_handle: u8) -> Result<(), Error> {
        let (ls, ios) = match self.port_mut(port_handle) {
            Some(p) => {
                if p.state == FcPortState::Online {
                    error!("Hw port {} online failed.", port_handle);
                    return Err(Error::PortState {
                        port: port_handle,
                        msg: "already online".to_string(),
                    });
                }
                p.state = FcPortState::Online;
                (p.ls_hwqp, p.io_hwqps.clone())
            }
            None => {
                error!("Unable to find the FC port {}", port_handle);
                return Err(Error::PortNotFound { port: port_handle });
            }
        };

        self.hwqp_set_online(ls);
        // set up a poller for each io queue
        for h in ios {
            self.hwqp_set_online(h);
            self.poll_group_add_hwqp(h);
        }
        Ok(())
    }

    fn evnt_hw_port_offline(&mut self, port_handle: u8, cb: Option<EventCb>) {
        let (ls, ios) = match self.port_mut(port_handle) {
            Some(p) => {
                if p.state == FcPortState::Offline {
                    error!("Hw port {} already offline.", port_handle);
                    event_done(cb, port_handle, FcEvent::HwPortOffline, 0);
                    return;
                }
                p.state = FcPortState::Offline;
                (p.ls_hwqp, p.io_hwqps.clone())
            }
            None => {
                error!("Unable to find the FC port {}", port_handle);
                event_done(
                    cb,
                    port_handle,
                    FcEvent::HwPortOffline,
                    Error::PortNotFound { port: port_handle }.to_errno(),
                );
                return;
            }
        };

        self.hwqp_set_offline(ls);

        let op = self.alloc_op(OpCtx::PortOffline(PortOfflineOp {
            port_hdl: port_handle,
            pending: ios.len() as u32,
            cb,
        }));

        if ios.is_empty() {
            self.hwqp_removed_finish(op);
            return;
        }
        for h in ios {
            self.hwqp_set_offline(h);
            self.poll_group_remove_hwqp(h, op);
        }
    }

    /// One IO queue acknowledged its removal from the poll group.
    pub(crate) fn hwqp_removed(&mut self, op: u64, h: HwqpId) {
        debug!("Remove hwqp {} from fgroup done", h);
        let done = match self.ops.get_mut(&op) {
            Some(OpCtx::PortOffline(o)) => {
                o.pending = o.pending.saturating_sub(1);
                o.pending == 0
            }
            _ => return,
        };
        if done {
            self.hwqp_removed_finish(op);
        }
    }

    fn hwqp_removed_finish(&mut self, op: u64) {
        let (port_hdl, cb) = match self.take_op(op) {
            Some(OpCtx::PortOffline(o)) => (o.port_hdl, o.cb),
            _ => return,
        };
        // all nports should have been purged before the offline; zombie
        // whatever is left
        if let Some(port) = self.port_mut(port_hdl) {
            if !port.nports.is_empty() {
                error!(
                    "Hw port {}: nports remain at offline time",
                    port_hdl
                );
                for nport in port.nports.iter_mut() {
                    nport.state = ObjState::Zombie;
                }
            }
        }
        debug!("HW port {} offline done", port_hdl);
        event_done(cb, port_hdl, FcEvent::HwPortOffline, 0);
    }

    fn evnt_hw_port_reset(
        &mut self,
        port_handle: u8,
        dump_queues: bool,
        reason: String,
        cb: Option<EventCb>,
    ) {
        debug!("HW port {} reset", port_handle);
        let (state, ls, ios) = match self.port(port_handle) {
            Some(p) => (p.state, p.ls_hwqp, p.io_hwqps.clone()),
            None => {
                error!("Unable to find the FC port {}", port_handle);
                event_done(
                    cb,
                    port_handle,
                    FcEvent::HwPortReset,
                    Error::PortNotFound { port: port_handle }.to_errno(),
                );
                return;
            }
        };

        if state == FcPortState::Offline {
            self.port_mut(port_handle).unwrap().state =
                FcPortState::Quiesced;
        }
        if self.port(port_handle).unwrap().state == FcPortState::Quiesced {
            debug!("Port {} already in quiesced state.", port_handle);
            event_done(cb, port_handle, FcEvent::HwPortReset, 0);
            return;
        }

        let op = self.alloc_op(OpCtx::PortQuiesce(PortQuiesceOp {
            port_hdl: port_handle,
            pending: 1 + ios.len() as u32,
            cb,
            reason: if dump_queues { reason } else { String::new() },
        }));

        // quiesce queue polling now, don't wait for the poller
        for h in std::iter::once(ls).chain(ios.into_iter()) {
            if let Some(q) = self.hwqp_mut(h) {
                q.state = HwqpState::Offline;
            }
            if let Some(q) = self.hwqp(h) {
                q.send_msg(PollerMsg::QuiesceQueue { op });
            }
        }
    }

    pub(crate) fn queue_quiesced_cb(&mut self, op: u64, h: HwqpId) {
        debug!("Queue{} quiesced", h);
        let done = match self.ops.get_mut(&op) {
            Some(OpCtx::PortQuiesce(o)) => {
                o.pending = o.pending.saturating_sub(1);
                o.pending == 0
            }
            _ => return,
        };
        if !done {
            return;
        }
        let (port_hdl, cb, reason) = match self.take_op(op) {
            Some(OpCtx::PortQuiesce(o)) => (o.port_hdl, o.cb, o.reason),
            _ => return,
        };
        match self.port_mut(port_hdl) {
            Some(p) if p.state == FcPortState::Quiesced => {
                error!("Port {} already in quiesced state.", port_hdl);
            }
            Some(p) => p.state = FcPortState::Quiesced,
            None => {}
        }
        if !reason.is_empty() {
            info!("HW port {} reset: {}", port_hdl, reason);
        }
        debug!("HW port {} reset done", port_hdl);
        event_done(cb, port_hdl, FcEvent::HwPortReset, 0);
    }

    /* ---------- nport events ---------- */

    fn evnt_nport_create(
        &mut self,
        port_handle: u8,
        nport_handle: u16,
        d_id: u32,
        fc_nodename: Wwn,
        fc_portname: Wwn,
    ) -> Result<(), Error> {
        if self.port(port_handle).is_none() {
            return Err(Error::PortNotFound { port: port_handle });
        }
        if self.nport(port_handle, nport_handle).is_some() {
            error!(
                "Duplicate nport {} exists for FC port:{}.",
                nport_handle, port_handle
            );
            return Err(Error::NportExists {
                port: port_handle,
                nport: nport_handle,
            });
        }

        let nport = Nport::new(
            port_handle,
            nport_handle,
            d_id,
            fc_nodename,
            fc_portname,
        );
        self.port_mut(port_handle).unwrap().add_nport(nport);

        // populate the nport address to the nvmf subsystems
        let rc = self.with_backend(|be, t| {
            be.add_listener(t, port_handle, nport_handle)
        });
        if let Err(source) = rc {
            self.port_mut(port_handle).unwrap().remove_nport(nport_handle);
            return Err(Error::Lld {
                source,
                msg: "add listener".to_string(),
            });
        }
        Ok(())
    }

    fn evnt_nport_delete(
        &mut self,
        port_handle: u8,
        nport_handle: u16,
        cb: Option<EventCb>,
    ) {
        let state = match self.nport(port_handle, nport_handle) {
            Some(n) => n.state,
            None => {
                error!(
                    "Unable to find the FC nport {} for FC Port: {}.",
                    nport_handle, port_handle
                );
                event_done(
                    cb,
                    port_handle,
                    FcEvent::NportDelete,
                    Error::NportNotFound {
                        port: port_handle,
                        nport: nport_handle,
                    }
                    .to_errno(),
                );
                return;
            }
        };

        match state {
            ObjState::Created => {}
            ObjState::ToBeDeleted => {
                // deletion already in progress: register the callback and
                // let the running teardown complete it
                let existing =
                    self.nport(port_handle, nport_handle).unwrap().del_op;
                match (existing, cb) {
                    (Some(op), Some(cb)) => {
                        if let Some(OpCtx::NportDelete(o)) =
                            self.ops.get_mut(&op)
                        {
                            o.cbs.push(cb);
                        }
                    }
                    (None, cb) => {
                        event_done(
                            cb,
                            port_handle,
                            FcEvent::NportDelete,
                            -(nix::errno::Errno::ENODEV as i32),
                        );
                    }
                    _ => {}
                }
                return;
            }
            ObjState::Zombie => {
                error!("Nport partially created/deleted");
                event_done(
                    cb,
                    port_handle,
                    FcEvent::NportDelete,
                    -(nix::errno::Errno::ENODEV as i32),
                );
                return;
            }
        }

        let op = self.alloc_op(OpCtx::NportDelete(NportDeleteOp {
            port_hdl: port_handle,
            nport_hdl: nport_handle,
            cbs: cb.into_iter().collect(),
        }));
        {
            let nport = self.nport_mut(port_handle, nport_handle).unwrap();
            nport.state = ObjState::ToBeDeleted;
            nport.del_op = Some(op);
        }

        // stop advertising the nport
        let rc = self.with_backend(|be, t| {
            be.remove_listener(t, port_handle, nport_handle)
        });
        if rc.is_err() {
            error!(
                "Unable to remove the listen addr in the subsystems for \
                 nport {}.",
                nport_handle
            );
            self.nport_mut(port_handle, nport_handle).unwrap().state =
                ObjState::Zombie;
            self.nport_delete_fail(op);
            return;
        }

        let rports: Vec<(u32, u16)> = self
            .nport(port_handle, nport_handle)
            .unwrap()
            .rports
            .iter()
            .map(|r| (r.s_id, r.rpi))
            .collect();

        if rports.is_empty() {
            // no rports to delete, complete the nport deletion
            self.nport_delete_check_complete(op);
            return;
        }
        for (s_id, rpi) in rports {
            self.i_t_delete_begin(
                port_handle,
                nport_handle,
                rpi,
                s_id,
                ItDone::NportDelete { op },
            );
        }
    }

    fn nport_delete_fail(&mut self, op: u64) {
        if let Some(OpCtx::NportDelete(o)) = self.take_op(op) {
            if let Some(nport) = self.nport_mut(o.port_hdl, o.nport_hdl) {
                nport.del_op = None;
            }
            for cb in o.cbs {
                cb(
                    o.port_hdl,
                    FcEvent::NportDelete,
                    -(nix::errno::Errno::EIO as i32),
                );
            }
        }
    }

    /// Free the nport once the last rport is gone and no associations
    /// remain, then run every registered delete callback.
    pub(crate) fn nport_delete_check_complete(&mut self, op: u64) {
        let (port_hdl, nport_hdl) = match self.ops.get(&op) {
            Some(OpCtx::NportDelete(o)) => (o.port_hdl, o.nport_hdl),
            _ => return,
        };
        let finished = match self.nport(port_hdl, nport_hdl) {
            Some(n) => {
                if n.has_no_rport() {
                    assert_eq!(n.assoc_count, 0, "association count != 0");
                    true
                } else {
                    false
                }
            }
            None => false,
        };
        if !finished {
            return;
        }

        self.port_mut(port_hdl).unwrap().remove_nport(nport_hdl);
        if let Some(OpCtx::NportDelete(o)) = self.take_op(op) {
            debug!(
                "NPort {} delete done successfully, fc port:{}.",
                nport_hdl, port_hdl
            );
            for cb in o.cbs {
                cb(port_hdl, FcEvent::NportDelete, 0);
            }
        }
    }

    /* ---------- I_T (PRLI) events ---------- */

    #[allow(clippy::too_many_arguments)]
    fn evnt_i_t_add(
        &mut self,
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        s_id: u32,
        _initiator_prli_info: u32,
        fc_nodename: Wwn,
        fc_portname: Wwn,
    ) -> Result<(), Error> {
        let nport = match self.nport_mut(port_handle, nport_handle) {
            Some(n) => n,
            None => {
                error!("Unable to find the FC nport {}", nport_handle);
                return Err(Error::NportNotFound {
                    port: port_handle,
                    nport: nport_handle,
                });
            }
        };

        if nport.find_rport(s_id, rpi).is_some() {
            error!(
                "Duplicate rport found for FC nport {}: sid:{} rpi:{}",
                nport_handle, s_id, rpi
            );
            return Err(Error::RportExists {
                nport: nport_handle,
                s_id,
                rpi,
            });
        }

        nport.add_rport(RemotePort {
            s_id,
            rpi,
            assoc_count: 0,
            fc_nodename,
            fc_portname,
            state: ObjState::Created,
        });

        debug!(
            "IT add on nport {}: target prli params 0x{:x}",
            nport_handle,
            prli_service_params()
        );
        Ok(())
    }

    pub(crate) fn i_t_delete_begin(
        &mut self,
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        s_id: u32,
        done: ItDone,
    ) {
        let d_id = match self.nport(port_handle, nport_handle) {
            Some(n) => n.d_id,
            None => {
                error!("Unable to find the FC nport:{}", nport_handle);
                self.it_done_fire(
                    done,
                    port_handle,
                    -(nix::errno::Errno::EINVAL as i32),
                );
                return;
            }
        };

        let rport_state = self
            .nport(port_handle, nport_handle)
            .unwrap()
            .find_rport(s_id, rpi)
            .map(|i| {
                self.nport(port_handle, nport_handle).unwrap().rports[i].state
            });

        match rport_state {
            Some(ObjState::Created) => {}
            Some(_) | None => {
                // a previous request already removed (or is removing) the
                // rport
                self.it_done_fire(
                    done,
                    port_handle,
                    -(nix::errno::Errno::ENODEV as i32),
                );
                return;
            }
        }

        // purge any LS requests still parked for this rport, then flip
        // the state so no new ones are accepted
        let ls_hwqp = self.port(port_handle).unwrap().ls_hwqp;
        self.delete_ls_pending(ls_hwqp, d_id, s_id);

        {
            let nport = self.nport_mut(port_handle, nport_handle).unwrap();
            let i = nport.find_rport(s_id, rpi).unwrap();
            nport.rports[i].state = ObjState::ToBeDeleted;
        }

        let op = self.alloc_op(OpCtx::ItDelete(ItDeleteOp {
            port_hdl: port_handle,
            nport_hdl: nport_handle,
            s_id,
            rpi,
            done,
        }));

        // delete all associations related to this ITN
        let serials: Vec<u64> = self
            .nport(port_handle, nport_handle)
            .unwrap()
            .assocs
            .iter()
            .filter(|serial| {
                self.assoc(**serial).map(|a| a.s_id == s_id).unwrap_or(false)
            })
            .copied()
            .collect();

        debug!(
            "IT delete associations on nport:{}: {} scheduled",
            nport_handle,
            serials.len()
        );

        if serials.is_empty() {
            // nothing scheduled, the callback would never fire otherwise
            self.it_del_assoc_done(op, 0);
            return;
        }
        for serial in serials {
            self.delete_association_by_serial(
                serial,
                false,
                false,
                Some(DelAssocCb::ItDelete { op }),
            );
        }
    }

    fn it_done_fire(&mut self, done: ItDone, port_hdl: u8, err: i32) {
        match done {
            ItDone::User(cb) => {
                event_done(cb, port_hdl, FcEvent::ItDelete, err)
            }
            ItDone::NportDelete { op } => {
                self.nport_delete_check_complete(op)
            }
        }
    }

    /// One association belonging to the dying ITN finished its teardown.
    pub(crate) fn it_del_assoc_done(&mut self, op: u64, err: u32) {
        let (port_hdl, nport_hdl, s_id, rpi) = match self.ops.get(&op) {
            Some(OpCtx::ItDelete(o)) => {
                (o.port_hdl, o.nport_hdl, o.s_id, o.rpi)
            }
            _ => return,
        };
        if err != 0 {
            error!("Nport's association delete returned error");
        }

        let rport_done = match self.nport(port_hdl, nport_hdl) {
            Some(nport) => match nport.find_rport(s_id, rpi) {
                Some(i) => nport.rports[i].assoc_count == 0,
                None => true,
            },
            None => true,
        };
        if !rport_done {
            // more association deletes still in flight
            return;
        }

        if let Some(nport) = self.nport_mut(port_hdl, nport_hdl) {
            nport.remove_rport(s_id, rpi);
        }

        if let Some(OpCtx::ItDelete(o)) = self.take_op(op) {
            debug!(
                "IT delete assoc_cb on nport {} done, s_id:{} rpi:{}",
                nport_hdl, s_id, rpi
            );
            self.it_done_fire(o.done, port_hdl, 0);
        }
    }

    /* ---------- ABTS & unrecoverable error ---------- */

    fn evnt_abts_recv(
        &mut self,
        port_handle: u8,
        nport_handle: u16,
        rpi: u16,
        oxid: u16,
        rxid: u16,
    ) -> i32 {
        debug!(
            "FC ABTS received. RPI:{}, oxid:{}, rxid:{}",
            rpi, oxid, rxid
        );
        let state = match self.nport(port_handle, nport_handle) {
            Some(n) => n.state,
            None => {
                error!("Unable to find the FC nport {}", nport_handle);
                return -(nix::errno::Errno::EINVAL as i32);
            }
        };
        if state == ObjState::ToBeDeleted {
            debug!(
                "FC ABTS dropped because the nport is being deleted; \
                 RPI:{}, oxid:{}, rxid:{}",
                rpi, oxid, rxid
            );
            return 0;
        }
        self.handle_abts_frame(port_handle, nport_handle, rpi, oxid, rxid);
        0
    }

    fn evnt_unrecoverable_err(&mut self, port_handle: u8) -> i32 {
        let serials: Vec<u64> = match self.port(port_handle) {
            Some(p) => p
                .nports
                .iter()
                .flat_map(|n| n.assocs.iter().copied())
                .collect(),
            None => {
                error!("Unable to find the FC port {}", port_handle);
                return -(nix::errno::Errno::EINVAL as i32);
            }
        };
        error!(
            "Unrecoverable error on FC port {}; failing {} associations",
            port_handle,
            serials.len()
        );
        for serial in serials {
            self.with_backend(|be, t| be.ctrlr_fatal(t, serial));
        }
        0
    }
}
