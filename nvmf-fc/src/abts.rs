//! ABTS handling: fan the abort out to every HWQP owning a connection
//! for the remote port, retry behind a queue-sync marker when the
//! exchange is not visible yet, and answer with BA_ACC or BA_RJT.

use crate::{
    fabric::{assoc::ReqTag, hwqp::HwqpId},
    lld::BlsRsp,
    poller::{PollerApiRet, PollerCbCtx, PollerMsg},
    request::AbortCb,
    transport::{FcTransport, OpCtx},
    wire::frame::{BLS_REJECT_EXP_INVALID_OXID, BLS_REJECT_EXP_NOINFO},
};

/// Context of one inbound ABTS, correlated by a unique id across the
/// two-pass protocol.
pub(crate) struct AbtsCtx {
    pub handled: bool,
    pub hwqps_responded: u16,
    pub num_hwqps: u16,
    pub rpi: u16,
    pub oxid: u16,
    pub rxid: u16,
    pub port_hdl: u8,
    pub nport_hdl: u16,
    pub hwqps: Vec<HwqpId>,
    pub queue_synced: bool,
    pub u_id: u64,
    pub ls_hwqp: HwqpId,
    pub fcp_rq_id: u16,
}

impl FcTransport {
    /// Entry point from the ABTS_RECV administrative event.
    pub(crate) fn handle_abts_frame(
        &mut self,
        port_hdl: u8,
        nport_hdl: u16,
        rpi: u16,
        oxid: u16,
        rxid: u16,
    ) {
        info!(
            "Handle ABTS frame for nport: {}, rpi: 0x{:x}, oxid: 0x{:x}, \
             rxid: 0x{:x}",
            nport_hdl, rpi, oxid, rxid
        );

        let (ls_hwqp, fcp_rq_id) = match self.port(port_hdl) {
            Some(p) => (p.ls_hwqp, p.fcp_rq_id),
            None => return,
        };

        // every HWQP owning at least one connection for this RPI,
        // deduplicated
        let mut hwqps: Vec<HwqpId> = Vec::new();
        if let Some(nport) = self.nport(port_hdl, nport_hdl) {
            for serial in nport.assocs.clone() {
                let assoc = match self.assoc(serial) {
                    Some(a) => a,
                    None => continue,
                };
                for slot in assoc.active_conns() {
                    let conn = match assoc.conn(*slot) {
                        Some(c) => c,
                        None => continue,
                    };
                    if conn.rpi != rpi {
                        continue;
                    }
                    if let Some(h) = conn.hwqp {
                        if !hwqps.contains(&h) {
                            hwqps.push(h);
                        }
                    }
                }
            }
        }

        if hwqps.is_empty() {
            self.xmt_bls_rsp(
                ls_hwqp,
                oxid,
                rxid,
                rpi,
                true,
                BLS_REJECT_EXP_NOINFO,
            );
            info!(
                "BLS_RJT for ABTS frame for nport: {}, rpi: 0x{:x}, \
                 oxid: 0x{:x}, rxid: 0x{:x}",
                nport_hdl, rpi, oxid, rxid
            );
            return;
        }

        let u_id = self.alloc_abts_uid();
        let num_hwqps = hwqps.len() as u16;
        let targets = hwqps.clone();
        let op = self.alloc_op(OpCtx::Abts(AbtsCtx {
            handled: false,
            hwqps_responded: 0,
            num_hwqps,
            rpi,
            oxid,
            rxid,
            port_hdl,
            nport_hdl,
            hwqps,
            queue_synced: false,
            u_id,
            ls_hwqp,
            fcp_rq_id,
        }));

        for h in targets {
            if let Some(q) = self.hwqp(h) {
                q.send_msg(PollerMsg::AbtsReceived { op });
            }
        }
    }

    /// ABTS_RECEIVED on one HWQP: search the in-use list by (RPI, OX_ID).
    pub(crate) fn poller_abts_received(&mut self, h: HwqpId, op: u64) {
        let (rpi, oxid) = match self.ops.get(&op) {
            Some(OpCtx::Abts(ctx)) => (ctx.rpi, ctx.oxid),
            _ => return,
        };

        let found = self.rpi_find_req(h, rpi, oxid);
        match found {
            Some(tag) => {
                self.request_abort(
                    tag,
                    false,
                    Some(AbortCb::Abts { op, hwqp: h }),
                );
            }
            None => {
                self.poller_done(
                    PollerCbCtx::AbtsRecvd { op, hwqp: h },
                    PollerApiRet::OxidNotFound,
                );
            }
        }
    }

    fn rpi_find_req(
        &self,
        h: HwqpId,
        rpi: u16,
        oxid: u16,
    ) -> Option<ReqTag> {
        let q = self.hwqp(h)?;
        let conns = q.rport_table.get(&rpi)?;
        for key in conns {
            let conn = match self.conn(*key) {
                Some(c) => c,
                None => continue,
            };
            for idx in &conn.in_use_reqs {
                let tag = ReqTag {
                    conn: *key,
                    idx: *idx,
                };
                if let Some(req) = self.req(tag) {
                    if req.oxid == oxid {
                        return Some(tag);
                    }
                }
            }
        }
        None
    }

    /// The aborted request finished; report this queue as handled.
    pub(crate) fn abts_poller_done(&mut self, op: u64, h: HwqpId) {
        if let Some(OpCtx::Abts(ctx)) = self.ops.get(&op) {
            debug!(
                "ABTS poller done, rpi: 0x{:x}, oxid: 0x{:x}, rxid: 0x{:x}",
                ctx.rpi, ctx.oxid, ctx.rxid
            );
        }
        self.poller_done(
            PollerCbCtx::AbtsRecvd { op, hwqp: h },
            PollerApiRet::Success,
        );
    }

    /// One queue answered; once all have, decide ACC / RJT / second pass.
    pub(crate) fn abts_handled_cb(
        &mut self,
        op: u64,
        _h: HwqpId,
        ret: PollerApiRet,
    ) {
        let all_done = {
            let ctx = match self.ops.get_mut(&op) {
                Some(OpCtx::Abts(ctx)) => ctx,
                _ => return,
            };
            if ret != PollerApiRet::OxidNotFound {
                ctx.handled = true;
            }
            ctx.hwqps_responded += 1;
            ctx.hwqps_responded >= ctx.num_hwqps
        };
        if !all_done {
            return;
        }

        let (port_hdl, nport_hdl, rpi, oxid, rxid, handled, queue_synced, ls_hwqp) = {
            let ctx = match self.ops.get(&op) {
                Some(OpCtx::Abts(ctx)) => ctx,
                _ => return,
            };
            (
                ctx.port_hdl,
                ctx.nport_hdl,
                ctx.rpi,
                ctx.oxid,
                ctx.rxid,
                ctx.handled,
                ctx.queue_synced,
                ctx.ls_hwqp,
            )
        };

        if self.nport(port_hdl, nport_hdl).is_none() {
            // nport was deleted while the pollers processed the abort
            info!(
                "nport_{} deleted while processing ABTS frame, rpi: 0x{:x}, \
                 oxid: 0x{:x}, rxid: 0x{:x}",
                nport_hdl, rpi, oxid, rxid
            );
            self.take_op(op);
            return;
        }

        if !handled {
            if !queue_synced && self.handle_abts_notfound(op).is_ok() {
                debug!(
                    "QueueSync for nport: {}, rpi: 0x{:x}, oxid: 0x{:x}, \
                     rxid: 0x{:x}",
                    nport_hdl, rpi, oxid, rxid
                );
                return;
            }
            self.xmt_bls_rsp(
                ls_hwqp,
                oxid,
                rxid,
                rpi,
                true,
                BLS_REJECT_EXP_INVALID_OXID,
            );
        } else {
            self.xmt_bls_rsp(ls_hwqp, oxid, rxid, rpi, false, 0);
        }
        info!(
            "BLS_{} sent for ABTS frame nport: {}, rpi: 0x{:x}, oxid: 0x{:x}, \
             rxid: 0x{:x}",
            if handled { "ACC" } else { "REJ" },
            nport_hdl,
            rpi,
            oxid,
            rxid
        );
        self.take_op(op);
    }

    /// Second pass: the exchange may be sitting in a receive queue the
    /// poller has not consumed yet. Post a sync marker and search again
    /// once every involved queue saw it.
    fn handle_abts_notfound(&mut self, op: u64) -> Result<(), ()> {
        if !self.lld.queue_sync_available() {
            return Err(());
        }

        let (u_id, hwqps, ls_hwqp, fcp_rq_id) = {
            let ctx = match self.ops.get_mut(&op) {
                Some(OpCtx::Abts(ctx)) => ctx,
                _ => return Err(()),
            };
            ctx.hwqps_responded = 0;
            (ctx.u_id, ctx.hwqps.clone(), ctx.ls_hwqp, ctx.fcp_rq_id)
        };

        for h in &hwqps {
            if let Some(q) = self.hwqp(*h) {
                q.send_msg(PollerMsg::QueueSync { u_id, op });
            }
        }

        debug!("QueueSync(0x{:x}) sent", u_id);

        let ls_queue = match self.hwqp(ls_hwqp) {
            Some(q) => q.queue,
            None => return Err(()),
        };
        // post the marker to track the aborted exchange
        let _ = self.lld.issue_queue_sync_marker(ls_queue, u_id, fcp_rq_id);
        Ok(())
    }

    /// Every involved queue saw the marker: rerun the search.
    pub(crate) fn queue_synced_cb(&mut self, op: u64, _h: HwqpId) {
        let (resend, hwqps, u_id) = {
            let ctx = match self.ops.get_mut(&op) {
                Some(OpCtx::Abts(ctx)) => ctx,
                _ => return,
            };
            ctx.hwqps_responded += 1;
            if ctx.hwqps_responded < ctx.num_hwqps {
                (false, Vec::new(), ctx.u_id)
            } else {
                ctx.queue_synced = true;
                ctx.hwqps_responded = 0;
                ctx.handled = false;
                (true, ctx.hwqps.clone(), ctx.u_id)
            }
        };
        if !resend {
            return;
        }
        debug!("QueueSync(0x{:x}) completed, resending ABTS", u_id);
        for h in hwqps {
            if let Some(q) = self.hwqp(h) {
                q.send_msg(PollerMsg::AbtsReceived { op });
            }
        }
    }

    pub(crate) fn xmt_bls_rsp(
        &mut self,
        ls_hwqp: HwqpId,
        ox_id: u16,
        rx_id: u16,
        rpi: u16,
        rjt: bool,
        rjt_exp: u8,
    ) {
        let queue = match self.hwqp(ls_hwqp) {
            Some(q) => q.queue,
            None => return,
        };
        let _ = self.lld.post_bls_response(
            queue,
            BlsRsp {
                ox_id,
                rx_id,
                rpi,
                rjt,
                rjt_exp,
            },
        );
    }
}
