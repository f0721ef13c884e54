//! Association and connection link-service scenarios.

pub mod common;

use assert_matches::assert_matches;

use common::*;
use nvmf_fc::{
    wire::iu::{
        ErspIu, NvmeCmd, CMND_IU_NODATA, CMND_IU_WRITE,
        NVME_OPC_KEEP_ALIVE, NVME_SC_ABORTED_MISSING_FUSED,
    },
    wire::ls::{
        AccHdr, LsRjt, CrConnAcc, LS_ACC, LS_CREATE_CONNECTION,
        LS_DISCONNECT, RJT_EXP_INV_ESRP, RJT_EXP_INV_Q_ID,
        RJT_EXP_INV_SUBNQN, RJT_EXP_INV_HOSTNQN, RJT_EXP_SQ_SIZE,
        RJT_RC_INV_ASSOC, RJT_RC_INV_HOST, RJT_RC_INV_PARAM,
    },
};

#[test]
fn single_association_no_io() {
    let mut ctx = setup();
    setup_port(&mut ctx, 2);

    let (assoc_id, conn_id) = create_association(&mut ctx, 0x11);
    assert_ne!(assoc_id, 0);
    assert_eq!(assoc_id, conn_id);

    // the connection id encodes its owning queue in the low byte
    let h = io_hwqp(&ctx, conn_id);
    assert_eq!(
        (conn_id & 0xff) as u16,
        ctx.t.hwqp(h).unwrap().hwqp_id
    );
    let key = conn_key(&ctx, conn_id);
    assert_eq!(ctx.t.conn(key).unwrap().conn_id, conn_id);
    assert_eq!(ctx.t.conn(key).unwrap().qid, 0);

    let nport = ctx.t.nport(PORT, NPORT).unwrap();
    assert_eq!(nport.assoc_count, 1);
    assert_eq!(nport.assocs.len(), nport.assoc_count as usize);
    assert_eq!(nport.rports.len(), nport.rport_count as usize);
    assert_eq!(nport.rports[0].assoc_count, 1);

    // disconnect tears everything down and accepts with a bare header
    send_ls(&mut ctx, 0x12, &disc_payload(assoc_id));
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let (oxid, bytes) = s.sent_ls_rsps.last().unwrap();
    assert_eq!(*oxid, 0x12);
    let hdr = AccHdr::decode(bytes).unwrap();
    assert_eq!(hdr.ls_cmd, LS_ACC);
    assert_eq!(hdr.rqst_ls_cmd, LS_DISCONNECT);
    assert_eq!(hdr.desc_list_len, 16);
    drop(s);

    assert_eq!(ctx.t.nport(PORT, NPORT).unwrap().assoc_count, 0);
    assert_eq!(ctx.t.num_associations(), 0);
    assert_eq!(ctx.t.hwqp(h).unwrap().num_conns, 0);
}

#[test]
fn max_connections_rejects_one_past_limit() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    // default max_qpairs_per_ctrlr = 5: one admin plus four IO queues
    let (assoc_id, _conn) = create_association(&mut ctx, 0x20);

    for qid in 1 ..= 4u16 {
        let before = ctx.lld.0.lock().sent_ls_rsps.len();
        send_ls(
            &mut ctx,
            0x20 + qid,
            &cioc_payload(assoc_id, qid, 64, 8),
        );
        pump(&mut ctx);
        let s = ctx.lld.0.lock();
        assert_eq!(s.sent_ls_rsps.len(), before + 1);
        let (_, bytes) = s.sent_ls_rsps.last().unwrap();
        let (hdr, acc) = CrConnAcc::decode(bytes).unwrap();
        assert_eq!(hdr.ls_cmd, LS_ACC);
        assert_eq!(hdr.rqst_ls_cmd, LS_CREATE_CONNECTION);
        assert_ne!(acc.conn_id, 0);
    }

    // the fifth IO queue does not fit
    send_ls(&mut ctx, 0x30, &cioc_payload(assoc_id, 5, 64, 8));
    pump(&mut ctx);
    let s = ctx.lld.0.lock();
    let (_, bytes) = s.sent_ls_rsps.last().unwrap();
    let rjt = LsRjt::decode(bytes).unwrap();
    assert_eq!(rjt.reason_code, RJT_RC_INV_PARAM);
    assert_eq!(rjt.reason_explanation, RJT_EXP_INV_Q_ID);
}

#[test]
fn cioc_unknown_association_id() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, _conn) = create_association(&mut ctx, 0x40);
    let assocs = ctx.t.num_associations();

    send_ls(&mut ctx, 0x41, &cioc_payload(0xffff, 1, 64, 8));
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let (_, bytes) = s.sent_ls_rsps.last().unwrap();
    let rjt = LsRjt::decode(bytes).unwrap();
    assert_eq!(rjt.reason_code, RJT_RC_INV_ASSOC);
    drop(s);
    // no other side effects
    assert_eq!(ctx.t.num_associations(), assocs);
    assert_eq!(ctx.t.nport(PORT, NPORT).unwrap().assoc_count, 1);
}

#[test]
fn ls_boundary_rejects() {
    let mut ctx = setup();
    ctx.be.0.lock().subsystems.push((
        "nqn.2017-11.io.spdk:subsystem.locked".to_string(),
        vec!["nqn.someone-else".to_string()],
    ));
    setup_port(&mut ctx, 1);
    let (assoc_id, _conn) = create_association(&mut ctx, 0x50);

    let reject = |ctx: &mut TestCtx, payload: &[u8], oxid: u16| -> LsRjt {
        send_ls(ctx, oxid, payload);
        pump(ctx);
        let s = ctx.lld.0.lock();
        let (rsp_oxid, bytes) = s.sent_ls_rsps.last().unwrap();
        assert_eq!(*rsp_oxid, oxid);
        LsRjt::decode(bytes).unwrap()
    };

    // CIOC with SQ size 0
    let rjt = reject(&mut ctx, &cioc_payload(assoc_id, 1, 0, 8), 0x51);
    assert_eq!(rjt.reason_code, RJT_RC_INV_PARAM);
    assert_eq!(rjt.reason_explanation, RJT_EXP_SQ_SIZE);

    // CIOC with ERSP ratio >= SQ size
    let rjt = reject(&mut ctx, &cioc_payload(assoc_id, 1, 64, 64), 0x52);
    assert_eq!(rjt.reason_code, RJT_RC_INV_PARAM);
    assert_eq!(rjt.reason_explanation, RJT_EXP_INV_ESRP);

    // CASS with unknown subnqn
    let mut bad = nvmf_fc::wire::ls::CrAssocRqst {
        ersp_ratio: 16,
        sqsize: 32,
        hostnqn: HOSTNQN.to_string(),
        subnqn: "nqn.2017-11.io.spdk:subsystem.unknown".to_string(),
        ..Default::default()
    };
    let mut payload = Vec::new();
    bad.encode(&mut payload);
    let rjt = reject(&mut ctx, &payload, 0x53);
    assert_eq!(rjt.reason_code, RJT_RC_INV_PARAM);
    assert_eq!(rjt.reason_explanation, RJT_EXP_INV_SUBNQN);

    // CASS with a host the subsystem does not allow
    bad.subnqn = "nqn.2017-11.io.spdk:subsystem.locked".to_string();
    let mut payload = Vec::new();
    bad.encode(&mut payload);
    let rjt = reject(&mut ctx, &payload, 0x54);
    assert_eq!(rjt.reason_code, RJT_RC_INV_HOST);
    assert_eq!(rjt.reason_explanation, RJT_EXP_INV_HOSTNQN);
}

#[test]
fn ls_response_transmit_failure_cleans_up() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);

    ctx.lld.0.lock().ls_rsp_fail = true;
    send_ls(&mut ctx, 0x60, &cass_payload(32, 16));
    pump(&mut ctx);

    // nothing accepted, nothing leaked
    assert_eq!(ctx.lld.0.lock().sent_ls_rsps.len(), 0);
    assert_eq!(ctx.t.nport(PORT, NPORT).unwrap().assoc_count, 0);
    assert_eq!(ctx.t.num_associations(), 0);
    assert_eq!(ctx.lld.0.lock().xri_in_use, 0);
}

#[test]
fn delete_association_is_idempotent() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (assoc_id, _conn) = create_association(&mut ctx, 0x70);

    let calls = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
    for i in 0 .. 2u32 {
        let calls = calls.clone();
        ctx.t
            .delete_association(
                PORT,
                NPORT,
                assoc_id,
                false,
                false,
                Some(Box::new(move |_t, err| calls.lock().push((i, err)))),
            )
            .unwrap();
    }
    pump(&mut ctx);

    // exactly one teardown, both callbacks fired
    assert_eq!(ctx.t.num_associations(), 0);
    assert_eq!(ctx.be.0.lock().disconnects.len(), 1);
    let calls = calls.lock();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(_, err)| *err == 0));
}

#[test]
fn pending_ls_waits_for_exchange() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);

    ctx.lld.0.lock().xri_capacity = 0;
    send_ls(&mut ctx, 0x80, &cass_payload(32, 16));
    pump(&mut ctx);

    let ls = ctx.t.port(PORT).unwrap().ls_hwqp;
    assert!(ctx.t.hwqp(ls).unwrap().counters.no_xchg >= 1);
    assert_eq!(ctx.lld.0.lock().sent_ls_rsps.len(), 0);

    // an exchange frees up: the pending request goes through untouched
    ctx.lld.0.lock().xri_capacity = 64;
    pump(&mut ctx);
    let s = ctx.lld.0.lock();
    assert_eq!(s.sent_ls_rsps.len(), 1);
    assert_eq!(s.sent_ls_rsps[0].0, 0x80);
}

#[test]
fn keep_alive_uses_send_frame() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0x90);

    let mut cmd = NvmeCmd::default();
    cmd.opc = NVME_OPC_KEEP_ALIVE;
    cmd.cid = 7;
    send_cmd(&mut ctx, conn_id, 0x91, CMND_IU_NODATA, 0, cmd).unwrap();
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let (io, ersp) = s.posted_rsp.last().unwrap();
    // no exchange was consumed and the short response suffices
    assert_eq!(io.xchg_id, None);
    assert!(ersp.is_none());
    assert_eq!(s.xri_in_use, 0);
}

#[test]
fn ersp_emitted_every_ratio_window() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    // ratio 16 on the admin queue
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0xa0);

    for i in 0 .. 16u16 {
        let mut cmd = NvmeCmd::default();
        cmd.opc = 0x02;
        cmd.cid = i;
        send_cmd(&mut ctx, conn_id, 0xa1 + i, CMND_IU_NODATA, 0, cmd)
            .unwrap();
        pump(&mut ctx);
    }

    let s = ctx.lld.0.lock();
    assert_eq!(s.posted_rsp.len(), 16);
    for (i, (_, ersp)) in s.posted_rsp.iter().enumerate() {
        if i == 15 {
            // the 16th response closes the window
            let iu = ErspIu::decode(ersp.as_ref().unwrap()).unwrap();
            assert_eq!(iu.ersp_len, 8);
            assert_eq!(iu.rsp.cid, 15);
        } else {
            assert!(ersp.is_none(), "response {} should be short", i);
        }
    }
}

#[test]
fn write_capsule_runs_xfer_rdy_then_rsp() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0xb0);

    let mut cmd = NvmeCmd::default();
    cmd.opc = 0x01;
    cmd.cid = 42;
    send_cmd(&mut ctx, conn_id, 0xb1, CMND_IU_WRITE, 4096, cmd).unwrap();
    pump(&mut ctx);

    // the backend saw it after the data landed, the response went out
    assert_eq!(ctx.be.0.lock().exec_reqs.len(), 1);
    let s = ctx.lld.0.lock();
    assert_eq!(s.posted_rsp.len(), 1);
    assert_eq!(s.xri_in_use, 0);
    drop(s);
    let key = conn_key(&ctx, conn_id);
    assert!(ctx.t.conn(key).unwrap().in_use_reqs.is_empty());
}

#[test]
fn fused_pair_waits_for_second_half() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0xc0);
    let key = conn_key(&ctx, conn_id);

    // first half parks
    let mut first = NvmeCmd::default();
    first.opc = 0x01;
    first.flags = 0x1;
    first.cid = 1;
    send_cmd(&mut ctx, conn_id, 0xc1, CMND_IU_NODATA, 0, first).unwrap();
    pump(&mut ctx);
    assert_eq!(ctx.be.0.lock().exec_reqs.len(), 0);
    assert_eq!(ctx.t.conn(key).unwrap().fused_waiting.len(), 1);

    // second half releases both, in order
    let mut second = NvmeCmd::default();
    second.opc = 0x01;
    second.flags = 0x2;
    second.cid = 2;
    send_cmd(&mut ctx, conn_id, 0xc2, CMND_IU_NODATA, 0, second).unwrap();
    pump(&mut ctx);

    let execs = ctx.be.0.lock().exec_reqs.clone();
    assert_eq!(execs.len(), 2);
    assert!(ctx.t.conn(key).unwrap().fused_waiting.is_empty());
    assert_eq!(ctx.lld.0.lock().posted_rsp.len(), 2);
}

#[test]
fn fused_second_without_first_fails() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0xd0);

    let mut second = NvmeCmd::default();
    second.opc = 0x01;
    second.flags = 0x2;
    second.cid = 9;
    send_cmd(&mut ctx, conn_id, 0xd1, CMND_IU_NODATA, 0, second).unwrap();
    pump(&mut ctx);

    // never reaches the backend; completes with "missing fused"
    assert_eq!(ctx.be.0.lock().exec_reqs.len(), 0);
    let s = ctx.lld.0.lock();
    let (_, ersp) = s.posted_rsp.last().unwrap();
    let iu = ErspIu::decode(ersp.as_ref().unwrap()).unwrap();
    assert_eq!(
        (iu.rsp.status >> 1) & 0xff,
        NVME_SC_ABORTED_MISSING_FUSED
    );
}

#[test]
fn teardown_sends_ls_disconnect_when_configured() {
    let mut cfg = nvmf_fc::config::FcConfig::default();
    cfg.send_ls_disconnect = true;
    let mut ctx = setup_with(cfg);
    setup_port(&mut ctx, 1);
    let (assoc_id, _conn_id) = create_association(&mut ctx, 0xf0);

    // a local teardown (not host initiated) notifies the initiator
    ctx.t
        .delete_association(PORT, NPORT, assoc_id, false, false, None)
        .unwrap();
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    assert_eq!(s.sent_srsr.len(), 1);
    let rqst =
        nvmf_fc::wire::ls::DisconnRqst::decode(&s.sent_srsr[0]).unwrap();
    assert_eq!(rqst.assoc_id, assoc_id);
    drop(s);
    assert_eq!(ctx.t.num_associations(), 0);
}

#[test]
fn capsule_for_unknown_connection_is_dropped() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0xe0);

    // same queue in the low byte, different connection counter
    let bogus = conn_id + 0x4200;
    let rc = send_cmd(
        &mut ctx,
        bogus,
        0xe1,
        CMND_IU_NODATA,
        0,
        NvmeCmd::default(),
    );
    assert_matches!(rc, Err(nix::errno::Errno::ENODEV));
    let h = io_hwqp(&ctx, conn_id);
    assert_eq!(ctx.t.hwqp(h).unwrap().counters.invalid_conn_err, 1);
}
