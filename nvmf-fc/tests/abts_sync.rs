//! ABTS handling: first-pass hits, the queue-sync second pass, and the
//! reject paths.

pub mod common;

use common::*;
use nvmf_fc::{
    transport::events::FcEventArgs,
    wire::frame::{BLS_REJECT_EXP_INVALID_OXID, BLS_REJECT_EXP_NOINFO},
    wire::iu::{NvmeCmd, CMND_IU_WRITE},
};

fn abts_event(oxid: u16, rxid: u16) -> FcEventArgs {
    FcEventArgs::AbtsRecv {
        port_handle: PORT,
        nport_handle: NPORT,
        rpi: RPI,
        oxid,
        rxid,
    }
}

#[test]
fn abts_found_accepts_and_aborts_once() {
    let mut ctx = setup();
    setup_port(&mut ctx, 2);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0x10);
    let h = io_hwqp(&ctx, conn_id);
    let key = conn_key(&ctx, conn_id);

    // one write in flight, parked in its transfer state
    ctx.lld.0.lock().auto_complete = false;
    let mut cmd = NvmeCmd::default();
    cmd.opc = 0x01;
    cmd.cid = 3;
    send_cmd(&mut ctx, conn_id, 0x42, CMND_IU_WRITE, 4096, cmd).unwrap();
    assert_eq!(ctx.t.conn(key).unwrap().in_use_reqs.len(), 1);

    ctx.t.enqueue_event(abts_event(0x42, 0x55), None);
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let bls = s.sent_bls.last().expect("no BLS emitted");
    assert!(!bls.rjt, "expected BA_ACC");
    assert_eq!(bls.ox_id, 0x42);
    assert_eq!(bls.rx_id, 0x55);
    assert_eq!(bls.rpi, RPI);
    drop(s);

    // the request went through the abort path exactly once
    assert_eq!(ctx.t.hwqp(h).unwrap().counters.num_aborted, 1);
    assert!(ctx.t.conn(key).unwrap().in_use_reqs.is_empty());
    assert_eq!(ctx.lld.0.lock().xri_in_use, 0);
}

#[test]
fn abts_not_found_syncs_then_accepts() {
    let mut ctx = setup();
    setup_port(&mut ctx, 2);
    let (_assoc_id, conn_id) = create_association(&mut ctx, 0x20);
    let h = io_hwqp(&ctx, conn_id);

    // the ABTS beats the command: first pass sees nothing
    ctx.t.enqueue_event(abts_event(0x42, 0x55), None);
    ctx.t.poll_main(); // fan out to the owning queue
    ctx.t.poll_group_poll(ctx.pg); // not found
    ctx.t.poll_main(); // all responded: second pass, marker issued
    assert_eq!(ctx.lld.0.lock().sync_markers.len(), 1);
    assert!(ctx.lld.0.lock().sent_bls.is_empty());

    // now the command becomes visible on the queue
    ctx.lld.0.lock().auto_complete = false;
    let mut cmd = NvmeCmd::default();
    cmd.opc = 0x01;
    cmd.cid = 4;
    send_cmd(&mut ctx, conn_id, 0x42, CMND_IU_WRITE, 4096, cmd).unwrap();

    // the sync marker comes back, the second pass finds the exchange
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let bls = s.sent_bls.last().expect("no BLS emitted");
    assert!(!bls.rjt, "expected BA_ACC after queue sync");
    drop(s);
    assert_eq!(ctx.t.hwqp(h).unwrap().counters.num_aborted, 1);
    assert!(ctx.t.hwqp(h).unwrap().sync_cbs.is_empty());
}

#[test]
fn abts_not_found_without_sync_support_rejects() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, _conn_id) = create_association(&mut ctx, 0x30);

    ctx.lld.0.lock().sync_support = false;
    ctx.t.enqueue_event(abts_event(0x99, 0x9a), None);
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let bls = s.sent_bls.last().expect("no BLS emitted");
    assert!(bls.rjt);
    assert_eq!(bls.rjt_exp, BLS_REJECT_EXP_INVALID_OXID);
    assert!(s.sync_markers.is_empty());
}

#[test]
fn abts_second_pass_miss_rejects_invalid_oxid() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, _conn_id) = create_association(&mut ctx, 0x40);

    // sync supported, but the exchange never shows up
    ctx.t.enqueue_event(abts_event(0x99, 0x9a), None);
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    assert_eq!(s.sync_markers.len(), 1);
    let bls = s.sent_bls.last().expect("no BLS emitted");
    assert!(bls.rjt);
    assert_eq!(bls.rjt_exp, BLS_REJECT_EXP_INVALID_OXID);
}

#[test]
fn abts_with_no_connections_rejects_noinfo() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);

    ctx.t.enqueue_event(abts_event(0x42, 0x55), None);
    pump(&mut ctx);

    let s = ctx.lld.0.lock();
    let bls = s.sent_bls.last().expect("no BLS emitted");
    assert!(bls.rjt);
    assert_eq!(bls.rjt_exp, BLS_REJECT_EXP_NOINFO);
}

#[test]
fn abts_dropped_while_nport_is_deleted() {
    let mut ctx = setup();
    setup_port(&mut ctx, 1);
    let (_assoc_id, _conn_id) = create_association(&mut ctx, 0x50);

    // start the nport teardown and slip the ABTS in behind it
    ctx.t.enqueue_event(
        FcEventArgs::NportDelete {
            port_handle: PORT,
            nport_handle: NPORT,
        },
        None,
    );
    ctx.t.enqueue_event(abts_event(0x42, 0x55), None);
    pump(&mut ctx);

    assert!(ctx.lld.0.lock().sent_bls.is_empty());
    assert!(ctx.t.nport(PORT, NPORT).is_none());
}
