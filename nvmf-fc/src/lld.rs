//! Facade over the low level FC driver. The driver owns the physical
//! rings, DMA and interrupts; the core only ever talks to it through
//! [`FcLldOps`]. Completions are reaped by [`FcLldOps::poll_queue`] and
//! handed back as [`LldCompletion`] values, which the transport dispatches
//! on the polling thread.

use nix::errno::Errno;

use crate::{fabric::assoc::ReqTag, ls::LsRequest};

/// Opaque per-queue handle the driver gave us at port init.
pub type LldQueue = u64;

pub const INVALID_CONN_ID: u64 = u64::MAX;

/// An FC exchange identifier (XRI) owned by the driver.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FcXchg {
    pub xchg_id: u32,
    pub active: bool,
    pub aborted: bool,
    /// valid when `aborted` is set
    pub send_abts: bool,
}

impl FcXchg {
    pub fn new(xchg_id: u32) -> Self {
        Self {
            xchg_id,
            active: true,
            aborted: false,
            send_abts: false,
        }
    }
}

/// Buffers for a single-request-single-response sequence (used to send an
/// LS Disconnect to the initiator).
#[derive(Debug, Clone, PartialEq)]
pub struct FcSrsrBufs {
    pub rqst: Vec<u8>,
    pub rsp_len: usize,
    pub rpi: u16,
}

/// What the core needs the driver to know to emit on an IO exchange.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IoXmt {
    pub tag: ReqTag,
    /// None only on the send-frame path (qid 0 Keep Alive)
    pub xchg_id: Option<u32>,
    pub oxid: u16,
    pub rpi: u16,
    pub s_id: u32,
    pub d_id: u32,
}

/// Basic link service response arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlsRsp {
    pub ox_id: u16,
    pub rx_id: u16,
    pub rpi: u16,
    pub rjt: bool,
    pub rjt_exp: u8,
}

/// Completions reaped from a driver queue.
#[derive(Debug)]
pub enum LldCompletion {
    /// an inbound frame: raw header area (frame header plus any optional
    /// headers) and the IU payload
    Frame {
        buf_index: u32,
        frame: Vec<u8>,
        payload: Vec<u8>,
    },
    /// XFER_RDY emitted and the write data has arrived
    XferRdyDone { tag: ReqTag, status: i32 },
    /// read data send finished
    DataSendDone { tag: ReqTag, status: i32 },
    /// RSP/ERSP emission finished
    RspDone { tag: ReqTag, status: i32 },
    /// a queue sync marker made it through the queue
    QueueSyncDone { u_id: u64 },
}

/// The narrow interface the transport core consumes from the low level
/// driver. One implementation per physical driver.
pub trait FcLldOps: Send {
    fn init_queue(
        &mut self,
        q: LldQueue,
        hwqp_id: u16,
        rq_size: u32,
    ) -> Result<(), Errno>;

    /// Point an existing queue set at new hardware after a port reset.
    fn reinit_queue(&mut self, q_prev: LldQueue, q_curr: LldQueue);

    fn set_queue_online(
        &mut self,
        q: LldQueue,
        online: bool,
    ) -> Result<(), Errno>;

    fn acquire_xri(&mut self, q: LldQueue) -> Option<FcXchg>;

    fn release_xri(&mut self, q: LldQueue, xchg: FcXchg);

    /// Post an XFER_RDY to the initiator and arm DMA for the write data.
    fn post_xfer_ready(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        offset: u32,
        burst_len: u32,
    ) -> Result<(), Errno>;

    /// Send read data to the initiator.
    fn post_data_send(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        data_len: u32,
    ) -> Result<(), Errno>;

    /// Send the response frame; `ersp` carries the 32 byte extended
    /// response when one is required, otherwise a short RSP is emitted.
    fn post_response(
        &mut self,
        q: LldQueue,
        io: &IoXmt,
        ersp: Option<&[u8]>,
    ) -> Result<(), Errno>;

    /// Transmit an LS response. On success the driver owns the request
    /// (and its RQ buffer) until the emission completes.
    fn post_ls_response(
        &mut self,
        q: LldQueue,
        ls: LsRequest,
    ) -> Result<(), (Errno, LsRequest)>;

    /// Abort an exchange; the driver emits an ABTS when `send_abts`.
    fn issue_abort(
        &mut self,
        q: LldQueue,
        xchg_id: u32,
        send_abts: bool,
    ) -> Result<(), Errno>;

    fn post_bls_response(
        &mut self,
        q: LldQueue,
        bls: BlsRsp,
    ) -> Result<(), Errno>;

    /// Send a single-request-single-response sequence.
    fn post_srsr_request(
        &mut self,
        q: LldQueue,
        bufs: FcSrsrBufs,
    ) -> Result<(), (Errno, FcSrsrBufs)>;

    fn queue_sync_available(&self) -> bool;

    /// Post a sync marker so in-flight receive entries ahead of it become
    /// visible before `QueueSyncDone { u_id }` is reported.
    fn issue_queue_sync_marker(
        &mut self,
        q: LldQueue,
        u_id: u64,
        skip_rq: u16,
    ) -> Result<(), Errno>;

    /// Return a receive buffer to the chip.
    fn release_rq_buffer(&mut self, q: LldQueue, buf_index: u32);

    /// Reap pending completions and inbound frames.
    fn poll_queue(&mut self, q: LldQueue) -> Vec<LldCompletion>;

    /// Pick a 64-bit connection id for a connection landing on the given
    /// HWQP. The low byte of the id encodes the HWQP.
    fn assign_conn_to_hwqp(
        &mut self,
        q: LldQueue,
        hwqp_id: u16,
        sq_size: u16,
    ) -> Option<u64>;

    fn release_conn(&mut self, q: LldQueue, conn_id: u64, sq_size: u16);

    fn alloc_srsr_bufs(
        &mut self,
        rqst_len: usize,
        rsp_len: usize,
    ) -> Option<FcSrsrBufs>;

    fn free_srsr_bufs(&mut self, bufs: FcSrsrBufs);
}
