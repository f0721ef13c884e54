//! Facade over the NVMe-oF generic layer, which owns subsystems,
//! controllers, namespaces and the fabric Connect command. The transport
//! hands qpairs and requests across this boundary and the generic layer
//! calls back into [`crate::FcTransport`] when it is done with them.

use nix::errno::Errno;

use crate::{
    fabric::assoc::{AssocSerial, ConnKey, ReqTag},
    transport::FcTransport,
};

pub trait NvmfBackend: Send {
    /// Resolve a subsystem by NQN.
    fn find_subsystem(&mut self, subnqn: &str) -> bool;

    /// Check the host NQN against the subsystem allow list.
    fn host_allowed(&mut self, subnqn: &str, hostnqn: &str) -> bool;

    /// A new qpair was built for an accepted connection. The generic
    /// layer picks a poll group and routes the qpair back through
    /// [`FcTransport::poll_group_add`]; when its fabric Connect completes
    /// it marks the qpair active via [`FcTransport::qpair_activate`].
    fn new_qpair(&mut self, t: &mut FcTransport, conn: ConnKey);

    /// Execute an NVMe capsule. Completion comes back through
    /// [`FcTransport::request_complete`].
    fn request_exec(&mut self, t: &mut FcTransport, tag: ReqTag);

    /// Disconnect a qpair from its controller. The generic layer must
    /// call [`FcTransport::qpair_disconnect_complete`] with `op` when the
    /// disconnect has run its course.
    fn qpair_disconnect(&mut self, t: &mut FcTransport, conn: ConnKey, op: u64);

    /// Release a parked asynchronous event request on the admin queue.
    fn free_aer(&mut self, t: &mut FcTransport, conn: ConnKey);

    /// Add the nport as a listen address to every compatible subsystem,
    /// pausing and resuming each subsystem around the add.
    fn add_listener(
        &mut self,
        t: &mut FcTransport,
        port: u8,
        nport: u16,
    ) -> Result<(), Errno>;

    /// Remove the nport listen address again.
    fn remove_listener(
        &mut self,
        t: &mut FcTransport,
        port: u8,
        nport: u16,
    ) -> Result<(), Errno>;

    /// An unrecoverable transport error: set CFS on the association's
    /// controller. In-flight requests still run to completion.
    fn ctrlr_fatal(&mut self, t: &mut FcTransport, assoc: AssocSerial);
}
