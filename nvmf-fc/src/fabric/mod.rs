//! The four-level naming and lifecycle hierarchy (port, nport, remote
//! port, association/connection) and the hardware queue pair fabric.

pub mod assoc;
pub mod hwqp;
pub mod port;

pub use assoc::{AssocSerial, ConnKey, FcAssociation, FcConn, ReqTag};
pub use hwqp::{FcErrors, Hwqp, HwqpId, HwqpState};
pub use port::{FcPort, FcPortState, Nport, ObjState, RemotePort, Wwn};
