//! NVMe-oF Fibre Channel target transport core.
//!
//! The crate implements the FC-NVMe control plane (Create Association,
//! Create Connection, Disconnect link services), the association /
//! connection / queue fabric, the FCP request pipeline and ABTS handling.
//! The physical rings, DMA and interrupts belong to a low level driver
//! reached through the [`lld::FcLldOps`] facade, and the NVMe-oF generic
//! layer (subsystems, controllers, the fabric Connect command) is reached
//! through [`backend::NvmfBackend`].

#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;
extern crate snafu;

pub mod abts;
pub mod backend;
pub mod config;
pub mod error;
pub mod fabric;
pub mod lld;
pub mod logger;
pub mod ls;
pub mod poller;
pub mod request;
pub mod transport;
pub mod wire;

pub use error::Error;
pub use transport::{FcTransport, FcTransportOpts};
