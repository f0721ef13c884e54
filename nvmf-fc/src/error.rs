use nix::errno::Errno;
use snafu::Snafu;

/// Control plane and administrative errors.
#[derive(Debug, Snafu)]
#[snafu(visibility = "pub(crate)")]
pub enum Error {
    #[snafu(display("Duplicate FC port {} exists", port))]
    PortExists { port: u8 },
    #[snafu(display("FC port {} not found", port))]
    PortNotFound { port: u8 },
    #[snafu(display("Duplicate nport {} exists on FC port {}", nport, port))]
    NportExists { port: u8, nport: u16 },
    #[snafu(display("Nport {} not found on FC port {}", nport, port))]
    NportNotFound { port: u8, nport: u16 },
    #[snafu(display(
        "Duplicate rport for nport {}: s_id 0x{:x} rpi 0x{:x}",
        nport,
        s_id,
        rpi
    ))]
    RportExists { nport: u16, s_id: u32, rpi: u16 },
    #[snafu(display("Rport s_id 0x{:x} rpi 0x{:x} not found", s_id, rpi))]
    RportNotFound { s_id: u32, rpi: u16 },
    #[snafu(display("No association 0x{:x} on nport {}", assoc_id, nport))]
    NoAssociation { nport: u16, assoc_id: u64 },
    #[snafu(display("FC port {}: nports not cleared up yet", port))]
    NportsRemain { port: u8 },
    #[snafu(display("FC port {}: {}", port, msg))]
    PortState { port: u8, msg: String },
    #[snafu(display("Unsupported IO unit size {}", io_unit_size))]
    SgeCount { io_unit_size: u32 },
    #[snafu(display("Low level driver: {}: {}", msg, source))]
    Lld { source: Errno, msg: String },
    #[snafu(display("Failed to read config file {}: {}", path, source))]
    ConfigRead {
        source: serde_yaml::Error,
        path: String,
    },
    #[snafu(display("Failed to open config file {}: {}", path, source))]
    ConfigOpen {
        source: std::io::Error,
        path: String,
    },
}

impl Error {
    /// Errno-style result code handed to administrative event callbacks.
    pub fn to_errno(&self) -> i32 {
        let e = match self {
            Error::PortExists { .. }
            | Error::NportExists { .. }
            | Error::PortNotFound { .. }
            | Error::NportNotFound { .. }
            | Error::SgeCount { .. } => Errno::EINVAL,
            Error::RportExists { .. } => Errno::EEXIST,
            Error::RportNotFound { .. } | Error::NoAssociation { .. } => {
                Errno::ENODEV
            }
            Error::NportsRemain { .. } => Errno::EIO,
            Error::PortState { .. } => Errno::EPERM,
            Error::Lld { source, .. } => *source,
            Error::ConfigRead { .. } | Error::ConfigOpen { .. } => Errno::EIO,
        };
        -(e as i32)
    }
}
