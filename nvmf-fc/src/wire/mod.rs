//! FC-NVMe wire formats. Everything on the wire is big-endian except the
//! NVMe SQE/CQE carried inside the IUs, which stay little-endian.

use snafu::Snafu;

pub mod frame;
pub mod iu;
pub mod ls;

pub use frame::FrameHdr;
pub use iu::{CmndIu, ErspIu, NvmeCmd, NvmeCpl, XferRdyIu};

/// Codec errors. Anything that decodes off the wire is length checked
/// before the first field is read.
#[derive(Debug, Snafu, PartialEq)]
pub enum Error {
    #[snafu(display("buffer too short: have {} need {}", have, need))]
    Truncated { have: usize, need: usize },
}

pub(crate) fn need(buf: &[u8], len: usize) -> Result<(), Error> {
    if buf.len() < len {
        return Err(Error::Truncated {
            have: buf.len(),
            need: len,
        });
    }
    Ok(())
}

/// Descriptor length as carried on the wire: the descriptor size minus
/// the tag and length words themselves.
pub fn lsdesc_len(size: usize) -> u32 {
    (size - 2 * std::mem::size_of::<u32>()) as u32
}
