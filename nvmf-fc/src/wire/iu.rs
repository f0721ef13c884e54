//! NVMe command / extended response / transfer-ready information units.

use bytes::{Buf, BufMut};

use super::{need, Error};

pub const CMND_IU_SIZE: usize = 96;
pub const ERSP_IU_SIZE: usize = 32;
pub const XFER_RDY_IU_SIZE: usize = 12;
pub const NVME_CMD_SIZE: usize = 64;
pub const NVME_CPL_SIZE: usize = 16;

pub const CMND_IU_FC_ID: u8 = 0x28;
pub const CMND_IU_SCSI_ID: u8 = 0xfd;

/* CMND_IU flags: data direction */
pub const CMND_IU_NODATA: u8 = 0x00;
pub const CMND_IU_READ: u8 = 0x10;
pub const CMND_IU_WRITE: u8 = 0x01;

/* NVMe opcodes the transport cares about */
pub const NVME_OPC_FABRIC: u8 = 0x7f;
pub const NVME_OPC_KEEP_ALIVE: u8 = 0x18;
pub const NVME_OPC_ASYNC_EVENT_REQUEST: u8 = 0x0c;

/* NVMe generic status codes used by the transport */
pub const NVME_SC_SUCCESS: u16 = 0x00;
pub const NVME_SC_ABORTED_MISSING_FUSED: u16 = 0x0a;

/// Data transfer direction of a capsule, derived from the CMND_IU flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferDir {
    None,
    /// write: initiator to target
    HostToController,
    /// read: target to initiator
    ControllerToHost,
    Bidirectional,
}

impl XferDir {
    pub fn from_iu_flags(flags: u8) -> XferDir {
        match flags {
            CMND_IU_NODATA => XferDir::None,
            CMND_IU_WRITE => XferDir::HostToController,
            CMND_IU_READ => XferDir::ControllerToHost,
            _ => XferDir::Bidirectional,
        }
    }
}

/// NVMe submission queue entry, carried little-endian inside the CMND_IU.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NvmeCmd {
    pub opc: u8,
    pub flags: u8,
    pub cid: u16,
    pub nsid: u32,
    pub cdw2: u32,
    pub cdw3: u32,
    pub mptr: u64,
    pub prp1: u64,
    pub prp2: u64,
    pub cdw10: u32,
    pub cdw11: u32,
    pub cdw12: u32,
    pub cdw13: u32,
    pub cdw14: u32,
    pub cdw15: u32,
}

impl NvmeCmd {
    /// FUSE field: 0 normal, 1 first command, 2 second command.
    pub fn fuse(&self) -> u8 {
        self.flags & 0x3
    }

    pub fn is_fabric(&self) -> bool {
        self.opc == NVME_OPC_FABRIC
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        need(buf, NVME_CMD_SIZE)?;
        Ok(Self {
            opc: buf.get_u8(),
            flags: buf.get_u8(),
            cid: buf.get_u16_le(),
            nsid: buf.get_u32_le(),
            cdw2: buf.get_u32_le(),
            cdw3: buf.get_u32_le(),
            mptr: buf.get_u64_le(),
            prp1: buf.get_u64_le(),
            prp2: buf.get_u64_le(),
            cdw10: buf.get_u32_le(),
            cdw11: buf.get_u32_le(),
            cdw12: buf.get_u32_le(),
            cdw13: buf.get_u32_le(),
            cdw14: buf.get_u32_le(),
            cdw15: buf.get_u32_le(),
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.opc);
        buf.put_u8(self.flags);
        buf.put_u16_le(self.cid);
        buf.put_u32_le(self.nsid);
        buf.put_u32_le(self.cdw2);
        buf.put_u32_le(self.cdw3);
        buf.put_u64_le(self.mptr);
        buf.put_u64_le(self.prp1);
        buf.put_u64_le(self.prp2);
        buf.put_u32_le(self.cdw10);
        buf.put_u32_le(self.cdw11);
        buf.put_u32_le(self.cdw12);
        buf.put_u32_le(self.cdw13);
        buf.put_u32_le(self.cdw14);
        buf.put_u32_le(self.cdw15);
    }
}

/// NVMe completion queue entry.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct NvmeCpl {
    pub cdw0: u32,
    pub cdw1: u32,
    pub sqhd: u16,
    pub sqid: u16,
    pub cid: u16,
    /// bit 0 phase, bits 1..9 SC, bits 9..12 SCT
    pub status: u16,
}

impl NvmeCpl {
    pub fn set_status_code(&mut self, sc: u16) {
        self.status = (self.status & !0x01fe) | (sc << 1);
    }

    pub fn is_success(&self) -> bool {
        self.status & 0xfffe == 0
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        need(buf, NVME_CPL_SIZE)?;
        Ok(Self {
            cdw0: buf.get_u32_le(),
            cdw1: buf.get_u32_le(),
            sqhd: buf.get_u16_le(),
            sqid: buf.get_u16_le(),
            cid: buf.get_u16_le(),
            status: buf.get_u16_le(),
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32_le(self.cdw0);
        buf.put_u32_le(self.cdw1);
        buf.put_u16_le(self.sqhd);
        buf.put_u16_le(self.sqid);
        buf.put_u16_le(self.cid);
        buf.put_u16_le(self.status);
    }
}

/// NVMe over FC command IU, 96 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CmndIu {
    pub scsi_id: u8,
    pub fc_id: u8,
    /// IU size in dwords
    pub cmnd_iu_len: u16,
    pub flags: u8,
    pub conn_id: u64,
    pub cmnd_seq_num: u32,
    pub data_len: u32,
    pub cmd: NvmeCmd,
}

impl CmndIu {
    pub fn for_conn(conn_id: u64, flags: u8, cmd: NvmeCmd) -> Self {
        Self {
            scsi_id: CMND_IU_SCSI_ID,
            fc_id: CMND_IU_FC_ID,
            cmnd_iu_len: (CMND_IU_SIZE / 4) as u16,
            flags,
            conn_id,
            cmnd_seq_num: 0,
            data_len: 0,
            cmd,
        }
    }

    /// The well known identifier bytes and the dword length must check out.
    pub fn is_valid(&self) -> bool {
        self.fc_id == CMND_IU_FC_ID
            && self.scsi_id == CMND_IU_SCSI_ID
            && usize::from(self.cmnd_iu_len) == CMND_IU_SIZE / 4
    }

    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, CMND_IU_SIZE)?;
        let mut b = buf;
        let scsi_id = b.get_u8();
        let fc_id = b.get_u8();
        let cmnd_iu_len = b.get_u16();
        b.advance(3); // reserved
        let flags = b.get_u8();
        let conn_id = b.get_u64();
        let cmnd_seq_num = b.get_u32();
        let data_len = b.get_u32();
        let cmd = NvmeCmd::decode(&buf[24 .. 24 + NVME_CMD_SIZE])?;
        Ok(Self {
            scsi_id,
            fc_id,
            cmnd_iu_len,
            flags,
            conn_id,
            cmnd_seq_num,
            data_len,
            cmd,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.scsi_id);
        buf.put_u8(self.fc_id);
        buf.put_u16(self.cmnd_iu_len);
        buf.put_bytes(0, 3);
        buf.put_u8(self.flags);
        buf.put_u64(self.conn_id);
        buf.put_u32(self.cmnd_seq_num);
        buf.put_u32(self.data_len);
        self.cmd.encode(buf);
        buf.put_bytes(0, 8);
    }
}

/// Extended response IU, 32 bytes: full NVMe completion plus sequence
/// tracking.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ErspIu {
    pub status_code: u8,
    /// IU size in dwords
    pub ersp_len: u16,
    pub response_seq_no: u32,
    pub transferred_data_len: u32,
    pub rsp: NvmeCpl,
}

impl ErspIu {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, ERSP_IU_SIZE)?;
        let mut b = buf;
        let status_code = b.get_u8();
        b.advance(1);
        let ersp_len = b.get_u16();
        let response_seq_no = b.get_u32();
        let transferred_data_len = b.get_u32();
        b.advance(4);
        let rsp = NvmeCpl::decode(&buf[16 ..])?;
        Ok(Self {
            status_code,
            ersp_len,
            response_seq_no,
            transferred_data_len,
            rsp,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u8(self.status_code);
        buf.put_u8(0);
        buf.put_u16(self.ersp_len);
        buf.put_u32(self.response_seq_no);
        buf.put_u32(self.transferred_data_len);
        buf.put_u32(0);
        self.rsp.encode(buf);
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ERSP_IU_SIZE);
        self.encode(&mut buf);
        buf
    }
}

/// Transfer ready IU, 12 bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct XferRdyIu {
    pub relative_offset: u32,
    pub burst_len: u32,
}

impl XferRdyIu {
    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        need(buf, XFER_RDY_IU_SIZE)?;
        Ok(Self {
            relative_offset: buf.get_u32(),
            burst_len: buf.get_u32(),
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32(self.relative_offset);
        buf.put_u32(self.burst_len);
        buf.put_u32(0);
    }
}
