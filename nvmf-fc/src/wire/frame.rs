//! FC frame header and routing constants.

use bytes::{Buf, BufMut};

use super::{need, Error};

pub const FRAME_HDR_SIZE: usize = 24;

/* R_CTL values of interest */
pub const R_CTL_CMD_REQ: u8 = 0x06;
pub const R_CTL_DATA_OUT: u8 = 0x01;
pub const R_CTL_CONFIRM: u8 = 0x03;
pub const R_CTL_STATUS: u8 = 0x07;
pub const R_CTL_ERSP_STATUS: u8 = 0x08;
pub const R_CTL_LS_REQUEST: u8 = 0x32;
pub const R_CTL_LS_RESPONSE: u8 = 0x33;
pub const R_CTL_BA_ABTS: u8 = 0x81;

/* TYPE values */
pub const TYPE_BLS: u8 = 0x00;
pub const TYPE_FC_EXCHANGE: u8 = 0x08;
pub const TYPE_NVMF_DATA: u8 = 0x28;

pub const F_CTL_END_SEQ: u32 = 0x08_0000;
pub const F_CTL_SEQ_INIT: u32 = 0x01_0000;
/// END_SEQ | LAST_SEQ | exchange responder | SEQ init
pub const F_CTL_RSP: u32 = 0x99_0000;
pub const F_CTL_PRIORITY_ENABLE: u32 = 0x02_0000;

/* DF_CTL bits indicating optional headers between the frame header and
 * the payload */
pub const DF_CTL_DEVICE_HDR_16: u8 = 0x01;
pub const DF_CTL_NETWORK_HDR: u8 = 0x20;
pub const DF_CTL_ESP_HDR: u8 = 0x40;
pub const DF_CTL_NETWORK_HDR_SIZE: usize = 16;
pub const DF_CTL_ESP_HDR_SIZE: usize = 8;

/* BLS reject codes */
pub const BLS_REJECT_UNABLE_TO_PERFORM: u8 = 0x09;
pub const BLS_REJECT_EXP_NOINFO: u8 = 0x00;
pub const BLS_REJECT_EXP_INVALID_OXID: u8 = 0x03;

/// 24 byte FC frame header. D_ID/S_ID/F_CTL are 24-bit fields.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameHdr {
    pub r_ctl: u8,
    pub d_id: u32,
    pub cs_ctl: u8,
    pub s_id: u32,
    pub ftype: u8,
    pub f_ctl: u32,
    pub seq_id: u8,
    pub df_ctl: u8,
    pub seq_cnt: u16,
    pub ox_id: u16,
    pub rx_id: u16,
    pub parameter: u32,
}

impl FrameHdr {
    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        need(buf, FRAME_HDR_SIZE)?;
        let w0 = buf.get_u32();
        let w1 = buf.get_u32();
        let w2 = buf.get_u32();
        let w3 = buf.get_u32();
        let w4 = buf.get_u32();
        let parameter = buf.get_u32();
        Ok(Self {
            r_ctl: (w0 >> 24) as u8,
            d_id: w0 & 0x00ff_ffff,
            cs_ctl: (w1 >> 24) as u8,
            s_id: w1 & 0x00ff_ffff,
            ftype: (w2 >> 24) as u8,
            f_ctl: w2 & 0x00ff_ffff,
            seq_id: (w3 >> 24) as u8,
            df_ctl: (w3 >> 16) as u8,
            seq_cnt: (w3 & 0xffff) as u16,
            ox_id: (w4 >> 16) as u16,
            rx_id: (w4 & 0xffff) as u16,
            parameter,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.put_u32(u32::from(self.r_ctl) << 24 | (self.d_id & 0x00ff_ffff));
        buf.put_u32(u32::from(self.cs_ctl) << 24 | (self.s_id & 0x00ff_ffff));
        buf.put_u32(u32::from(self.ftype) << 24 | (self.f_ctl & 0x00ff_ffff));
        buf.put_u32(
            u32::from(self.seq_id) << 24
                | u32::from(self.df_ctl) << 16
                | u32::from(self.seq_cnt),
        );
        buf.put_u32(u32::from(self.ox_id) << 16 | u32::from(self.rx_id));
        buf.put_u32(self.parameter);
    }

    /// Extract the 32-bit application identifier from the 16 byte device
    /// header, skipping any ESP/network header prefix DF_CTL announces.
    /// `raw` is the raw frame starting at the frame header.
    pub fn vm_app_id(&self, raw: &[u8]) -> Option<u32> {
        if self.df_ctl & DF_CTL_DEVICE_HDR_16 == 0 {
            return None;
        }
        let mut off = FRAME_HDR_SIZE;
        if self.df_ctl & DF_CTL_ESP_HDR != 0 {
            off += DF_CTL_ESP_HDR_SIZE;
        }
        if self.df_ctl & DF_CTL_NETWORK_HDR != 0 {
            off += DF_CTL_NETWORK_HDR_SIZE;
        }
        // src_vmid is the second word of the device header
        let mut vm = raw.get(off + 4 .. off + 8)?;
        Some(vm.get_u32())
    }

    /// CS_CTL carries the frame priority when F_CTL says so.
    pub fn priority(&self) -> Option<u8> {
        if self.f_ctl & F_CTL_PRIORITY_ENABLE != 0 {
            Some(self.cs_ctl)
        } else {
            None
        }
    }
}
