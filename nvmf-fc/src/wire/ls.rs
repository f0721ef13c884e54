//! FC-NVMe link service payloads: Create Association, Create Connection,
//! Disconnect, and the accept/reject framing around them.

use bytes::{Buf, BufMut};

use super::{lsdesc_len, need, Error};

pub const MAX_LS_REQ_SIZE: usize = 1536;
pub const MAX_LS_RSP_SIZE: usize = 64;
/// needs to be in sync with the low level driver buffer size
pub const MAX_LS_BUFFER_SIZE: usize = 2048;

pub const CA_CMD_MIN_LEN: usize = 592;
pub const CA_DESC_LIST_MIN_LEN: u32 = 584;
pub const CA_DESC_MIN_LEN: u32 = 576;

pub const ASSOC_HOSTID_LEN: usize = 16;
pub const NQN_FIELD_SIZE: usize = 256;

pub const CR_ASSOC_RQST_SIZE: usize = 1024;
pub const CR_ASSOC_ACC_SIZE: usize = 56;
pub const CR_CONN_RQST_SIZE: usize = 80;
pub const CR_CONN_ACC_SIZE: usize = 40;
pub const DISCONNECT_RQST_SIZE: usize = 48;
pub const DISCONNECT_ACC_SIZE: usize = 24;
pub const LS_RJT_SIZE: usize = 40;

pub const ACC_HDR_SIZE: usize = 24;
pub const LSDESC_RQST_SIZE: usize = 16;
pub const LSDESC_RJT_SIZE: usize = 16;
pub const LSDESC_ASSOC_ID_SIZE: usize = 16;
pub const LSDESC_CONN_ID_SIZE: usize = 16;
pub const LSDESC_CR_ASSOC_CMD_SIZE: usize = 1016;
pub const LSDESC_CR_CONN_CMD_SIZE: usize = 56;
pub const LSDESC_DISCONN_CMD_SIZE: usize = 24;

/* LS command codes */
pub const LS_RJT: u8 = 1;
pub const LS_ACC: u8 = 2;
pub const LS_CREATE_ASSOCIATION: u8 = 3;
pub const LS_CREATE_CONNECTION: u8 = 4;
pub const LS_DISCONNECT: u8 = 5;

/* LS descriptor tags */
pub const LSDESC_RQST: u32 = 0x1;
pub const LSDESC_RJT: u32 = 0x2;
pub const LSDESC_CREATE_ASSOC_CMD: u32 = 0x3;
pub const LSDESC_CREATE_CONN_CMD: u32 = 0x4;
pub const LSDESC_DISCONN_CMD: u32 = 0x5;
pub const LSDESC_CONN_ID: u32 = 0x6;
pub const LSDESC_ASSOC_ID: u32 = 0x7;

/* LS reject reason codes */
pub const RJT_RC_NONE: u8 = 0x00;
pub const RJT_RC_INVAL: u8 = 0x01;
pub const RJT_RC_LOGIC: u8 = 0x03;
pub const RJT_RC_UNAB: u8 = 0x09;
pub const RJT_RC_UNSUP: u8 = 0x0b;
pub const RJT_RC_INPROG: u8 = 0x0e;
pub const RJT_RC_INV_ASSOC: u8 = 0x40;
pub const RJT_RC_INV_CONN: u8 = 0x41;
pub const RJT_RC_INV_PARAM: u8 = 0x42;
pub const RJT_RC_INSUFF_RES: u8 = 0x43;
pub const RJT_RC_INV_HOST: u8 = 0x44;
pub const RJT_RC_VENDOR: u8 = 0xff;

/* LS reject reason explanations */
pub const RJT_EXP_NONE: u8 = 0x00;
pub const RJT_EXP_OXID_RXID: u8 = 0x17;
pub const RJT_EXP_UNAB_DATA: u8 = 0x2a;
pub const RJT_EXP_INV_LEN: u8 = 0x2d;
pub const RJT_EXP_INV_ESRP: u8 = 0x40;
pub const RJT_EXP_INV_CTL_ID: u8 = 0x41;
pub const RJT_EXP_INV_Q_ID: u8 = 0x42;
pub const RJT_EXP_SQ_SIZE: u8 = 0x43;
pub const RJT_EXP_INV_HOST_ID: u8 = 0x44;
pub const RJT_EXP_INV_HOSTNQN: u8 = 0x45;
pub const RJT_EXP_INV_SUBNQN: u8 = 0x46;

fn put_w0(buf: &mut Vec<u8>, ls_cmd: u8) {
    buf.put_u8(ls_cmd);
    buf.put_bytes(0, 3);
}

fn put_nqn(buf: &mut Vec<u8>, nqn: &str) {
    let bytes = nqn.as_bytes();
    let n = bytes.len().min(NQN_FIELD_SIZE - 1);
    buf.put_slice(&bytes[.. n]);
    buf.put_bytes(0, NQN_FIELD_SIZE - n);
}

fn get_nqn(buf: &[u8]) -> String {
    let end = buf
        .iter()
        .take(NQN_FIELD_SIZE)
        .position(|b| *b == 0)
        .unwrap_or(NQN_FIELD_SIZE);
    String::from_utf8_lossy(&buf[.. end]).into_owned()
}

/// Common accept header: word 0, descriptor list length and the echoed
/// request descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AccHdr {
    pub ls_cmd: u8,
    pub desc_list_len: u32,
    pub rqst_tag: u32,
    pub rqst_len: u32,
    pub rqst_ls_cmd: u8,
}

impl AccHdr {
    pub fn accept(desc_list_len: u32, rqst_ls_cmd: u8) -> Self {
        Self {
            ls_cmd: LS_ACC,
            desc_list_len,
            rqst_tag: LSDESC_RQST,
            rqst_len: lsdesc_len(LSDESC_RQST_SIZE),
            rqst_ls_cmd,
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self, Error> {
        need(buf, ACC_HDR_SIZE)?;
        let ls_cmd = buf.get_u8();
        buf.advance(3);
        let desc_list_len = buf.get_u32();
        let rqst_tag = buf.get_u32();
        let rqst_len = buf.get_u32();
        let rqst_ls_cmd = buf.get_u8();
        Ok(Self {
            ls_cmd,
            desc_list_len,
            rqst_tag,
            rqst_len,
            rqst_ls_cmd,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_w0(buf, self.ls_cmd);
        buf.put_u32(self.desc_list_len);
        buf.put_u32(self.rqst_tag);
        buf.put_u32(self.rqst_len);
        put_w0(buf, self.rqst_ls_cmd);
        buf.put_u32(0);
    }
}

/// Create Association request. The command descriptor fields are kept raw
/// so the LS processor can apply its validation chain.
#[derive(Debug, Clone, PartialEq)]
pub struct CrAssocRqst {
    pub desc_list_len: u32,
    pub desc_tag: u32,
    pub desc_len: u32,
    pub ersp_ratio: u16,
    pub cntlid: u16,
    pub sqsize: u16,
    pub hostid: [u8; ASSOC_HOSTID_LEN],
    pub hostnqn: String,
    pub subnqn: String,
}

impl Default for CrAssocRqst {
    fn default() -> Self {
        Self {
            desc_list_len: lsdesc_len(CR_ASSOC_RQST_SIZE),
            desc_tag: LSDESC_CREATE_ASSOC_CMD,
            desc_len: lsdesc_len(LSDESC_CR_ASSOC_CMD_SIZE),
            ersp_ratio: 0,
            cntlid: 0xffff,
            sqsize: 0,
            hostid: [0; ASSOC_HOSTID_LEN],
            hostnqn: String::new(),
            subnqn: String::new(),
        }
    }
}

impl CrAssocRqst {
    /// The request is variable length on the wire; anything shorter than
    /// the mandatory prefix cannot be decoded.
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, CA_CMD_MIN_LEN)?;
        let mut b = &buf[4 ..];
        let desc_list_len = b.get_u32();
        let desc_tag = b.get_u32();
        let desc_len = b.get_u32();
        let ersp_ratio = b.get_u16();
        b.advance(2 + 36); // reserved
        let cntlid = b.get_u16();
        let sqsize = b.get_u16();
        b.advance(4);
        let mut hostid = [0u8; ASSOC_HOSTID_LEN];
        hostid.copy_from_slice(&buf[64 .. 64 + ASSOC_HOSTID_LEN]);
        let hostnqn = get_nqn(&buf[80 ..]);
        let subnqn = get_nqn(&buf[336 ..]);
        Ok(Self {
            desc_list_len,
            desc_tag,
            desc_len,
            ersp_ratio,
            cntlid,
            sqsize,
            hostid,
            hostnqn,
            subnqn,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_w0(buf, LS_CREATE_ASSOCIATION);
        buf.put_u32(self.desc_list_len);
        buf.put_u32(self.desc_tag);
        buf.put_u32(self.desc_len);
        buf.put_u16(self.ersp_ratio);
        buf.put_bytes(0, 2 + 36);
        buf.put_u16(self.cntlid);
        buf.put_u16(self.sqsize);
        buf.put_u32(0);
        buf.put_slice(&self.hostid);
        put_nqn(buf, &self.hostnqn);
        put_nqn(buf, &self.subnqn);
        buf.put_bytes(0, 432);
    }
}

/// Create Association accept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrAssocAcc {
    pub assoc_id: u64,
    pub conn_id: u64,
}

impl CrAssocAcc {
    pub fn decode(buf: &[u8]) -> Result<(AccHdr, Self), Error> {
        need(buf, CR_ASSOC_ACC_SIZE)?;
        let hdr = AccHdr::decode(buf)?;
        let mut b = &buf[ACC_HDR_SIZE + 8 ..];
        let assoc_id = b.get_u64();
        b.advance(8);
        let conn_id = b.get_u64();
        Ok((hdr, Self { assoc_id, conn_id }))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        AccHdr::accept(lsdesc_len(CR_ASSOC_ACC_SIZE), LS_CREATE_ASSOCIATION)
            .encode(buf);
        buf.put_u32(LSDESC_ASSOC_ID);
        buf.put_u32(lsdesc_len(LSDESC_ASSOC_ID_SIZE));
        buf.put_u64(self.assoc_id);
        buf.put_u32(LSDESC_CONN_ID);
        buf.put_u32(lsdesc_len(LSDESC_CONN_ID_SIZE));
        buf.put_u64(self.conn_id);
    }
}

/// Create IO Connection request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CrConnRqst {
    pub desc_list_len: u32,
    pub assoc_id_tag: u32,
    pub assoc_id_len: u32,
    pub assoc_id: u64,
    pub cmd_tag: u32,
    pub cmd_len: u32,
    pub ersp_ratio: u16,
    pub qid: u16,
    pub sqsize: u16,
}

impl Default for CrConnRqst {
    fn default() -> Self {
        Self {
            desc_list_len: lsdesc_len(CR_CONN_RQST_SIZE),
            assoc_id_tag: LSDESC_ASSOC_ID,
            assoc_id_len: lsdesc_len(LSDESC_ASSOC_ID_SIZE),
            assoc_id: 0,
            cmd_tag: LSDESC_CREATE_CONN_CMD,
            cmd_len: lsdesc_len(LSDESC_CR_CONN_CMD_SIZE),
            ersp_ratio: 0,
            qid: 0,
            sqsize: 0,
        }
    }
}

impl CrConnRqst {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, CR_CONN_RQST_SIZE)?;
        let mut b = &buf[4 ..];
        let desc_list_len = b.get_u32();
        let assoc_id_tag = b.get_u32();
        let assoc_id_len = b.get_u32();
        let assoc_id = b.get_u64();
        let cmd_tag = b.get_u32();
        let cmd_len = b.get_u32();
        let ersp_ratio = b.get_u16();
        b.advance(2 + 36);
        let qid = b.get_u16();
        let sqsize = b.get_u16();
        Ok(Self {
            desc_list_len,
            assoc_id_tag,
            assoc_id_len,
            assoc_id,
            cmd_tag,
            cmd_len,
            ersp_ratio,
            qid,
            sqsize,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_w0(buf, LS_CREATE_CONNECTION);
        buf.put_u32(self.desc_list_len);
        buf.put_u32(self.assoc_id_tag);
        buf.put_u32(self.assoc_id_len);
        buf.put_u64(self.assoc_id);
        buf.put_u32(self.cmd_tag);
        buf.put_u32(self.cmd_len);
        buf.put_u16(self.ersp_ratio);
        buf.put_bytes(0, 2 + 36);
        buf.put_u16(self.qid);
        buf.put_u16(self.sqsize);
        buf.put_u32(0);
    }
}

/// Create IO Connection accept.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrConnAcc {
    pub conn_id: u64,
}

impl CrConnAcc {
    pub fn decode(buf: &[u8]) -> Result<(AccHdr, Self), Error> {
        need(buf, CR_CONN_ACC_SIZE)?;
        let hdr = AccHdr::decode(buf)?;
        let mut b = &buf[ACC_HDR_SIZE + 8 ..];
        let conn_id = b.get_u64();
        Ok((hdr, Self { conn_id }))
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        AccHdr::accept(lsdesc_len(CR_CONN_ACC_SIZE), LS_CREATE_CONNECTION)
            .encode(buf);
        buf.put_u32(LSDESC_CONN_ID);
        buf.put_u32(lsdesc_len(LSDESC_CONN_ID_SIZE));
        buf.put_u64(self.conn_id);
    }
}

/// Disconnect (association) request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisconnRqst {
    pub desc_list_len: u32,
    pub assoc_id_tag: u32,
    pub assoc_id_len: u32,
    pub assoc_id: u64,
    pub cmd_tag: u32,
    pub cmd_len: u32,
}

impl Default for DisconnRqst {
    fn default() -> Self {
        Self {
            desc_list_len: lsdesc_len(DISCONNECT_RQST_SIZE),
            assoc_id_tag: LSDESC_ASSOC_ID,
            assoc_id_len: lsdesc_len(LSDESC_ASSOC_ID_SIZE),
            assoc_id: 0,
            cmd_tag: LSDESC_DISCONN_CMD,
            cmd_len: lsdesc_len(LSDESC_DISCONN_CMD_SIZE),
        }
    }
}

impl DisconnRqst {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, DISCONNECT_RQST_SIZE)?;
        let mut b = &buf[4 ..];
        let desc_list_len = b.get_u32();
        let assoc_id_tag = b.get_u32();
        let assoc_id_len = b.get_u32();
        let assoc_id = b.get_u64();
        let cmd_tag = b.get_u32();
        let cmd_len = b.get_u32();
        Ok(Self {
            desc_list_len,
            assoc_id_tag,
            assoc_id_len,
            assoc_id,
            cmd_tag,
            cmd_len,
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        put_w0(buf, LS_DISCONNECT);
        buf.put_u32(self.desc_list_len);
        buf.put_u32(self.assoc_id_tag);
        buf.put_u32(self.assoc_id_len);
        buf.put_u64(self.assoc_id);
        buf.put_u32(self.cmd_tag);
        buf.put_u32(self.cmd_len);
        buf.put_bytes(0, 16);
    }
}

/// Disconnect accept carries only the common header.
pub fn encode_disconnect_acc(buf: &mut Vec<u8>) {
    AccHdr::accept(lsdesc_len(DISCONNECT_ACC_SIZE), LS_DISCONNECT).encode(buf);
}

/// LS reject payload.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LsRjt {
    pub rqst_ls_cmd: u8,
    pub reason_code: u8,
    pub reason_explanation: u8,
    pub vendor: u8,
}

impl LsRjt {
    pub fn decode(buf: &[u8]) -> Result<Self, Error> {
        need(buf, LS_RJT_SIZE)?;
        let hdr = AccHdr::decode(buf)?;
        let b = &buf[ACC_HDR_SIZE ..];
        Ok(Self {
            rqst_ls_cmd: hdr.rqst_ls_cmd,
            reason_code: b[9],
            reason_explanation: b[10],
            vendor: b[11],
        })
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        AccHdr {
            ls_cmd: LS_RJT,
            desc_list_len: lsdesc_len(LS_RJT_SIZE),
            rqst_tag: LSDESC_RQST,
            rqst_len: lsdesc_len(LSDESC_RQST_SIZE),
            rqst_ls_cmd: self.rqst_ls_cmd,
        }
        .encode(buf);
        buf.put_u32(LSDESC_RJT);
        buf.put_u32(lsdesc_len(LSDESC_RJT_SIZE));
        buf.put_u8(0);
        buf.put_u8(self.reason_code);
        buf.put_u8(self.reason_explanation);
        buf.put_u8(self.vendor);
        buf.put_u32(0);
    }
}

/// Format a reject into `rsp` and return its length. Reserved bytes are
/// written as zero.
pub fn format_rjt(
    rsp: &mut Vec<u8>,
    rqst_ls_cmd: u8,
    reason: u8,
    explanation: u8,
    vendor: u8,
) -> usize {
    rsp.clear();
    LsRjt {
        rqst_ls_cmd,
        reason_code: reason,
        reason_explanation: explanation,
        vendor,
    }
    .encode(rsp);
    LS_RJT_SIZE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr_assoc_rqst_roundtrip() {
        let rqst = CrAssocRqst {
            ersp_ratio: 16,
            sqsize: 32,
            hostid: *b"0123456789abcdef",
            hostnqn: "nqn.2017-11.fc_host".to_string(),
            subnqn: "nqn.2017-11.io.spdk:subsystem.good".to_string(),
            ..Default::default()
        };
        let mut buf = Vec::new();
        rqst.encode(&mut buf);
        assert_eq!(buf.len(), CR_ASSOC_RQST_SIZE);
        let back = CrAssocRqst::decode(&buf).unwrap();
        assert_eq!(back, rqst);
        let mut again = Vec::new();
        back.encode(&mut again);
        assert_eq!(again, buf);
    }

    #[test]
    fn cr_assoc_acc_roundtrip() {
        let acc = CrAssocAcc {
            assoc_id: 0xaa55,
            conn_id: 0xaa55,
        };
        let mut buf = Vec::new();
        acc.encode(&mut buf);
        assert_eq!(buf.len(), CR_ASSOC_ACC_SIZE);
        let (hdr, back) = CrAssocAcc::decode(&buf).unwrap();
        assert_eq!(back, acc);
        assert_eq!(hdr.ls_cmd, LS_ACC);
        assert_eq!(hdr.rqst_ls_cmd, LS_CREATE_ASSOCIATION);
        assert_eq!(hdr.desc_list_len, lsdesc_len(CR_ASSOC_ACC_SIZE));
    }

    #[test]
    fn cr_conn_rqst_roundtrip() {
        let rqst = CrConnRqst {
            assoc_id: 0x1020,
            ersp_ratio: 8,
            qid: 2,
            sqsize: 64,
            ..Default::default()
        };
        let mut buf = Vec::new();
        rqst.encode(&mut buf);
        assert_eq!(buf.len(), CR_CONN_RQST_SIZE);
        let back = CrConnRqst::decode(&buf).unwrap();
        assert_eq!(back, rqst);
        let mut again = Vec::new();
        back.encode(&mut again);
        assert_eq!(again, buf);
    }

    #[test]
    fn cr_conn_acc_roundtrip() {
        let acc = CrConnAcc { conn_id: 0x77 };
        let mut buf = Vec::new();
        acc.encode(&mut buf);
        assert_eq!(buf.len(), CR_CONN_ACC_SIZE);
        let (hdr, back) = CrConnAcc::decode(&buf).unwrap();
        assert_eq!(back, acc);
        assert_eq!(hdr.rqst_ls_cmd, LS_CREATE_CONNECTION);
    }

    #[test]
    fn disconnect_roundtrip() {
        let rqst = DisconnRqst {
            assoc_id: 0x99,
            ..Default::default()
        };
        let mut buf = Vec::new();
        rqst.encode(&mut buf);
        assert_eq!(buf.len(), DISCONNECT_RQST_SIZE);
        let back = DisconnRqst::decode(&buf).unwrap();
        assert_eq!(back, rqst);
        let mut again = Vec::new();
        back.encode(&mut again);
        assert_eq!(again, buf);

        let mut acc = Vec::new();
        encode_disconnect_acc(&mut acc);
        assert_eq!(acc.len(), DISCONNECT_ACC_SIZE);
        let hdr = AccHdr::decode(&acc).unwrap();
        assert_eq!(hdr.ls_cmd, LS_ACC);
        assert_eq!(hdr.rqst_ls_cmd, LS_DISCONNECT);
        assert_eq!(hdr.desc_list_len, 16);
    }

    #[test]
    fn ls_rjt_roundtrip() {
        let mut rsp = Vec::new();
        let n = format_rjt(
            &mut rsp,
            LS_CREATE_CONNECTION,
            RJT_RC_INV_PARAM,
            RJT_EXP_INV_Q_ID,
            0,
        );
        assert_eq!(n, LS_RJT_SIZE);
        assert_eq!(rsp.len(), LS_RJT_SIZE);
        let rjt = LsRjt::decode(&rsp).unwrap();
        assert_eq!(rjt.rqst_ls_cmd, LS_CREATE_CONNECTION);
        assert_eq!(rjt.reason_code, RJT_RC_INV_PARAM);
        assert_eq!(rjt.reason_explanation, RJT_EXP_INV_Q_ID);

        let mut again = Vec::new();
        rjt.encode(&mut again);
        assert_eq!(again, rsp);
    }

    #[test]
    fn lsdesc_len_matches_wire_rule() {
        assert_eq!(lsdesc_len(LSDESC_RQST_SIZE), 8);
        assert_eq!(lsdesc_len(LSDESC_CR_ASSOC_CMD_SIZE), 1008);
        assert_eq!(lsdesc_len(CR_ASSOC_RQST_SIZE), 1016);
        assert_eq!(lsdesc_len(DISCONNECT_ACC_SIZE), 16);
    }
}
