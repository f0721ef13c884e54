//! Physical port, target virtual port (nport) and remote (initiator)
//! port objects.

use std::fmt;

use crate::fabric::{assoc::AssocSerial, hwqp::HwqpId};

pub const MAX_NUM_FC_PORTS: u16 = 32;

/// PRLI service parameters the target advertises.
pub const PRLI_FIRST_BURST_SUPPORTED: u32 = 0x0001;
pub const PRLI_DISCOVERY_SERVICE: u32 = 0x0008;
pub const PRLI_TARGET_FUNCTION: u32 = 0x0010;
pub const PRLI_INITIATOR_FUNCTION: u32 = 0x0020;
pub const PRLI_CONFIRMED_COMPLETION_SUPPORTED: u32 = 0x0080;

pub fn prli_service_params() -> u32 {
    PRLI_DISCOVERY_SERVICE | PRLI_TARGET_FUNCTION
}

/// FC world wide name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Wwn(pub u64);

impl fmt::Display for Wwn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// Transport address string used when registering the nport as a
/// subsystem listener.
pub fn traddr(node_name: Wwn, port_name: Wwn) -> String {
    format!("nn-{}:pn-{}", node_name, port_name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FcPortState {
    Offline,
    Online,
    Quiesced,
}

/// Generic object lifecycle shared by nport, remote port, association and
/// connection. Zombie marks a partial create or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjState {
    Created,
    ToBeDeleted,
    Zombie,
}

/// FC remote port: one initiator reached through an nport.
#[derive(Debug)]
pub struct RemotePort {
    pub s_id: u32,
    pub rpi: u16,
    pub assoc_count: u32,
    pub fc_nodename: Wwn,
    pub fc_portname: Wwn,
    pub state: ObjState,
}

/// One logical FC endpoint on a physical port.
#[derive(Debug)]
pub struct Nport {
    pub nport_hdl: u16,
    pub port_hdl: u8,
    pub d_id: u32,
    pub state: ObjState,
    pub fc_nodename: Wwn,
    pub fc_portname: Wwn,
    pub rports: Vec<RemotePort>,
    pub rport_count: u32,
    pub assocs: Vec<AssocSerial>,
    pub assoc_count: u32,
    /// in-progress nport delete operation, if any
    pub del_op: Option<u64>,
}

impl Nport {
    pub fn new(
        port_hdl: u8,
        nport_hdl: u16,
        d_id: u32,
        fc_nodename: Wwn,
        fc_portname: Wwn,
    ) -> Self {
        Self {
            nport_hdl,
            port_hdl,
            d_id,
            state: ObjState::Created,
            fc_nodename,
            fc_portname,
            rports: Vec::new(),
            rport_count: 0,
            assocs: Vec::new(),
            assoc_count: 0,
            del_op: None,
        }
    }

    pub fn has_no_rport(&self) -> bool {
        if self.rports.is_empty() {
            assert_eq!(self.rport_count, 0);
            true
        } else {
            false
        }
    }

    pub fn find_rport(&self, s_id: u32, rpi: u16) -> Option<usize> {
        self.rports
            .iter()
            .position(|r| r.s_id == s_id && r.rpi == rpi)
    }

    pub fn add_rport(&mut self, rport: RemotePort) {
        self.rports.push(rport);
        self.rport_count += 1;
    }

    pub fn remove_rport(&mut self, s_id: u32, rpi: u16) -> Option<RemotePort> {
        let i = self.find_rport(s_id, rpi)?;
        self.rport_count -= 1;
        Some(self.rports.remove(i))
    }
}

/// FC physical port: a dedicated LS HWQP plus an array of IO HWQPs and
/// the nports living on it.
#[derive(Debug)]
pub struct FcPort {
    pub port_hdl: u8,
    pub state: FcPortState,
    /// base receive queue id of the companion SCSI queue set
    pub fcp_rq_id: u16,
    pub ls_hwqp: HwqpId,
    pub io_hwqps: Vec<HwqpId>,
    pub nports: Vec<Nport>,
    pub num_nports: u32,
}

impl FcPort {
    pub fn is_online(&self) -> bool {
        self.state == FcPortState::Online
    }

    pub fn is_offline(&self) -> bool {
        self.state == FcPortState::Offline
    }

    /// A quiesced port no longer owns its exchanges.
    pub fn is_dead(&self) -> bool {
        self.state == FcPortState::Quiesced
    }

    pub fn find_nport(&self, nport_hdl: u16) -> Option<usize> {
        self.nports.iter().position(|n| n.nport_hdl == nport_hdl)
    }

    pub fn add_nport(&mut self, nport: Nport) {
        self.nports.push(nport);
        self.num_nports += 1;
    }

    pub fn remove_nport(&mut self, nport_hdl: u16) -> Option<Nport> {
        let i = self.find_nport(nport_hdl)?;
        self.num_nports -= 1;
        Some(self.nports.remove(i))
    }
}
