//! GuC action numbers and request layouts consumed by the PF.

use crate::guc::hxg;

// GuC <-> PF actions
pub const GUC2PF_RELAY_FROM_VF: u16 = 0x5100;
pub const PF2GUC_RELAY_TO_VF: u16 = 0x5101;
pub const GUC2PF_ADVERSE_EVENT: u16 = 0x5104;
pub const GUC2PF_VF_STATE_NOTIFY: u16 = 0x5106;
pub const PF2GUC_UPDATE_VGT_POLICY: u16 = 0x5502;
pub const PF2GUC_UPDATE_VF_CFG: u16 = 0x5503;
pub const PF2GUC_VF_CONTROL: u16 = 0x5506;
pub const PF2GUC_SAVE_RESTORE_VF: u16 = 0x550B;

// GuC <-> VF actions
pub const GUC2VF_RELAY_FROM_PF: u16 = 0x5102;
pub const VF2GUC_RELAY_TO_PF: u16 = 0x5103;

/// PF2GUC_VF_CONTROL commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VfControl {
    Pause = 1,
    Resume = 2,
    Stop = 3,
    FlrStart = 4,
    FlrFinish = 5,
}

/// GUC2PF_VF_STATE_NOTIFY events. `Enable` is only valid with VFID = 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VfNotify {
    EnableOrFlr = 1,
    FlrDone = 2,
    PauseDone = 3,
    FixupDone = 4,
}

impl VfNotify {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::EnableOrFlr),
            2 => Some(Self::FlrDone),
            3 => Some(Self::PauseDone),
            4 => Some(Self::FixupDone),
            _ => None,
        }
    }
}

/// PF2GUC_SAVE_RESTORE_VF opcodes, carried in header data0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SaveRestore {
    Save = 0,
    Restore = 1,
}

pub const VF_STATE_NOTIFY_MSG_LEN: usize = 3;
pub const ADVERSE_EVENT_MSG_LEN: usize = 3;

/// Relay transport framing: action header plus routing dwords, then up to 60
/// dwords of embedded message.
pub const RELAY_PAYLOAD_MAX_LEN: usize = 60;
pub const PF2GUC_RELAY_HDR_LEN: usize = 3; // header, vfid, relay_id
pub const VF2GUC_RELAY_HDR_LEN: usize = 2; // header, relay_id

#[must_use]
pub fn vf_control_request(vfid: u32, cmd: VfControl) -> [u32; 3] {
    [hxg::request(PF2GUC_VF_CONTROL, 0), vfid, cmd as u32]
}

#[must_use]
pub fn update_vf_cfg_request(vfid: u32, addr: u64, n_dwords: u32) -> [u32; 5] {
    [
        hxg::request(PF2GUC_UPDATE_VF_CFG, 0),
        vfid,
        hxg::lower_32_bits(addr),
        hxg::upper_32_bits(addr),
        n_dwords,
    ]
}

#[must_use]
pub fn update_policy_request(addr: u64, n_dwords: u32) -> [u32; 4] {
    [
        hxg::request(PF2GUC_UPDATE_VGT_POLICY, 0),
        hxg::lower_32_bits(addr),
        hxg::upper_32_bits(addr),
        n_dwords,
    ]
}

#[must_use]
pub fn save_restore_request(op: SaveRestore, vfid: u32, addr: u64, size_dw: u32) -> [u32; 5] {
    [
        hxg::request(PF2GUC_SAVE_RESTORE_VF, op as u32),
        vfid,
        hxg::lower_32_bits(addr),
        hxg::upper_32_bits(addr),
        size_dw,
    ]
}
