//! Adverse-event accounting.
//!
//! The GuC samples per-VF activity against the provisioned thresholds and
//! notifies the PF whenever one is exceeded. The PF only counts; policy
//! (e.g. stopping a noisy VF) is left to the administrator.

use log::{debug, info, warn};

use crate::error::{IovError, IovResult};
use crate::guc::actions::{ADVERSE_EVENT_MSG_LEN, GUC2PF_ADVERSE_EVENT};
use crate::guc::hxg::{self, HxgOrigin, HxgType};
use crate::pf::config::Threshold;
use crate::pf::state::VfStateSet;

/// Handle a GUC2PF_ADVERSE_EVENT notification.
pub fn process_guc2pf(state: &VfStateSet, total_vfs: u32, msg: &[u32]) -> IovResult<()> {
    debug_assert!(!msg.is_empty());
    debug_assert_eq!(hxg::origin(msg[0]), HxgOrigin::Guc);
    debug_assert_eq!(hxg::type_of(msg[0])?, HxgType::Event);
    debug_assert_eq!(hxg::action(msg[0]), GUC2PF_ADVERSE_EVENT);

    if hxg::data0(msg[0]) != 0 {
        return Err(IovError::FirmwareIncompatible("adverse event data0"));
    }
    if msg.len() != ADVERSE_EVENT_MSG_LEN {
        return Err(IovError::Proto);
    }

    let vfid = msg[1];
    let threshold_key = msg[2];

    if vfid == 0 || vfid > total_vfs {
        return Err(IovError::errno(libc::EINVAL));
    }
    let Some(threshold) = Threshold::from_klv_key(threshold_key as u16) else {
        warn!("unknown threshold key {threshold_key:#06x} from VF{vfid}");
        return Err(IovError::errno(libc::EINVAL));
    };

    debug!("VF{} threshold {:04x}", vfid, threshold_key);
    state.bump_adverse_event(vfid, threshold.index());

    // The uevent the sysfs surface advertises to management agents.
    info!(
        "THRESHOLD_EXCEEDED=1 THRESHOLD_ID={:#x} VF_ID={}",
        threshold_key, vfid
    );
    Ok(())
}

/// Print adverse-event counters for all VFs; VFs with no events are
/// skipped.
pub fn print_events(
    state: &VfStateSet,
    total_vfs: u32,
    w: &mut dyn std::fmt::Write,
) -> std::fmt::Result {
    for vfid in 1..=total_vfs {
        let counters = state.adverse_events(vfid);
        if counters.iter().all(|&c| c == 0) {
            continue;
        }
        write!(w, "VF{vfid}:\t")?;
        for t in Threshold::ALL {
            write!(w, "{}:{} ", t.name(), counters[t.index()])?;
        }
        writeln!(w)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guc::transport::testing::ScriptedGuc;
    use crate::pf::config::NUM_THRESHOLDS;

    fn event_msg(vfid: u32, key: u32) -> [u32; 3] {
        [
            hxg::header(HxgOrigin::Guc, HxgType::Event, 0, GUC2PF_ADVERSE_EVENT),
            vfid,
            key,
        ]
    }

    #[test]
    fn event_bumps_counter() {
        let state = VfStateSet::new(0, 2, ScriptedGuc::new());
        let key = u32::from(Threshold::PageFault.klv_key());
        process_guc2pf(&state, 2, &event_msg(1, key)).unwrap();
        process_guc2pf(&state, 2, &event_msg(1, key)).unwrap();
        assert_eq!(
            state.adverse_events(1)[Threshold::PageFault.index()],
            2
        );
        state.reset_adverse_events(1);
        assert_eq!(state.adverse_events(1), [0; NUM_THRESHOLDS]);
    }

    #[test]
    fn event_rejects_bad_vfid_and_key() {
        let state = VfStateSet::new(0, 2, ScriptedGuc::new());
        let key = u32::from(Threshold::CatErr.klv_key());
        assert!(process_guc2pf(&state, 2, &event_msg(0, key)).is_err());
        assert!(process_guc2pf(&state, 2, &event_msg(3, key)).is_err());
        assert!(process_guc2pf(&state, 2, &event_msg(1, 0x1234)).is_err());
    }

    #[test]
    fn printer_skips_quiet_vfs() {
        let state = VfStateSet::new(0, 2, ScriptedGuc::new());
        let key = u32::from(Threshold::IrqStorm.klv_key());
        process_guc2pf(&state, 2, &event_msg(2, key)).unwrap();

        let mut out = String::new();
        print_events(&state, 2, &mut out).unwrap();
        assert!(out.starts_with("VF2:"));
        assert!(out.contains("irq_storm:1"));
        assert!(!out.contains("VF1"));
    }
}
