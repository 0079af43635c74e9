//! Per-VF runtime state: FLR progression, pause/resume/stop, save/restore.
//!
//! The FLR sequence runs in five steps:
//!
//! ```text
//!          PF                        GUC             PCI
//! ========================================================
//! (1)      |                          |<------- FLR --|
//! (2)      |<----------- NOTIFY FLR --|
//! (3)      |-- START FLR ------------>|
//! (4)      |<------------- FLR DONE --|
//! (5)      |-- FINISH FLR ----------->|
//! ```
//!
//! Steps 3 and 5 are driven by a worker walking explicit stages; every
//! stage change goes through one mutator so the whole life of a reset is
//! visible in the logs.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use bitflags::bitflags;
use log::{debug, error, info, warn};

use crate::error::{IovError, IovResult};
use crate::guc::actions::{self, SaveRestore, VfControl};
use crate::guc::transport::{GucTransport, send_looped};
use crate::pf::config::NUM_THRESHOLDS;

pub const VF_PAUSE_TIMEOUT: Duration = Duration::from_millis(500);

/// Smallest buffer the GuC accepts for VF state save/restore; also the
/// exact size of the sysfs `state` blob.
pub const SAVE_RESTORE_MIN_SIZE: usize = 4096;

bitflags! {
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct PauseFlags: u8 {
        const IN_PROGRESS = 1 << 0;
        const BY_SUSPEND = 1 << 1;
    }
}

/// FLR progression of one VF on one GT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlrStage {
    #[default]
    Idle,
    /// FLR_START must still be sent to the GuC.
    Starting,
    /// FLR_START accepted, waiting for the FLR_DONE notification.
    WaitingDone,
    /// FLR_DONE seen here, waiting until every sub-device has seen its own.
    Syncing,
    /// All sub-devices done; cleanup and FLR_FINISH pending.
    Finishing,
    /// A GuC round trip failed; the VF is wedged until the next FLR.
    Failed,
}

#[derive(Debug, Default)]
struct VfState {
    flr: FlrStage,
    flr_done_received: bool,
    paused: bool,
    pause: PauseFlags,
    adverse_events: [u64; NUM_THRESHOLDS],
}

/// State of every VF on a single GT. Entry 0 (the PF) exists but never
/// leaves `Idle`.
pub struct VfStateSet {
    gt_id: u32,
    total_vfs: u32,
    guc: Arc<dyn GucTransport>,
    states: Vec<(Mutex<VfState>, Condvar)>,
    /// Serializes FLR worker steps so a step observed in `Starting` cannot
    /// issue FLR_START twice.
    step_lock: Mutex<()>,
}

impl VfStateSet {
    #[must_use]
    pub fn new(gt_id: u32, total_vfs: u32, guc: Arc<dyn GucTransport>) -> Self {
        let states = (0..=total_vfs).map(|_| Default::default()).collect();
        Self {
            gt_id,
            total_vfs,
            guc,
            states,
            step_lock: Mutex::new(()),
        }
    }

    fn state(&self, vfid: u32) -> &(Mutex<VfState>, Condvar) {
        assert!(vfid <= self.total_vfs && vfid != 0, "bad VFID {vfid}");
        &self.states[vfid as usize]
    }

    pub fn reset_all(&self) {
        for (lock, _) in &self.states {
            *lock.lock().unwrap() = VfState::default();
        }
    }

    // =====================================================================
    // GuC control commands
    // =====================================================================

    fn control_vf(&self, vfid: u32, cmd: VfControl) -> IovResult<()> {
        let req = actions::vf_control_request(vfid, cmd);
        match send_looped(self.guc.as_ref(), &req) {
            Ok(0) => Ok(()),
            Ok(_) => Err(IovError::Proto),
            Err(err) => Err(err),
        }
    }

    // =====================================================================
    // FLR stage accessors (the worker in `pf::iov` drives these)
    // =====================================================================

    #[must_use]
    pub fn flr_stage(&self, vfid: u32) -> FlrStage {
        self.state(vfid).0.lock().unwrap().flr
    }

    /// The single stage mutator; every transition is logged.
    fn set_stage(&self, state: &mut VfState, vfid: u32, next: FlrStage) {
        debug!(
            "GT{}: VF{} FLR {:?} -> {:?}",
            self.gt_id, vfid, state.flr, next
        );
        state.flr = next;
    }

    /// Begin a reset on this GT. Returns false if one is already running,
    /// in which case no new work is enqueued.
    pub fn begin_flr(&self, vfid: u32) -> bool {
        let mut state = self.state(vfid).0.lock().unwrap();
        if state.flr != FlrStage::Idle && state.flr != FlrStage::Failed {
            debug!("GT{}: VF{} FLR is already in progress", self.gt_id, vfid);
            return false;
        }
        state.paused = false;
        state.pause = PauseFlags::empty();
        state.flr_done_received = false;
        self.set_stage(&mut state, vfid, FlrStage::Starting);
        true
    }

    #[must_use]
    pub fn flr_in_progress(&self, vfid: u32) -> bool {
        !matches!(self.flr_stage(vfid), FlrStage::Idle | FlrStage::Failed)
    }

    pub fn mark_flr_done_received(&self, vfid: u32) {
        self.state(vfid).0.lock().unwrap().flr_done_received = true;
    }

    #[must_use]
    pub fn flr_done_received(&self, vfid: u32) -> bool {
        self.state(vfid).0.lock().unwrap().flr_done_received
    }

    /// One worker step for one VF on this GT. `peers_done` answers whether
    /// every sub-device of the VF has observed its FLR_DONE. Returns true
    /// if the worker should run again for this VF.
    pub fn step_flr(&self, vfid: u32, peers_done: bool, finish_cleanup: &dyn Fn()) -> bool {
        let _step = self.step_lock.lock().unwrap();
        let stage = self.flr_stage(vfid);
        match stage {
            FlrStage::Idle | FlrStage::Failed => false,

            FlrStage::Starting => {
                match self.control_vf(vfid, VfControl::FlrStart) {
                    Ok(()) => {
                        let mut state = self.state(vfid).0.lock().unwrap();
                        state.pause.remove(PauseFlags::IN_PROGRESS);
                        self.set_stage(&mut state, vfid, FlrStage::WaitingDone);
                        true
                    }
                    Err(IovError::Busy) => true,
                    Err(err) => {
                        error!("Failed to start FLR for VF{vfid} ({err})");
                        let mut state = self.state(vfid).0.lock().unwrap();
                        self.set_stage(&mut state, vfid, FlrStage::Failed);
                        false
                    }
                }
            }

            FlrStage::WaitingDone => {
                let mut state = self.state(vfid).0.lock().unwrap();
                if state.flr_done_received {
                    self.set_stage(&mut state, vfid, FlrStage::Syncing);
                    true
                } else {
                    false
                }
            }

            FlrStage::Syncing => {
                if !peers_done {
                    return false;
                }
                let mut state = self.state(vfid).0.lock().unwrap();
                self.set_stage(&mut state, vfid, FlrStage::Finishing);
                true
            }

            FlrStage::Finishing => {
                finish_cleanup();
                match self.control_vf(vfid, VfControl::FlrFinish) {
                    Ok(()) => {
                        // `flr_done_received` stays set until the next
                        // reset: peers may still be syncing against it.
                        let mut state = self.state(vfid).0.lock().unwrap();
                        self.set_stage(&mut state, vfid, FlrStage::Idle);
                        false
                    }
                    Err(IovError::Busy) => true,
                    Err(err) => {
                        error!("Failed to confirm FLR for VF{vfid} ({err})");
                        let mut state = self.state(vfid).0.lock().unwrap();
                        self.set_stage(&mut state, vfid, FlrStage::Failed);
                        false
                    }
                }
            }
        }
    }

    // =====================================================================
    // Pause / resume / stop
    // =====================================================================

    #[must_use]
    pub fn is_paused(&self, vfid: u32) -> bool {
        self.state(vfid).0.lock().unwrap().paused
    }

    /// True when the VF neither is paused nor has a pause in flight.
    #[must_use]
    pub fn no_pause(&self, vfid: u32) -> bool {
        let state = self.state(vfid).0.lock().unwrap();
        !state.pause.contains(PauseFlags::IN_PROGRESS) && !state.paused
    }

    pub fn pause_vf(&self, vfid: u32) -> IovResult<()> {
        if self.flr_in_progress(vfid) || !self.no_pause(vfid) {
            error!("VF{vfid} cannot be paused in current state");
            return Err(IovError::Busy);
        }

        {
            let mut state = self.state(vfid).0.lock().unwrap();
            if state.pause.contains(PauseFlags::IN_PROGRESS) {
                error!("VF{vfid} pause is already in progress");
                return Err(IovError::Busy);
            }
            state.pause.insert(PauseFlags::IN_PROGRESS);
        }

        if let Err(err) = self.control_vf(vfid, VfControl::Pause) {
            let mut state = self.state(vfid).0.lock().unwrap();
            state.pause.remove(PauseFlags::IN_PROGRESS);
            error!("Failed to trigger VF{vfid} pause ({err})");
            return Err(err);
        }
        Ok(())
    }

    /// GuC confirmed the pause.
    pub fn mark_pause_done(&self, vfid: u32) {
        let (lock, cv) = self.state(vfid);
        let mut state = lock.lock().unwrap();
        state.paused = true;
        state.pause.remove(PauseFlags::IN_PROGRESS);
        info!("VF{vfid} paused");
        cv.notify_all();
    }

    /// Issue a pause if needed and wait until the state settles.
    /// `inferred` marks pauses requested by the kernel (suspend) rather
    /// than by the user, so a later resume sweep can undo them.
    pub fn pause_vf_sync(&self, vfid: u32, inferred: bool) -> IovResult<()> {
        if self.no_pause(vfid) {
            self.pause_vf(vfid)?;
            if inferred {
                let mut state = self.state(vfid).0.lock().unwrap();
                state.pause.insert(PauseFlags::BY_SUSPEND);
            }
        }
        if !inferred {
            let mut state = self.state(vfid).0.lock().unwrap();
            state.pause.remove(PauseFlags::BY_SUSPEND);
        }

        let (lock, cv) = self.state(vfid);
        let state = lock.lock().unwrap();
        let (state, timeout) = cv
            .wait_timeout_while(state, VF_PAUSE_TIMEOUT, |s| !s.paused)
            .unwrap();
        let paused = state.paused;
        drop(state);
        if timeout.timed_out() && !paused {
            error!(
                "VF{} pause didn't complete within {} ms",
                vfid,
                VF_PAUSE_TIMEOUT.as_millis()
            );
            return Err(IovError::Timeout);
        }
        Ok(())
    }

    pub fn resume_vf(&self, vfid: u32) -> IovResult<()> {
        self.control_vf(vfid, VfControl::Resume)?;
        let mut state = self.state(vfid).0.lock().unwrap();
        state.paused = false;
        state.pause.remove(PauseFlags::BY_SUSPEND);
        Ok(())
    }

    /// Resume every VF whose pause was inferred from a suspend cycle.
    pub fn resume_all_suspended(&self) -> IovResult<()> {
        for vfid in 1..=self.total_vfs {
            let suspended = self
                .state(vfid)
                .0
                .lock()
                .unwrap()
                .pause
                .contains(PauseFlags::BY_SUSPEND);
            if suspended {
                self.resume_vf(vfid)?;
            }
        }
        Ok(())
    }

    pub fn stop_vf(&self, vfid: u32) -> IovResult<()> {
        self.control_vf(vfid, VfControl::Stop)
    }

    // =====================================================================
    // Save / restore
    // =====================================================================

    /// Ask the GuC how big a save buffer the VF needs, in bytes.
    pub fn save_vf_size(&self, vfid: u32) -> IovResult<usize> {
        let req = actions::save_restore_request(SaveRestore::Save, vfid, 0, 0);
        match send_looped(self.guc.as_ref(), &req) {
            Ok(dwords) => Ok(dwords as usize * 4),
            Err(err) => {
                error!("Failed to query VF{vfid} save state size ({err})");
                Err(err)
            }
        }
    }

    /// Save the VF state into `buf`; returns the number of bytes written.
    pub fn save_vf(&self, vfid: u32, buf: &mut [u8]) -> IovResult<usize> {
        if buf.len() < SAVE_RESTORE_MIN_SIZE {
            return Err(IovError::errno(libc::EINVAL));
        }

        let dwords = buf.len() / 4;
        let scratch = self.guc.alloc_buf(dwords)?;
        let req = actions::save_restore_request(
            SaveRestore::Save,
            vfid,
            scratch.gpu_addr,
            dwords as u32,
        );
        let written = match send_looped(self.guc.as_ref(), &req) {
            Ok(n) if n as usize <= dwords => n as usize,
            Ok(_) => return Err(IovError::Proto),
            Err(err) => {
                error!("Failed to save VF{vfid} state ({err})");
                return Err(err);
            }
        };

        let words = scratch.read(dwords);
        for (chunk, word) in buf.chunks_exact_mut(4).zip(&words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        let rsize = written * 4;

        // The firmware is known to scribble past the reported size
        // (firmware bug GuC-SaveTail); report it rather than masking it.
        if buf[rsize..].iter().any(|&b| b != 0) {
            warn!("firmware bug GuC-SaveTail: non-zero state beyond offset {rsize}");
        }

        debug!("VF{vfid}: state saved ({rsize} bytes)");
        Ok(rsize)
    }

    /// Restore a previously saved state. The VF must already be paused.
    pub fn restore_vf(&self, vfid: u32, buf: &[u8]) -> IovResult<()> {
        if buf.len() < SAVE_RESTORE_MIN_SIZE {
            return Err(IovError::errno(libc::EINVAL));
        }
        if !self.is_paused(vfid) {
            return Err(IovError::errno(libc::EPERM));
        }

        let dwords = buf.len() / 4;
        let scratch = self.guc.alloc_buf(dwords)?;
        let words: Vec<u32> = buf
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
            .collect();
        scratch.write(&words);

        let req = actions::save_restore_request(
            SaveRestore::Restore,
            vfid,
            scratch.gpu_addr,
            dwords as u32,
        );
        match send_looped(self.guc.as_ref(), &req) {
            Ok(n) => {
                debug!("VF{}: state restored ({} bytes)", vfid, n * 4);
                Ok(())
            }
            Err(err) => {
                error!("Failed to restore VF{vfid} state ({err})");
                Err(err)
            }
        }
    }

    // =====================================================================
    // Adverse-event counters
    // =====================================================================

    pub fn bump_adverse_event(&self, vfid: u32, index: usize) {
        self.state(vfid).0.lock().unwrap().adverse_events[index] += 1;
    }

    #[must_use]
    pub fn adverse_events(&self, vfid: u32) -> [u64; NUM_THRESHOLDS] {
        self.state(vfid).0.lock().unwrap().adverse_events
    }

    pub fn reset_adverse_events(&self, vfid: u32) {
        self.state(vfid).0.lock().unwrap().adverse_events = [0; NUM_THRESHOLDS];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guc::transport::testing::ScriptedGuc;

    fn state_set() -> (VfStateSet, Arc<ScriptedGuc>) {
        let guc = ScriptedGuc::new();
        (VfStateSet::new(0, 2, guc.clone()), guc)
    }

    #[test]
    fn flr_walks_all_stages() {
        let (set, guc) = state_set();
        assert!(set.begin_flr(1));
        assert_eq!(set.flr_stage(1), FlrStage::Starting);

        assert!(set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::WaitingDone);
        assert_eq!(guc.sent().last().unwrap()[2], VfControl::FlrStart as u32);

        // No FLR_DONE yet: nothing to do.
        assert!(!set.step_flr(1, true, &|| {}));

        set.mark_flr_done_received(1);
        assert!(set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::Syncing);
        assert!(set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::Finishing);

        let cleaned = std::sync::atomic::AtomicBool::new(false);
        assert!(!set.step_flr(1, true, &|| {
            cleaned.store(true, std::sync::atomic::Ordering::Relaxed)
        }));
        assert!(cleaned.load(std::sync::atomic::Ordering::Relaxed));
        assert_eq!(set.flr_stage(1), FlrStage::Idle);
        assert_eq!(guc.sent().last().unwrap()[2], VfControl::FlrFinish as u32);
    }

    #[test]
    fn flr_waits_for_peers() {
        let (set, _guc) = state_set();
        set.begin_flr(1);
        set.step_flr(1, false, &|| {});
        set.mark_flr_done_received(1);
        set.step_flr(1, false, &|| {});
        assert_eq!(set.flr_stage(1), FlrStage::Syncing);
        // Peers not done: stay in Syncing.
        assert!(!set.step_flr(1, false, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::Syncing);
    }

    #[test]
    fn second_flr_request_is_ignored() {
        let (set, _guc) = state_set();
        assert!(set.begin_flr(1));
        assert!(!set.begin_flr(1));
    }

    #[test]
    fn flr_start_busy_retries() {
        let (set, guc) = state_set();
        set.begin_flr(1);
        guc.push_reply(Err(IovError::Busy));
        assert!(set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::Starting);
        assert!(set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::WaitingDone);
    }

    #[test]
    fn flr_start_failure_wedges() {
        let (set, guc) = state_set();
        set.begin_flr(1);
        guc.push_reply(Err(IovError::Guc { code: 22, hint: 0 }));
        assert!(!set.step_flr(1, true, &|| {}));
        assert_eq!(set.flr_stage(1), FlrStage::Failed);
        assert!(!set.flr_in_progress(1));
    }

    #[test]
    fn pause_then_done_event() {
        let (set, _guc) = state_set();
        set.pause_vf(1).unwrap();
        assert!(!set.no_pause(1));
        assert!(!set.is_paused(1));
        set.mark_pause_done(1);
        assert!(set.is_paused(1));
        set.resume_vf(1).unwrap();
        assert!(set.no_pause(1));
    }

    #[test]
    fn pause_rejected_during_flr() {
        let (set, _guc) = state_set();
        set.begin_flr(1);
        assert!(matches!(set.pause_vf(1), Err(IovError::Busy)));
    }

    #[test]
    fn pause_sync_times_out_without_event() {
        let (set, _guc) = state_set();
        assert!(matches!(
            set.pause_vf_sync(1, false),
            Err(IovError::Timeout)
        ));
    }

    #[test]
    fn pause_error_clears_in_progress() {
        let (set, guc) = state_set();
        guc.push_reply(Err(IovError::Guc { code: 1, hint: 0 }));
        assert!(set.pause_vf(1).is_err());
        assert!(set.no_pause(1));
    }

    #[test]
    fn restore_requires_pause() {
        let (set, _guc) = state_set();
        let buf = vec![0u8; SAVE_RESTORE_MIN_SIZE];
        assert!(matches!(
            set.restore_vf(1, &buf),
            Err(IovError::Errno(code)) if code == libc::EPERM
        ));
        set.pause_vf(1).unwrap();
        set.mark_pause_done(1);
        set.restore_vf(1, &buf).unwrap();
    }

    #[test]
    fn save_round_trip() {
        let (set, guc) = state_set();
        let size = set.save_vf_size(1).unwrap();
        assert!(size >= SAVE_RESTORE_MIN_SIZE);
        let mut buf = vec![0u8; SAVE_RESTORE_MIN_SIZE];
        guc.push_reply(Ok(SAVE_RESTORE_MIN_SIZE as u32 / 4));
        let written = set.save_vf(1, &mut buf).unwrap();
        assert_eq!(written, SAVE_RESTORE_MIN_SIZE);
    }
}
