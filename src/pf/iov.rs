//! Device-level assembly of the SR-IOV control plane.
//!
//! A device carries one control-plane instance per GT (primary, plus media
//! on platforms that split it out). FLR spans all of them: the reset event
//! fans out to every sub-device and finalization waits until each one has
//! observed its own FLR_DONE.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use log::{debug, error, info};

use crate::error::{IovError, IovResult};
use crate::guc::actions::{GUC2PF_VF_STATE_NOTIFY, VF_STATE_NOTIFY_MSG_LEN, VfNotify};
use crate::guc::hxg::{self, HxgOrigin, HxgType};
use crate::guc::transport::GucTransport;
use crate::pf::events;
use crate::pf::provisioning::{GtInfo, Provisioning, ProvisioningStatus};
use crate::pf::relay::Relay;
use crate::pf::service::PfService;
use crate::pf::state::VfStateSet;
use crate::pf::worker::Worker;

/// Control plane of one GT.
pub struct GtIov {
    pub info: GtInfo,
    pub provisioning: Provisioning,
    pub state: VfStateSet,
    pub relay: Relay,
}

impl GtIov {
    #[must_use]
    pub fn new(info: GtInfo, guc: Arc<dyn GucTransport>) -> Arc<Self> {
        let provisioning = Provisioning::new(info.clone(), guc.clone());
        let state = VfStateSet::new(info.gt_id, info.total_vfs, guc.clone());
        let relay = Relay::new(guc, info.total_vfs);
        relay.set_service(Arc::new(PfService::new()));
        let gt = Arc::new(Self {
            info,
            provisioning,
            state,
            relay,
        });
        gt.provisioning.init_pf();
        gt
    }
}

pub struct PfDevice {
    gts: Vec<Arc<GtIov>>,
    total_vfs: u32,
    num_vfs_enabled: AtomicU32,
    state_worker: Worker,
    prov_worker: Worker,
}

fn flr_cleanup(gt: &GtIov, vfid: u32) {
    gt.state.reset_adverse_events(vfid);
    // Every PTE in the VF's block goes back to the PF before the GuC is
    // told the reset is over.
    gt.provisioning.clear_vf_ggtt_owner(vfid);
}

/// One worker pass over all VFs of all GTs. Returns true if any VF still
/// has FLR work pending that does not wait on an external event.
fn process_all_vfs(gts: &[Arc<GtIov>], total_vfs: u32) -> bool {
    let mut more = false;
    for vfid in 1..=total_vfs {
        for gt in gts {
            let peers_done = gts.iter().all(|peer| peer.state.flr_done_received(vfid));
            more |= gt
                .state
                .step_flr(vfid, peers_done, &|| flr_cleanup(gt, vfid));
        }
    }
    more
}

impl PfDevice {
    /// Build the PF control plane from one `(GtInfo, transport)` pair per
    /// GT; the primary GT comes first.
    #[must_use]
    pub fn new(gt_parts: Vec<(GtInfo, Arc<dyn GucTransport>)>) -> Arc<Self> {
        assert!(!gt_parts.is_empty());
        let total_vfs = gt_parts[0].0.total_vfs;
        let gts: Vec<Arc<GtIov>> = gt_parts
            .into_iter()
            .map(|(info, guc)| GtIov::new(info, guc))
            .collect();

        let state_gts = gts.clone();
        let state_worker = Worker::spawn("iov-state", move || {
            while process_all_vfs(&state_gts, total_vfs) {
                std::thread::yield_now();
            }
        });

        let prov_gts = gts.clone();
        let prov_worker = Worker::spawn("iov-reprovision", move || {
            for gt in &prov_gts {
                gt.provisioning.reprovision_all(gt.info.total_vfs);
            }
        });

        Arc::new(Self {
            gts,
            total_vfs,
            num_vfs_enabled: AtomicU32::new(0),
            state_worker,
            prov_worker,
        })
    }

    #[must_use]
    pub fn total_vfs(&self) -> u32 {
        self.total_vfs
    }

    #[must_use]
    pub fn num_vfs_enabled(&self) -> u32 {
        self.num_vfs_enabled.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn gt(&self, gt_id: u32) -> &Arc<GtIov> {
        &self.gts[gt_id as usize]
    }

    #[must_use]
    pub fn root_gt(&self) -> &Arc<GtIov> {
        &self.gts[0]
    }

    #[must_use]
    pub fn gts(&self) -> &[Arc<GtIov>] {
        &self.gts
    }

    // =====================================================================
    // VF lifecycle
    // =====================================================================

    /// Enable `num_vfs` VFs: auto-provision when the store is untouched,
    /// then push every configuration to the GuC.
    pub fn enable_vfs(&self, num_vfs: u32) -> IovResult<()> {
        assert!(num_vfs >= 1 && num_vfs <= self.total_vfs);

        for gt in &self.gts {
            match gt.provisioning.verify(num_vfs) {
                ProvisioningStatus::Empty => gt.provisioning.auto_provision(num_vfs)?,
                ProvisioningStatus::PartiallyProvisioned => {
                    return Err(IovError::errno(libc::ENOKEY));
                }
                ProvisioningStatus::Provisioned => {}
            }
            gt.provisioning.push(num_vfs)?;
        }
        self.num_vfs_enabled.store(num_vfs, Ordering::Relaxed);
        info!("enabled {num_vfs} VFs");
        Ok(())
    }

    pub fn disable_vfs(&self) -> IovResult<()> {
        for gt in &self.gts {
            gt.provisioning.push(0)?;
            gt.provisioning.auto_provision(0)?;
        }
        self.num_vfs_enabled.store(0, Ordering::Relaxed);
        info!("disabled VFs");
        Ok(())
    }

    /// Invalidate pushed state after a GuC reset and schedule the worker
    /// that re-pushes everything.
    pub fn restart(&self) {
        for gt in &self.gts {
            gt.provisioning.restart();
            gt.state.reset_all();
        }
        self.prov_worker.kick();
    }

    // =====================================================================
    // FLR
    // =====================================================================

    /// Begin a VF reset on every sub-device. A reset already in flight is
    /// logged and left alone.
    pub fn start_flr(&self, vfid: u32) {
        assert!(vfid != 0 && vfid <= self.total_vfs);

        if self.root_gt().state.flr_in_progress(vfid) {
            debug!("VF{vfid} FLR is already in progress");
            return;
        }

        info!("VF{vfid} FLR");
        for gt in &self.gts {
            gt.state.begin_flr(vfid);
        }
        self.state_worker.kick();
    }

    #[must_use]
    pub fn flr_in_progress(&self, vfid: u32) -> bool {
        self.gts.iter().any(|gt| gt.state.flr_in_progress(vfid))
    }

    /// Drive pending FLR work on the caller's thread until every VF either
    /// waits on an external event or is done. Tests and teardown use this
    /// instead of the worker.
    pub fn flush_state_work(&self) {
        while process_all_vfs(&self.gts, self.total_vfs) {
            std::thread::yield_now();
        }
    }

    // =====================================================================
    // Inbound GuC events
    // =====================================================================

    fn handle_vf_event(&self, gt_id: u32, vfid: u32, event: u32) -> IovResult<()> {
        match VfNotify::from_raw(event) {
            Some(VfNotify::EnableOrFlr) => {
                // Only the root GT fans the reset out; a media GT hears the
                // same interrupt and stays quiet.
                if gt_id == 0 {
                    self.start_flr(vfid);
                } else if !self.gt(gt_id).info.is_media {
                    error!("Unexpected VF{vfid} FLR notification on GT{gt_id}");
                }
                Ok(())
            }
            Some(VfNotify::FlrDone) => {
                self.gt(gt_id).state.mark_flr_done_received(vfid);
                self.state_worker.kick();
                Ok(())
            }
            Some(VfNotify::PauseDone) => {
                self.gt(gt_id).state.mark_pause_done(vfid);
                Ok(())
            }
            Some(VfNotify::FixupDone) => {
                debug!("VF{vfid} fixup done");
                Ok(())
            }
            None => Err(IovError::errno(libc::ENOPKG)),
        }
    }

    fn handle_pf_event(&self, event: u32) -> IovResult<()> {
        match VfNotify::from_raw(event) {
            Some(VfNotify::EnableOrFlr) => {
                debug!("VFs enabled/disabled");
                Ok(())
            }
            _ => Err(IovError::errno(libc::ENOPKG)),
        }
    }

    /// Route a GUC2PF_VF_STATE_NOTIFY event.
    pub fn process_state_notify(&self, gt_id: u32, msg: &[u32]) -> IovResult<()> {
        debug_assert_eq!(hxg::origin(msg[0]), HxgOrigin::Guc);
        debug_assert_eq!(hxg::type_of(msg[0])?, HxgType::Event);
        debug_assert_eq!(hxg::action(msg[0]), GUC2PF_VF_STATE_NOTIFY);

        if hxg::data0(msg[0]) != 0 {
            return Err(IovError::FirmwareIncompatible("state notify data0"));
        }
        if msg.len() != VF_STATE_NOTIFY_MSG_LEN {
            return Err(IovError::Proto);
        }

        let vfid = msg[1];
        let event = msg[2];
        if vfid > self.total_vfs {
            return Err(IovError::errno(libc::EINVAL));
        }

        if vfid != 0 {
            self.handle_vf_event(gt_id, vfid, event)
        } else {
            self.handle_pf_event(event)
        }
    }

    /// Route a GUC2PF_ADVERSE_EVENT notification.
    pub fn process_adverse_event(&self, gt_id: u32, msg: &[u32]) -> IovResult<()> {
        let gt = self.gt(gt_id);
        events::process_guc2pf(&gt.state, self.total_vfs, msg)
    }

    // =====================================================================
    // Pause / resume / stop across all GTs
    // =====================================================================

    pub fn pause_vf(&self, vfid: u32, inferred: bool) -> IovResult<()> {
        for gt in &self.gts {
            gt.state.pause_vf_sync(vfid, inferred)?;
        }
        Ok(())
    }

    pub fn resume_vf(&self, vfid: u32) -> IovResult<()> {
        for gt in &self.gts {
            gt.state.resume_vf(vfid)?;
        }
        Ok(())
    }

    pub fn stop_vf(&self, vfid: u32) -> IovResult<()> {
        for gt in &self.gts {
            gt.state.stop_vf(vfid)?;
        }
        Ok(())
    }
}
