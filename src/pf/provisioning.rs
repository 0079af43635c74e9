//! VF resource provisioning engine.
//!
//! Carves GGTT, GuC context IDs, doorbells and LMEM into per-VF quotas and
//! keeps the GuC's view in sync: every accepted change is pushed as a KLV
//! blob, every release first pushes zeros so the firmware drops the old
//! allocation before the range can be reassigned.
//!
//! A single mutex serializes every read and write of the store, and is held
//! across the GuC round trips so a record never disagrees with what the
//! firmware was last told.

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error};

use crate::error::{IovError, IovResult};
use crate::guc::actions;
use crate::guc::klv::{self, KlvWriter};
use crate::guc::transport::{GucTransport, send_looped};
use crate::pf::config::{LmemObj, PFID, SchedPriority, Threshold, VfConfig};
use crate::pf::ggtt::{GgttManager, GgttNode, SZ_2M};
use crate::pf::idm::{
    self, GUC_NUM_DOORBELLS, RangeBitmap, align_ctxs, ctxs_bitmap_total_bits,
};

/// Static description of the GT this provisioning store serves.
#[derive(Debug, Clone)]
pub struct GtInfo {
    pub gt_id: u32,
    pub is_media: bool,
    pub total_vfs: u32,
    pub ggtt_wopcm: u64,
    pub ggtt_size: u64,
    /// 4 KiB, or 64 KiB on platforms that require 64 KiB GGTT granules.
    pub ggtt_alignment: u64,
    /// `Some` on discrete devices.
    pub lmem_size: Option<u64>,
    /// Whether the device carries a media tile next to the primary one.
    pub has_media_gt: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Policies {
    pub sched_if_idle: bool,
    pub reset_engine: bool,
    /// Adverse-event sampling period in milliseconds.
    pub sample_period: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct Spare {
    pub ggtt_size: u64,
    pub num_ctxs: u32,
    pub num_dbs: u32,
    pub lmem_size: u64,
}

/// Overall shape of the store, as reported to the VF enable path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisioningStatus {
    /// No VF has any resource.
    Empty,
    /// At least one VF is missing a mandatory resource.
    PartiallyProvisioned,
    /// Every checked VF holds all mandatory resources.
    Provisioned,
}

struct ProvInner {
    configs: Vec<VfConfig>,
    ggtt: GgttManager,
    lmem_used: u64,
    policies: Policies,
    spare: Spare,
    num_pushed: u32,
    auto_mode: bool,
}

pub struct Provisioning {
    info: GtInfo,
    guc: Arc<dyn GucTransport>,
    inner: Mutex<ProvInner>,
}

// Platform minimums the PF always retains for itself.
const MIN_SPARE_CTXS: u32 = 2 * idm::CTXS_GRANULARITY;
const MIN_SPARE_DBS: u32 = 1;
const MIN_SPARE_LMEM: u64 = SZ_2M;

const PUSH_BUF_DWORDS: usize = 1024; // 4 KiB staging blob

impl Provisioning {
    #[must_use]
    pub fn new(info: GtInfo, guc: Arc<dyn GucTransport>) -> Self {
        let ggtt = GgttManager::new(info.ggtt_wopcm, info.ggtt_size, info.ggtt_alignment);
        let spare = Spare {
            ggtt_size: info.ggtt_alignment,
            num_ctxs: MIN_SPARE_CTXS,
            num_dbs: MIN_SPARE_DBS,
            lmem_size: if info.lmem_size.is_some() {
                MIN_SPARE_LMEM
            } else {
                0
            },
        };
        let inner = ProvInner {
            configs: vec![VfConfig::default(); 1 + info.total_vfs as usize],
            ggtt,
            lmem_used: 0,
            policies: Policies::default(),
            spare,
            num_pushed: 0,
            auto_mode: false,
        };
        Self {
            info,
            guc,
            inner: Mutex::new(inner),
        }
    }

    #[must_use]
    pub fn info(&self) -> &GtInfo {
        &self.info
    }

    fn lock(&self) -> MutexGuard<'_, ProvInner> {
        self.inner.lock().unwrap()
    }

    fn assert_vfid(&self, id: u32) {
        assert!(id <= self.info.total_vfs, "VFID {id} out of range");
    }

    /// Partition the fixed PF share of contexts. Must run before any VF is
    /// provisioned; PF allocations cannot change once VFs exist.
    pub fn init_pf(&self) {
        let total_vfs = self.info.total_vfs;
        let mut inner = self.lock();
        debug_assert_eq!(inner.configs[PFID as usize].num_ctxs, 0);

        let total_bits = ctxs_bitmap_total_bits();
        let pf_bits = total_bits - (total_bits / (1 + total_vfs)) * total_vfs;
        let pf_ctxs = idm::decode_count_first(pf_bits);

        debug!(
            "GT{}: contexts {} = {} pf + {} available",
            self.info.gt_id,
            idm::GUC_MAX_CONTEXT_ID,
            pf_ctxs,
            idm::GUC_MAX_CONTEXT_ID - pf_ctxs
        );

        inner.configs[PFID as usize].begin_ctx = 0;
        inner.configs[PFID as usize].num_ctxs = pf_ctxs;
    }

    // =====================================================================
    // KLV push helpers
    // =====================================================================

    fn push_blob(&self, vfid: u32, words: &[u32]) -> IovResult<()> {
        let buf = self.guc.alloc_buf(words.len())?;
        buf.write(words);
        let req = actions::update_vf_cfg_request(vfid, buf.gpu_addr, words.len() as u32);
        let parsed = send_looped(self.guc.as_ref(), &req)?;
        let num_klvs = klv::count_klvs(words)?;
        if parsed == 0 {
            return Err(IovError::errno(libc::ENOKEY));
        }
        if parsed != num_klvs {
            return Err(IovError::Proto);
        }
        Ok(())
    }

    fn push_klv32(&self, vfid: u32, key: u16, value: u32) -> IovResult<()> {
        let mut w = KlvWriter::new();
        w.push_u32(key, value);
        self.push_blob(vfid, w.as_slice())
    }

    fn push_klv64(&self, vfid: u32, key: u16, value: u64) -> IovResult<()> {
        let mut w = KlvWriter::new();
        w.push_u64(key, value);
        self.push_blob(vfid, w.as_slice())
    }

    fn push_ggtt(&self, vfid: u32, start: u64, size: u64) -> IovResult<()> {
        self.push_klv64(vfid, klv::VF_CFG_GGTT_SIZE_KEY, size)?;
        self.push_klv64(vfid, klv::VF_CFG_GGTT_START_KEY, start)
    }

    fn push_ctxs(&self, vfid: u32, begin: u32, num: u32) -> IovResult<()> {
        self.push_klv32(vfid, klv::VF_CFG_BEGIN_CONTEXT_ID_KEY, begin)?;
        self.push_klv32(vfid, klv::VF_CFG_NUM_CONTEXTS_KEY, num)
    }

    fn push_dbs(&self, vfid: u32, begin: u32, num: u32) -> IovResult<()> {
        self.push_klv32(vfid, klv::VF_CFG_BEGIN_DOORBELL_ID_KEY, begin)?;
        self.push_klv32(vfid, klv::VF_CFG_NUM_DOORBELLS_KEY, num)
    }

    fn push_policy_klv32(&self, key: u16, value: u32) -> IovResult<()> {
        let mut w = KlvWriter::new();
        w.push_u32(key, value);
        let words = w.finish();
        let buf = self.guc.alloc_buf(words.len())?;
        buf.write(&words);
        let req = actions::update_policy_request(buf.gpu_addr, words.len() as u32);
        let parsed = send_looped(self.guc.as_ref(), &req)?;
        if parsed == 0 {
            return Err(IovError::errno(libc::ENOKEY));
        }
        if parsed > 1 {
            return Err(IovError::Proto);
        }
        Ok(())
    }

    // =====================================================================
    // GGTT quota
    // =====================================================================

    fn provision_ggtt(&self, inner: &mut ProvInner, id: u32, size: u64) -> IovResult<()> {
        let alignment = self.info.ggtt_alignment;
        let size = size.next_multiple_of(alignment);

        if let Some(node) = inner.configs[id as usize].ggtt_region {
            if size == node.size {
                return Ok(());
            }
            let err = self.push_ggtt(id, 0, 0);
            inner.ggtt.set_space_owner(PFID, &node);
            inner.ggtt.remove(&node);
            inner.configs[id as usize].ggtt_region = None;
            err?;
        }

        if size == 0 {
            return Ok(());
        }
        if size > self.info.ggtt_size {
            return Err(IovError::errno(libc::E2BIG));
        }
        if size > inner.ggtt.largest_hole(inner.spare.ggtt_size) {
            return Err(IovError::Quota);
        }

        let node = inner.ggtt.insert(size, id)?;
        if let Err(err) = self.push_ggtt(id, node.start, node.size) {
            inner.ggtt.set_space_owner(PFID, &node);
            inner.ggtt.remove(&node);
            return Err(err);
        }
        inner.configs[id as usize].ggtt_region = Some(node);

        debug!(
            "VF{} provisioned GGTT {:#x}-{:#x} ({}K)",
            id,
            node.start,
            node.end() - 1,
            node.size / 1024
        );
        Ok(())
    }

    pub fn set_ggtt(&self, id: u32, size: u64) -> IovResult<()> {
        self.assert_vfid(id);
        assert_ne!(id, PFID);

        let mut inner = self.lock();
        let reprovisioning = inner.configs[id as usize].ggtt_region.is_some() || size != 0;
        let res = self.provision_ggtt(&mut inner, id, size);
        match &res {
            Err(err) => error!("Failed to provision VF{id} with {size} of GGTT ({err})"),
            Ok(()) if reprovisioning => inner.auto_mode = false,
            Ok(()) => {}
        }
        res
    }

    #[must_use]
    pub fn get_ggtt(&self, id: u32) -> u64 {
        self.assert_vfid(id);
        self.lock().configs[id as usize]
            .ggtt_region
            .map_or(0, |n| n.size)
    }

    #[must_use]
    pub fn query_free_ggtt(&self) -> u64 {
        let inner = self.lock();
        inner.ggtt.free_space(inner.spare.ggtt_size)
    }

    #[must_use]
    pub fn query_max_ggtt(&self) -> u64 {
        let inner = self.lock();
        inner.ggtt.largest_hole(inner.spare.ggtt_size)
    }

    // =====================================================================
    // Context quota
    // =====================================================================

    fn ctxs_bitmap(inner: &ProvInner) -> RangeBitmap {
        let mut bm = RangeBitmap::new(ctxs_bitmap_total_bits());
        for (id, config) in inner.configs.iter().enumerate() {
            if config.num_ctxs == 0 {
                continue;
            }
            let (start, count) = if id == PFID as usize {
                (0, idm::encode_count_first(config.num_ctxs))
            } else {
                (
                    idm::encode_start_other(config.begin_ctx),
                    idm::encode_count_other(config.num_ctxs),
                )
            };
            bm.set_range(start, count);
        }
        bm
    }

    fn provision_ctxs(&self, inner: &mut ProvInner, id: u32, num_ctxs: u32) -> IovResult<()> {
        if id == PFID {
            return Err(IovError::NotSupported);
        }
        let quota = align_ctxs(id, num_ctxs);
        if quota == inner.configs[id as usize].num_ctxs {
            return Ok(());
        }

        debug!("provisioning VF{id} with {num_ctxs} contexts (aligned to {quota})");

        if inner.configs[id as usize].num_ctxs != 0 {
            inner.configs[id as usize].begin_ctx = 0;
            inner.configs[id as usize].num_ctxs = 0;
            self.push_ctxs(id, 0, 0)?;
        }

        if quota == 0 {
            return Ok(());
        }

        let mut bm = Self::ctxs_bitmap(inner);
        let spare_bits = idm::encode_count_other(
            inner.spare.num_ctxs.next_multiple_of(idm::CTXS_GRANULARITY),
        );
        let index = bm
            .reserve(idm::encode_count_other(quota), spare_bits)
            .map_err(|_| IovError::OutOfSpace("context IDs"))?;
        debug_assert!(index > 0);
        let begin = idm::decode_start_other(index);

        self.push_ctxs(id, begin, quota)?;
        inner.configs[id as usize].begin_ctx = begin;
        inner.configs[id as usize].num_ctxs = quota;
        Ok(())
    }

    pub fn set_ctxs(&self, id: u32, num_ctxs: u32) -> IovResult<()> {
        self.assert_vfid(id);

        let mut inner = self.lock();
        let reprovisioning = inner.configs[id as usize].num_ctxs != 0 || num_ctxs != 0;
        let res = self.provision_ctxs(&mut inner, id, num_ctxs);
        match &res {
            Err(err) => error!("Failed to provision VF{id} with {num_ctxs} contexts ({err})"),
            Ok(()) if reprovisioning => inner.auto_mode = false,
            Ok(()) => {}
        }
        res
    }

    #[must_use]
    pub fn get_ctxs(&self, id: u32) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].num_ctxs
    }

    #[must_use]
    pub fn get_begin_ctx(&self, id: u32) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].begin_ctx
    }

    #[must_use]
    pub fn query_free_ctxs(&self) -> u32 {
        let inner = self.lock();
        idm::decode_count_other(Self::ctxs_bitmap(&inner).total_free(0))
    }

    #[must_use]
    pub fn query_max_ctxs(&self) -> u32 {
        let inner = self.lock();
        idm::decode_count_other(Self::ctxs_bitmap(&inner).largest_free(0))
    }

    // =====================================================================
    // Doorbell quota
    // =====================================================================

    fn dbs_bitmap(inner: &ProvInner) -> RangeBitmap {
        let mut bm = RangeBitmap::new(GUC_NUM_DOORBELLS);
        for config in &inner.configs {
            if config.num_dbs != 0 {
                bm.set_range(config.begin_db, config.num_dbs);
            }
        }
        bm
    }

    fn provision_dbs(&self, inner: &mut ProvInner, id: u32, num_dbs: u32) -> IovResult<()> {
        if num_dbs == inner.configs[id as usize].num_dbs {
            return Ok(());
        }

        debug!("provisioning VF{id} with {num_dbs} doorbells");

        if inner.configs[id as usize].num_dbs != 0 {
            inner.configs[id as usize].begin_db = 0;
            inner.configs[id as usize].num_dbs = 0;
            self.push_dbs(id, 0, 0)?;
        }

        if num_dbs == 0 {
            return Ok(());
        }

        let mut bm = Self::dbs_bitmap(inner);
        let begin = bm
            .reserve(num_dbs, inner.spare.num_dbs)
            .map_err(|_| IovError::OutOfSpace("doorbells"))?;

        self.push_dbs(id, begin, num_dbs)?;
        inner.configs[id as usize].begin_db = begin;
        inner.configs[id as usize].num_dbs = num_dbs;
        Ok(())
    }

    pub fn set_dbs(&self, id: u32, num_dbs: u32) -> IovResult<()> {
        self.assert_vfid(id);

        let mut inner = self.lock();
        let config = &inner.configs[id as usize];
        let reprovisioning = config.num_dbs != 0 || config.begin_db != 0 || num_dbs != 0;
        let res = self.provision_dbs(&mut inner, id, num_dbs);
        match &res {
            Err(err) => error!("Failed to provision VF{id} with {num_dbs} doorbells ({err})"),
            Ok(()) if reprovisioning && id != PFID => inner.auto_mode = false,
            Ok(()) => {}
        }
        res
    }

    #[must_use]
    pub fn get_dbs(&self, id: u32) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].num_dbs
    }

    #[must_use]
    pub fn query_free_dbs(&self) -> u32 {
        Self::dbs_bitmap(&self.lock()).total_free(0)
    }

    #[must_use]
    pub fn query_max_dbs(&self) -> u32 {
        Self::dbs_bitmap(&self.lock()).largest_free(0)
    }

    // =====================================================================
    // LMEM quota
    // =====================================================================

    fn provision_lmem(&self, inner: &mut ProvInner, id: u32, size: u64) -> IovResult<()> {
        let Some(lmem_total) = self.info.lmem_size else {
            return if size == 0 {
                Ok(())
            } else {
                Err(IovError::NotSupported)
            };
        };
        let size = size.next_multiple_of(SZ_2M);

        if let Some(obj) = inner.configs[id as usize].lmem_obj.take() {
            if size == obj.size {
                inner.configs[id as usize].lmem_obj = Some(obj);
                return Ok(());
            }
            inner.lmem_used -= obj.size;
            self.push_klv64(id, klv::VF_CFG_LMEM_SIZE_KEY, 0)?;
        }

        if size == 0 {
            return Ok(());
        }
        if size > lmem_total - inner.lmem_used - inner.spare.lmem_size {
            return Err(IovError::Quota);
        }

        if let Err(err) = self.push_klv64(id, klv::VF_CFG_LMEM_SIZE_KEY, size) {
            return Err(err);
        }
        inner.configs[id as usize].lmem_obj = Some(LmemObj { size });
        inner.lmem_used += size;

        debug!("VF{} LMEM {} ({}M)", id, size, size / SZ_2M * 2);
        Ok(())
    }

    pub fn set_lmem(&self, id: u32, size: u64) -> IovResult<()> {
        self.assert_vfid(id);
        assert_ne!(id, PFID);

        let mut inner = self.lock();
        let reprovisioning = inner.configs[id as usize].lmem_obj.is_some() || size != 0;
        let res = self.provision_lmem(&mut inner, id, size);
        match &res {
            Err(err) => error!("Failed to provision VF{id} with {size} of LMEM ({err})"),
            Ok(()) if reprovisioning => inner.auto_mode = false,
            Ok(()) => {}
        }
        res
    }

    #[must_use]
    pub fn get_lmem(&self, id: u32) -> u64 {
        self.assert_vfid(id);
        self.lock().configs[id as usize]
            .lmem_obj
            .as_ref()
            .map_or(0, |o| o.size)
    }

    // =====================================================================
    // Scheduling knobs and thresholds
    // =====================================================================

    pub fn set_exec_quantum(&self, id: u32, exec_quantum: u32) -> IovResult<()> {
        self.assert_vfid(id);
        let mut inner = self.lock();
        if exec_quantum == inner.configs[id as usize].exec_quantum {
            return Ok(());
        }
        self.push_klv32(id, klv::VF_CFG_EXEC_QUANTUM_KEY, exec_quantum)?;
        inner.configs[id as usize].exec_quantum = exec_quantum;
        if exec_quantum != 0 && id != PFID {
            inner.auto_mode = false;
        }
        Ok(())
    }

    #[must_use]
    pub fn get_exec_quantum(&self, id: u32) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].exec_quantum
    }

    pub fn set_preempt_timeout(&self, id: u32, preempt_timeout: u32) -> IovResult<()> {
        self.assert_vfid(id);
        let mut inner = self.lock();
        if preempt_timeout == inner.configs[id as usize].preempt_timeout {
            return Ok(());
        }
        self.push_klv32(id, klv::VF_CFG_PREEMPT_TIMEOUT_KEY, preempt_timeout)?;
        inner.configs[id as usize].preempt_timeout = preempt_timeout;
        if preempt_timeout != 0 && id != PFID {
            inner.auto_mode = false;
        }
        Ok(())
    }

    #[must_use]
    pub fn get_preempt_timeout(&self, id: u32) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].preempt_timeout
    }

    pub fn set_sched_priority(&self, id: u32, priority: SchedPriority) -> IovResult<()> {
        self.assert_vfid(id);
        let mut inner = self.lock();
        if priority == inner.configs[id as usize].sched_priority {
            return Ok(());
        }
        self.push_klv32(id, klv::VF_CFG_SCHED_PRIORITY_KEY, priority as u32)?;
        inner.configs[id as usize].sched_priority = priority;
        Ok(())
    }

    #[must_use]
    pub fn get_sched_priority(&self, id: u32) -> SchedPriority {
        self.assert_vfid(id);
        self.lock().configs[id as usize].sched_priority
    }

    pub fn set_threshold(&self, id: u32, threshold: Threshold, value: u32) -> IovResult<()> {
        self.assert_vfid(id);
        let mut inner = self.lock();
        if value == inner.configs[id as usize].thresholds[threshold.index()] {
            return Ok(());
        }
        self.push_klv32(id, threshold.klv_key(), value)?;
        inner.configs[id as usize].thresholds[threshold.index()] = value;
        debug!("VF{} threshold {}={}", id, threshold.name(), value);
        Ok(())
    }

    #[must_use]
    pub fn get_threshold(&self, id: u32, threshold: Threshold) -> u32 {
        self.assert_vfid(id);
        self.lock().configs[id as usize].thresholds[threshold.index()]
    }

    // =====================================================================
    // Policies
    // =====================================================================

    pub fn set_sched_if_idle(&self, enable: bool) -> IovResult<()> {
        let mut inner = self.lock();
        self.push_policy_klv32(klv::VGT_POLICY_SCHED_IF_IDLE_KEY, enable as u32)?;
        inner.policies.sched_if_idle = enable;
        Ok(())
    }

    pub fn set_reset_engine(&self, enable: bool) -> IovResult<()> {
        let mut inner = self.lock();
        self.push_policy_klv32(klv::VGT_POLICY_RESET_AFTER_VF_SWITCH_KEY, enable as u32)?;
        inner.policies.reset_engine = enable;
        Ok(())
    }

    pub fn set_sample_period(&self, value: u32) -> IovResult<()> {
        let mut inner = self.lock();
        self.push_policy_klv32(klv::VGT_POLICY_ADVERSE_SAMPLE_PERIOD_KEY, value)?;
        inner.policies.sample_period = value;
        Ok(())
    }

    #[must_use]
    pub fn policies(&self) -> Policies {
        self.lock().policies
    }

    // =====================================================================
    // Spare knobs
    // =====================================================================

    pub fn set_spare_ggtt(&self, size: u64) -> IovResult<()> {
        if size != 0 && size < self.info.ggtt_alignment {
            return Err(IovError::errno(libc::EINVAL));
        }
        self.lock().spare.ggtt_size = size.next_multiple_of(self.info.ggtt_alignment);
        Ok(())
    }

    pub fn set_spare_ctxs(&self, spare: u32) -> IovResult<()> {
        if spare > idm::GUC_MAX_CONTEXT_ID {
            return Err(IovError::errno(libc::EINVAL));
        }
        if spare != 0 && spare < MIN_SPARE_CTXS {
            return Err(IovError::errno(libc::EINVAL));
        }
        self.lock().spare.num_ctxs = spare;
        Ok(())
    }

    pub fn set_spare_dbs(&self, spare: u32) -> IovResult<()> {
        if spare > GUC_NUM_DOORBELLS {
            return Err(IovError::errno(libc::EINVAL));
        }
        if spare != 0 && spare < MIN_SPARE_DBS {
            return Err(IovError::errno(libc::EINVAL));
        }
        self.lock().spare.num_dbs = spare;
        Ok(())
    }

    pub fn set_spare_lmem(&self, size: u64) -> IovResult<()> {
        if size != 0 && size < MIN_SPARE_LMEM {
            return Err(IovError::errno(libc::EINVAL));
        }
        self.lock().spare.lmem_size = size.next_multiple_of(SZ_2M);
        Ok(())
    }

    #[must_use]
    pub fn spare(&self) -> Spare {
        self.lock().spare
    }

    // =====================================================================
    // Auto-provisioning
    // =====================================================================

    fn auto_provision_ggtt(&self, inner: &mut ProvInner, num_vfs: u32) -> IovResult<()> {
        let alignment = self.info.ggtt_alignment;
        let spare = inner.spare.ggtt_size;
        let free = inner.ggtt.free_space(spare);
        let available = inner.ggtt.largest_hole(spare);

        // Use the largest block so all VF allocations are sure to fit.
        let mut fair = (available / num_vfs as u64) & !(alignment - 1);

        // With no explicit spare the PF would end up with only the
        // leftover; give it an equal share instead.
        if spare == 0 {
            let leftover = free - fair * num_vfs as u64;
            if leftover < fair {
                fair = (available / (1 + num_vfs) as u64) & !(alignment - 1);
            }
        }

        debug!("GGTT available({available}/{free}) fair({num_vfs} x {fair})");
        if fair == 0 {
            return Err(IovError::OutOfSpace("GGTT"));
        }

        for n in 1..=num_vfs {
            if inner.configs[n as usize].ggtt_region.is_some() {
                return Err(IovError::errno(libc::EUCLEAN));
            }
            self.provision_ggtt(inner, n, fair)?;
        }
        Ok(())
    }

    fn auto_provision_ctxs(&self, inner: &mut ProvInner, num_vfs: u32) -> IovResult<()> {
        let available = idm::decode_count_other(
            Self::ctxs_bitmap(inner).total_free(idm::encode_count_other(
                inner.spare.num_ctxs.next_multiple_of(idm::CTXS_GRANULARITY),
            )),
        );
        let fair = (available / num_vfs) / idm::CTXS_GRANULARITY * idm::CTXS_GRANULARITY;
        if fair == 0 {
            return Err(IovError::OutOfSpace("context IDs"));
        }

        debug!("contexts available({available}) fair({num_vfs} x {fair})");

        for n in 1..=num_vfs {
            if inner.configs[n as usize].num_ctxs != 0 {
                return Err(IovError::errno(libc::EUCLEAN));
            }
            self.provision_ctxs(inner, n, fair)?;
        }
        Ok(())
    }

    fn auto_provision_dbs(&self, inner: &mut ProvInner, num_vfs: u32) -> IovResult<()> {
        let available = Self::dbs_bitmap(inner).total_free(inner.spare.num_dbs);
        let fair = available / num_vfs;
        debug!("doorbells available({available}) fair({num_vfs} x {fair})");
        if fair == 0 {
            return Err(IovError::OutOfSpace("doorbells"));
        }

        for n in 1..=num_vfs {
            let config = &inner.configs[n as usize];
            if config.num_dbs != 0 || config.begin_db != 0 {
                return Err(IovError::errno(libc::EUCLEAN));
            }
            self.provision_dbs(inner, n, fair)?;
        }
        Ok(())
    }

    fn auto_provision_lmem(&self, inner: &mut ProvInner, num_vfs: u32) -> IovResult<()> {
        let Some(lmem_total) = self.info.lmem_size else {
            return Ok(());
        };
        let available = lmem_total - inner.lmem_used - inner.spare.lmem_size;
        let fair = (available / num_vfs as u64) & !(SZ_2M - 1);
        debug!("LMEM available({available}) fair({num_vfs} x {fair})");
        if fair == 0 {
            return Err(IovError::OutOfSpace("LMEM"));
        }

        for n in 1..=num_vfs {
            if inner.configs[n as usize].lmem_obj.is_some() {
                return Err(IovError::errno(libc::EUCLEAN));
            }
            self.provision_lmem(inner, n, fair)?;
        }
        Ok(())
    }

    fn unprovision_config(&self, inner: &mut ProvInner, id: u32) {
        let _ = self.provision_ggtt(inner, id, 0);
        let _ = self.provision_ctxs(inner, id, 0);
        let _ = self.provision_dbs(inner, id, 0);
        let _ = self.provision_lmem(inner, id, 0);
        let _ = self.push_klv32(id, klv::VF_CFG_EXEC_QUANTUM_KEY, 0);
        inner.configs[id as usize].exec_quantum = 0;
        let _ = self.push_klv32(id, klv::VF_CFG_PREEMPT_TIMEOUT_KEY, 0);
        inner.configs[id as usize].preempt_timeout = 0;
        for t in Threshold::ALL {
            if inner.configs[id as usize].thresholds[t.index()] != 0 {
                let _ = self.push_klv32(id, t.klv_key(), 0);
                inner.configs[id as usize].thresholds[t.index()] = 0;
            }
        }
    }

    fn unprovision_all(&self, inner: &mut ProvInner) {
        for n in (1..=self.info.total_vfs).rev() {
            self.unprovision_config(inner, n);
        }
    }

    /// Fairly partition every resource across `num_vfs` VFs, or release all
    /// automatic allocations when `num_vfs` is zero. Any failure rolls back
    /// every allocation made by this call.
    pub fn auto_provision(&self, num_vfs: u32) -> IovResult<()> {
        assert!(num_vfs <= self.info.total_vfs);

        let mut inner = self.lock();
        if num_vfs == 0 {
            if inner.auto_mode {
                self.unprovision_all(&mut inner);
            }
            inner.auto_mode = false;
            return Ok(());
        }

        inner.auto_mode = true;
        let res = self
            .auto_provision_ggtt(&mut inner, num_vfs)
            .and_then(|()| self.auto_provision_ctxs(&mut inner, num_vfs));
        let res = res.and_then(|()| self.auto_provision_dbs(&mut inner, num_vfs));
        let res = res.and_then(|()| self.auto_provision_lmem(&mut inner, num_vfs));

        if let Err(err) = &res {
            error!("Failed to auto provision {num_vfs} VFs ({err})");
            self.unprovision_all(&mut inner);
            inner.auto_mode = false;
        }
        res
    }

    // =====================================================================
    // Verify / push / restart
    // =====================================================================

    fn validate_config(&self, inner: &ProvInner, id: u32) -> Result<(), bool> {
        let config = &inner.configs[id as usize];
        let valid_ggtt = config.ggtt_region.is_some();
        let valid_ctxs = config.num_ctxs != 0;
        let valid_lmem = self.info.lmem_size.is_none() || config.lmem_obj.is_some();
        let valid_any = valid_ggtt || valid_ctxs || config.num_dbs != 0;
        // Doorbells are never required.
        let valid_all = valid_ggtt && valid_ctxs && valid_lmem;

        if valid_all { Ok(()) } else { Err(valid_any) }
    }

    /// Check that the first `num_vfs` configurations are usable.
    #[must_use]
    pub fn verify(&self, num_vfs: u32) -> ProvisioningStatus {
        let inner = self.lock();
        let mut num_valid = 0;
        let mut num_empty = 0;
        for n in 1..=num_vfs {
            match self.validate_config(&inner, n) {
                Ok(()) => num_valid += 1,
                Err(false) => num_empty += 1,
                Err(true) => {}
            }
        }
        debug!(
            "found valid({}) invalid({}) empty({}) configs",
            num_valid,
            num_vfs - num_valid,
            num_empty
        );
        if num_empty == num_vfs {
            ProvisioningStatus::Empty
        } else if num_valid + num_empty != num_vfs {
            ProvisioningStatus::PartiallyProvisioned
        } else {
            ProvisioningStatus::Provisioned
        }
    }

    fn push_configs(&self, inner: &mut ProvInner, num: u32) -> IovResult<()> {
        let buf = self.guc.alloc_buf(PUSH_BUF_DWORDS)?;

        for n in 1..=num {
            if matches!(self.validate_config(inner, n), Err(false)) {
                continue;
            }
            let words = inner.configs[n as usize].encode();
            debug_assert!(words.len() <= PUSH_BUF_DWORDS);
            klv::count_klvs(&words)?;
            buf.write(&words);
            let req = actions::update_vf_cfg_request(n, buf.gpu_addr, words.len() as u32);
            send_looped(self.guc.as_ref(), &req)?;
        }
        inner.num_pushed = num;
        Ok(())
    }

    fn push_no_configs(&self, inner: &mut ProvInner) -> IovResult<()> {
        let mut n = inner.num_pushed;
        while n > 0 {
            let req = actions::update_vf_cfg_request(n, 0, 0);
            if send_looped(self.guc.as_ref(), &req).is_err() {
                break;
            }
            n -= 1;
        }
        inner.num_pushed = n;
        if n != 0 {
            return Err(IovError::errno(libc::ESTALE));
        }
        Ok(())
    }

    /// Push consolidated configs for the first `num` VFs, or reset the
    /// previously pushed ones when `num` is zero.
    pub fn push(&self, num: u32) -> IovResult<()> {
        assert!(num <= self.info.total_vfs);
        let mut inner = self.lock();
        if num != 0 {
            self.push_configs(&mut inner, num)
        } else {
            self.push_no_configs(&mut inner)
        }
    }

    /// Re-push reset followed by the full record, used after a GuC reset.
    pub fn refresh(&self, vfid: u32) -> IovResult<()> {
        self.assert_vfid(vfid);
        assert_ne!(vfid, PFID);
        let inner = self.lock();

        let req = actions::update_vf_cfg_request(vfid, 0, 0);
        send_looped(self.guc.as_ref(), &req)?;

        let words = inner.configs[vfid as usize].encode();
        let buf = self.guc.alloc_buf(words.len())?;
        buf.write(&words);
        let req = actions::update_vf_cfg_request(vfid, buf.gpu_addr, words.len() as u32);
        send_looped(self.guc.as_ref(), &req)?;
        Ok(())
    }

    /// Invalidate the pushed watermark; the reprovisioning worker calls
    /// [`Provisioning::reprovision_all`] afterwards.
    pub fn restart(&self) {
        self.lock().num_pushed = 0;
    }

    /// Worker body: re-push policies, PF quotas and every enabled VF config.
    pub fn reprovision_all(&self, num_vfs: u32) {
        debug!("GT{}: reprovisioning PF", self.info.gt_id);
        {
            let inner = self.lock();
            let policies = inner.policies;
            let pf = inner.configs[PFID as usize].clone();
            drop(inner);

            let _ = self.push_policy_klv32(
                klv::VGT_POLICY_SCHED_IF_IDLE_KEY,
                policies.sched_if_idle as u32,
            );
            let _ = self.push_policy_klv32(
                klv::VGT_POLICY_RESET_AFTER_VF_SWITCH_KEY,
                policies.reset_engine as u32,
            );
            let _ = self
                .push_policy_klv32(klv::VGT_POLICY_ADVERSE_SAMPLE_PERIOD_KEY, policies.sample_period);
            let _ = self.push_klv32(PFID, klv::VF_CFG_EXEC_QUANTUM_KEY, pf.exec_quantum);
            let _ = self.push_klv32(PFID, klv::VF_CFG_PREEMPT_TIMEOUT_KEY, pf.preempt_timeout);
        }

        if num_vfs != 0 {
            debug!("GT{}: reprovisioning {} VFs", self.info.gt_id, num_vfs);
            if let Err(err) = self.push(num_vfs) {
                error!("Failed to push configurations ({err})");
            }
        }
    }

    // =====================================================================
    // Release / FLR integration
    // =====================================================================

    /// Push an empty config and drop every resource of `vfid`.
    pub fn clear(&self, vfid: u32) -> IovResult<()> {
        self.assert_vfid(vfid);
        assert_ne!(vfid, PFID);

        let mut inner = self.lock();
        let req = actions::update_vf_cfg_request(vfid, 0, 0);
        send_looped(self.guc.as_ref(), &req)?;
        self.unprovision_config(&mut inner, vfid);
        Ok(())
    }

    /// FLR finalization: every PTE of the VF's GGTT block goes back to the
    /// PF without releasing the block itself.
    pub fn clear_vf_ggtt_owner(&self, vfid: u32) {
        self.assert_vfid(vfid);
        let mut inner = self.lock();
        if let Some(node) = inner.configs[vfid as usize].ggtt_region {
            inner.ggtt.set_space_owner(PFID, &node);
        }
    }

    #[must_use]
    pub fn ggtt_node(&self, vfid: u32) -> Option<GgttNode> {
        self.lock().configs[vfid as usize].ggtt_region
    }

    #[must_use]
    pub fn ggtt_owner_of(&self, addr: u64) -> u32 {
        self.lock().ggtt.owner_of(addr)
    }

    #[must_use]
    pub fn config(&self, vfid: u32) -> VfConfig {
        self.assert_vfid(vfid);
        self.lock().configs[vfid as usize].clone()
    }

    // =====================================================================
    // Printers (debugfs data contract)
    // =====================================================================

    pub fn print_ggtt(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let inner = self.lock();
        for (n, config) in inner.configs.iter().enumerate().skip(1) {
            if let Some(node) = &config.ggtt_region {
                writeln!(
                    w,
                    "VF{}:\t{:#08x}-{:#08x}\t({}K)",
                    n,
                    node.start,
                    node.end() - 1,
                    node.size / 1024
                )?;
            }
        }
        Ok(())
    }

    pub fn print_ctxs(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let inner = self.lock();
        for (n, config) in inner.configs.iter().enumerate().skip(1) {
            if config.num_ctxs != 0 {
                writeln!(
                    w,
                    "VF{}:\t{}-{}\t({})",
                    n,
                    config.begin_ctx,
                    config.begin_ctx + config.num_ctxs - 1,
                    config.num_ctxs
                )?;
            }
        }
        Ok(())
    }

    pub fn print_dbs(&self, w: &mut dyn std::fmt::Write) -> std::fmt::Result {
        let inner = self.lock();
        for (n, config) in inner.configs.iter().enumerate().skip(1) {
            if config.num_dbs != 0 {
                writeln!(
                    w,
                    "VF{}:\t{}-{}\t({})",
                    n,
                    config.begin_db,
                    config.begin_db + config.num_dbs - 1,
                    config.num_dbs
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guc::hxg;
    use crate::guc::transport::testing::ScriptedGuc;
    use crate::pf::ggtt::SZ_64K;

    const SZ_1G: u64 = 0x4000_0000;
    const SZ_64M: u64 = 0x400_0000;

    fn gt_info() -> GtInfo {
        GtInfo {
            gt_id: 0,
            is_media: false,
            total_vfs: 4,
            ggtt_wopcm: 0,
            ggtt_size: SZ_1G,
            ggtt_alignment: SZ_64K,
            lmem_size: None,
            has_media_gt: false,
        }
    }

    fn provisioning() -> (Provisioning, Arc<ScriptedGuc>) {
        let guc = ScriptedGuc::new();
        let prov = Provisioning::new(gt_info(), guc.clone());
        prov.init_pf();
        (prov, guc)
    }

    #[test]
    fn pf_gets_fixed_ctx_slice() {
        let (prov, _guc) = provisioning();
        // 512 bits total, 4 VFs: PF keeps 512 - (512/5)*4 = 104 bits.
        assert_eq!(prov.get_ctxs(PFID), idm::decode_count_first(104));
        assert_eq!(prov.get_begin_ctx(PFID), 0);
    }

    #[test]
    fn set_ctxs_twice_second_is_noop() {
        let (prov, guc) = provisioning();
        prov.set_ctxs(1, 128).unwrap();
        let pushes = guc.sent().len();
        prov.set_ctxs(1, 128).unwrap();
        assert_eq!(guc.sent().len(), pushes);
    }

    #[test]
    fn release_then_set_matches_fresh_set() {
        let (prov, guc) = provisioning();
        prov.set_ctxs(1, 256).unwrap();
        let fresh = guc.pushed_cfg_blobs(1);

        prov.set_ctxs(1, 0).unwrap();
        guc.clear_sent();
        prov.set_ctxs(1, 256).unwrap();
        let again = guc.pushed_cfg_blobs(1);
        assert_eq!(fresh, again);
    }

    #[test]
    fn ctx_ranges_are_disjoint() {
        let (prov, _guc) = provisioning();
        for id in 1..=4 {
            prov.set_ctxs(id, 1024).unwrap();
        }
        let mut ranges: Vec<(u32, u32)> = (0..=4u32)
            .map(|id| (prov.get_begin_ctx(id), prov.get_ctxs(id)))
            .collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(
                pair[0].0 + pair[0].1 <= pair[1].0,
                "overlap: {pair:?}"
            );
        }
    }

    #[test]
    fn push_failure_leaves_record_empty() {
        let (prov, guc) = provisioning();
        guc.fail_with(61);
        assert!(prov.set_ctxs(1, 128).is_err());
        guc.recover();
        assert_eq!(prov.get_ctxs(1), 0);
        assert_eq!(prov.get_begin_ctx(1), 0);
    }

    #[test]
    fn ggtt_set_and_release() {
        let (prov, _guc) = provisioning();
        prov.set_ggtt(1, SZ_64M).unwrap();
        assert_eq!(prov.get_ggtt(1), SZ_64M);
        let node = prov.ggtt_node(1).unwrap();
        assert_eq!(prov.ggtt_owner_of(node.start), 1);

        prov.set_ggtt(1, 0).unwrap();
        assert_eq!(prov.get_ggtt(1), 0);
    }

    #[test]
    fn ggtt_rejects_oversize() {
        let (prov, _guc) = provisioning();
        assert!(matches!(prov.set_ggtt(1, 2 * SZ_1G), Err(IovError::Errno(_))));
        assert!(matches!(prov.set_ggtt(1, SZ_1G), Err(IovError::Quota)));
    }

    #[test]
    fn auto_provision_fair_ggtt_with_spare() {
        let (prov, _guc) = provisioning();
        prov.set_spare_ggtt(SZ_64M).unwrap();
        prov.auto_provision(4).unwrap();

        let fair = (SZ_1G - SZ_64M) / 4;
        for id in 1..=4 {
            assert_eq!(prov.get_ggtt(id), fair & !(SZ_64K - 1));
            assert!(prov.get_ctxs(id) > 0);
            assert!(prov.get_dbs(id) > 0);
        }
        assert_eq!(prov.verify(4), ProvisioningStatus::Provisioned);
    }

    #[test]
    fn auto_provision_all_vfs_succeeds_when_one_does() {
        let (prov, _guc) = provisioning();
        prov.auto_provision(1).unwrap();
        prov.auto_provision(0).unwrap();
        prov.auto_provision(4).unwrap();
        assert_eq!(prov.verify(4), ProvisioningStatus::Provisioned);
    }

    #[test]
    fn auto_provision_rolls_back_on_failure() {
        let (prov, guc) = provisioning();
        // Let GGTT provisioning pass, then fail the first ctx push.
        // 8 pushes for 4 VFs' GGTT (size+start each).
        for _ in 0..8 {
            guc.push_reply(Ok(1));
        }
        guc.push_reply(Err(IovError::Guc { code: 22, hint: 0 }));
        assert!(prov.auto_provision(4).is_err());
        for id in 1..=4 {
            assert_eq!(prov.get_ggtt(id), 0, "VF{id} GGTT leaked");
            assert_eq!(prov.get_ctxs(id), 0, "VF{id} ctxs leaked");
        }
        assert_eq!(prov.verify(4), ProvisioningStatus::Empty);
    }

    #[test]
    fn verify_reports_partial() {
        let (prov, _guc) = provisioning();
        assert_eq!(prov.verify(4), ProvisioningStatus::Empty);
        prov.set_ctxs(1, 128).unwrap();
        assert_eq!(prov.verify(4), ProvisioningStatus::PartiallyProvisioned);
        prov.set_ggtt(1, SZ_64M).unwrap();
        // VF1 complete, VFs 2-4 empty: still a valid (sparse) population.
        assert_eq!(prov.verify(4), ProvisioningStatus::Provisioned);
    }

    #[test]
    fn push_emits_consolidated_blob_per_vf() {
        let (prov, guc) = provisioning();
        prov.set_ggtt(1, SZ_64M).unwrap();
        prov.set_ctxs(1, 128).unwrap();
        guc.clear_sent();

        prov.push(1).unwrap();
        let blobs = guc.pushed_cfg_blobs(1);
        assert_eq!(blobs.len(), 1);
        let decoded = VfConfig::decode(&blobs[0]).unwrap();
        assert_eq!(decoded.num_ctxs, 128);
        assert_eq!(decoded.ggtt_region.unwrap().size, SZ_64M);
    }

    #[test]
    fn push_zero_resets_pushed_configs() {
        let (prov, guc) = provisioning();
        prov.set_ctxs(1, 128).unwrap();
        prov.push(1).unwrap();
        guc.clear_sent();

        prov.push(0).unwrap();
        let sent = guc.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(hxg::action(sent[0][0]), actions::PF2GUC_UPDATE_VF_CFG);
        assert_eq!(sent[0][4], 0); // zero dwords: reset
    }

    #[test]
    fn clear_releases_everything() {
        let (prov, _guc) = provisioning();
        prov.set_ggtt(2, SZ_64M).unwrap();
        prov.set_ctxs(2, 128).unwrap();
        prov.set_dbs(2, 8).unwrap();
        prov.set_threshold(2, Threshold::CatErr, 10).unwrap();

        prov.clear(2).unwrap();
        let cfg = prov.config(2);
        assert!(cfg.is_empty());
        assert_eq!(cfg.threshold(Threshold::CatErr), 0);
    }

    #[test]
    fn lmem_only_on_discrete() {
        let (prov, _guc) = provisioning();
        assert!(matches!(prov.set_lmem(1, SZ_2M), Err(IovError::NotSupported)));

        let guc = ScriptedGuc::new();
        let mut info = gt_info();
        info.lmem_size = Some(SZ_1G);
        let prov = Provisioning::new(info, guc);
        prov.init_pf();
        prov.set_lmem(1, 3 * SZ_2M - 1).unwrap();
        assert_eq!(prov.get_lmem(1), 3 * SZ_2M);
        prov.set_lmem(1, 0).unwrap();
        assert_eq!(prov.get_lmem(1), 0);
    }

    #[test]
    fn spare_rejects_below_minimum() {
        let (prov, _guc) = provisioning();
        assert!(prov.set_spare_ctxs(1).is_err());
        assert!(prov.set_spare_ctxs(0).is_ok());
        assert!(prov.set_spare_ctxs(2 * idm::CTXS_GRANULARITY).is_ok());
    }
}
