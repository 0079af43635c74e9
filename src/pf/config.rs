//! Per-VF provisioning record.
//!
//! One record exists for every VFID plus one for the PF itself (entry 0).
//! Records own the ranges allocated for them; releasing a resource both
//! frees the range and pushes a zero-size KLV so the GuC drops its copy.

use crate::error::{IovError, IovResult};
use crate::guc::klv::{self, Klv, KlvIter, KlvWriter};
use crate::pf::ggtt::GgttNode;

/// VFID 0 is the PF itself.
pub const PFID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    CatErr,
    EngineReset,
    PageFault,
    H2gStorm,
    IrqStorm,
    DoorbellStorm,
}

pub const NUM_THRESHOLDS: usize = 6;

impl Threshold {
    pub const ALL: [Self; NUM_THRESHOLDS] = [
        Self::CatErr,
        Self::EngineReset,
        Self::PageFault,
        Self::H2gStorm,
        Self::IrqStorm,
        Self::DoorbellStorm,
    ];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::CatErr => 0,
            Self::EngineReset => 1,
            Self::PageFault => 2,
            Self::H2gStorm => 3,
            Self::IrqStorm => 4,
            Self::DoorbellStorm => 5,
        }
    }

    #[must_use]
    pub const fn klv_key(self) -> u16 {
        match self {
            Self::CatErr => klv::VF_CFG_THRESHOLD_CAT_ERR_KEY,
            Self::EngineReset => klv::VF_CFG_THRESHOLD_ENGINE_RESET_KEY,
            Self::PageFault => klv::VF_CFG_THRESHOLD_PAGE_FAULT_KEY,
            Self::H2gStorm => klv::VF_CFG_THRESHOLD_H2G_STORM_KEY,
            Self::IrqStorm => klv::VF_CFG_THRESHOLD_IRQ_STORM_KEY,
            Self::DoorbellStorm => klv::VF_CFG_THRESHOLD_DOORBELL_STORM_KEY,
        }
    }

    #[must_use]
    pub fn from_klv_key(key: u16) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.klv_key() == key)
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::CatErr => "cat_error",
            Self::EngineReset => "engine_reset",
            Self::PageFault => "page_fault",
            Self::H2gStorm => "h2g_storm",
            Self::IrqStorm => "irq_storm",
            Self::DoorbellStorm => "doorbell_storm",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.name() == name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum SchedPriority {
    #[default]
    Low = 0,
    Normal = 1,
    High = 2,
}

impl SchedPriority {
    #[must_use]
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Self::Low),
            1 => Some(Self::Normal),
            2 => Some(Self::High),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

/// Pinned VRAM backing a VF's LMEM quota. Dropping the handle unpins it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmemObj {
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VfConfig {
    pub ggtt_region: Option<GgttNode>,
    pub begin_ctx: u32,
    pub num_ctxs: u32,
    pub begin_db: u32,
    pub num_dbs: u32,
    /// Milliseconds; 0 means infinity.
    pub exec_quantum: u32,
    /// Microseconds; 0 means infinity.
    pub preempt_timeout: u32,
    pub sched_priority: SchedPriority,
    pub lmem_obj: Option<LmemObj>,
    pub thresholds: [u32; NUM_THRESHOLDS],
}

impl VfConfig {
    #[must_use]
    pub fn threshold(&self, t: Threshold) -> u32 {
        self.thresholds[t.index()]
    }

    /// Mandatory resources are GGTT and contexts; doorbells and LMEM are
    /// optional extras.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.ggtt_region.is_some() && self.num_ctxs != 0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ggtt_region.is_none()
            && self.num_ctxs == 0
            && self.begin_ctx == 0
            && self.num_dbs == 0
            && self.begin_db == 0
            && self.lmem_obj.is_none()
    }

    /// Emit every populated field as one consolidated KLV blob. An
    /// unallocated GGTT region is skipped entirely.
    #[must_use]
    pub fn encode(&self) -> Vec<u32> {
        let mut w = KlvWriter::new();

        if let Some(node) = &self.ggtt_region {
            w.push_u64(klv::VF_CFG_GGTT_START_KEY, node.start);
            w.push_u64(klv::VF_CFG_GGTT_SIZE_KEY, node.size);
        }

        w.push_u32(klv::VF_CFG_BEGIN_CONTEXT_ID_KEY, self.begin_ctx);
        w.push_u32(klv::VF_CFG_NUM_CONTEXTS_KEY, self.num_ctxs);

        w.push_u32(klv::VF_CFG_BEGIN_DOORBELL_ID_KEY, self.begin_db);
        w.push_u32(klv::VF_CFG_NUM_DOORBELLS_KEY, self.num_dbs);

        if let Some(lmem) = &self.lmem_obj {
            w.push_u64(klv::VF_CFG_LMEM_SIZE_KEY, lmem.size);
        }

        w.push_u32(klv::VF_CFG_EXEC_QUANTUM_KEY, self.exec_quantum);
        w.push_u32(klv::VF_CFG_PREEMPT_TIMEOUT_KEY, self.preempt_timeout);
        w.push_u32(klv::VF_CFG_SCHED_PRIORITY_KEY, self.sched_priority as u32);

        for t in Threshold::ALL {
            w.push_u32(t.klv_key(), self.threshold(t));
        }

        w.finish()
    }

    /// Rebuild a record from a blob of defined keys. Inverse of
    /// [`VfConfig::encode`] for every key the codec defines.
    pub fn decode(words: &[u32]) -> IovResult<Self> {
        let mut cfg = Self::default();
        let mut ggtt_start = None;
        let mut ggtt_size = None;

        for entry in KlvIter::new(words) {
            let entry: Klv<'_> = entry?;
            match entry.key {
                klv::VF_CFG_GGTT_START_KEY => ggtt_start = Some(entry.as_u64()?),
                klv::VF_CFG_GGTT_SIZE_KEY => ggtt_size = Some(entry.as_u64()?),
                klv::VF_CFG_BEGIN_CONTEXT_ID_KEY => cfg.begin_ctx = entry.as_u32()?,
                klv::VF_CFG_NUM_CONTEXTS_KEY => cfg.num_ctxs = entry.as_u32()?,
                klv::VF_CFG_BEGIN_DOORBELL_ID_KEY => cfg.begin_db = entry.as_u32()?,
                klv::VF_CFG_NUM_DOORBELLS_KEY => cfg.num_dbs = entry.as_u32()?,
                klv::VF_CFG_LMEM_SIZE_KEY => {
                    cfg.lmem_obj = Some(LmemObj {
                        size: entry.as_u64()?,
                    });
                }
                klv::VF_CFG_EXEC_QUANTUM_KEY => cfg.exec_quantum = entry.as_u32()?,
                klv::VF_CFG_PREEMPT_TIMEOUT_KEY => cfg.preempt_timeout = entry.as_u32()?,
                klv::VF_CFG_SCHED_PRIORITY_KEY => {
                    cfg.sched_priority = SchedPriority::from_raw(entry.as_u32()?)
                        .ok_or(IovError::MalformedBlob)?;
                }
                key => match Threshold::from_klv_key(key) {
                    Some(t) => cfg.thresholds[t.index()] = entry.as_u32()?,
                    None => return Err(IovError::MalformedBlob),
                },
            }
        }

        if let (Some(start), Some(size)) = (ggtt_start, ggtt_size) {
            cfg.ggtt_region = Some(GgttNode { start, size });
        }
        Ok(cfg)
    }
}
