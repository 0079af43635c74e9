//! Sysfs data contract.
//!
//! Each VF (and the PF) exposes a directory of text attributes plus one
//! binary `state` blob. This module implements the attribute dispatch and
//! the text encoding; actual filesystem plumbing belongs to the caller.

use crate::error::{IovError, IovResult};
use crate::pf::config::{PFID, SchedPriority, Threshold};
use crate::pf::iov::PfDevice;
use crate::pf::state::SAVE_RESTORE_MIN_SIZE;

fn parse_u32(value: &str) -> IovResult<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| IovError::errno(libc::EINVAL))
}

fn parse_u64(value: &str) -> IovResult<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| IovError::errno(libc::EINVAL))
}

/// Read a per-VF (or, for some attributes, per-PF) text attribute.
pub fn vf_attr_show(dev: &PfDevice, vfid: u32, name: &str) -> IovResult<String> {
    let prov = &dev.root_gt().provisioning;
    if let Some(threshold) = name.strip_prefix("threshold/") {
        let t = Threshold::from_name(threshold).ok_or(IovError::errno(libc::ENOENT))?;
        return Ok(format!("{}\n", prov.get_threshold(vfid, t)));
    }

    let text = match name {
        "ggtt_quota" => format!("{}\n", prov.get_ggtt(vfid)),
        "contexts_quota" => format!("{}\n", prov.get_ctxs(vfid)),
        "doorbells_quota" => format!("{}\n", prov.get_dbs(vfid)),
        "lmem_quota" => format!("{}\n", prov.get_lmem(vfid)),
        "exec_quantum_ms" => format!("{}\n", prov.get_exec_quantum(vfid)),
        "preempt_timeout_us" => format!("{}\n", prov.get_preempt_timeout(vfid)),
        "sched_priority" => format!("{}\n", prov.get_sched_priority(vfid).as_str()),
        _ => return Err(IovError::errno(libc::ENOENT)),
    };
    Ok(text)
}

/// Write a per-VF text attribute.
pub fn vf_attr_store(dev: &PfDevice, vfid: u32, name: &str, value: &str) -> IovResult<()> {
    let prov = &dev.root_gt().provisioning;
    if let Some(threshold) = name.strip_prefix("threshold/") {
        let t = Threshold::from_name(threshold).ok_or(IovError::errno(libc::ENOENT))?;
        return prov.set_threshold(vfid, t, parse_u32(value)?);
    }

    match name {
        "ggtt_quota" => prov.set_ggtt(vfid, parse_u64(value)?),
        "contexts_quota" => prov.set_ctxs(vfid, parse_u32(value)?),
        "doorbells_quota" => prov.set_dbs(vfid, parse_u32(value)?),
        "lmem_quota" => prov.set_lmem(vfid, parse_u64(value)?),
        "exec_quantum_ms" => prov.set_exec_quantum(vfid, parse_u32(value)?),
        "preempt_timeout_us" => prov.set_preempt_timeout(vfid, parse_u32(value)?),
        "sched_priority" => {
            let priority = match value.trim() {
                "low" => SchedPriority::Low,
                "normal" => SchedPriority::Normal,
                "high" => SchedPriority::High,
                raw => SchedPriority::from_raw(parse_u32(raw)?)
                    .ok_or(IovError::errno(libc::EINVAL))?,
            };
            prov.set_sched_priority(vfid, priority)
        }
        _ => Err(IovError::errno(libc::ENOENT)),
    }
}

/// Read-only device attributes under `available/`.
pub fn available_attr_show(dev: &PfDevice, name: &str) -> IovResult<String> {
    let prov = &dev.root_gt().provisioning;
    let text = match name {
        "ggtt_free" => format!("{}\n", prov.query_free_ggtt()),
        "ggtt_max_quota" => format!("{}\n", prov.query_max_ggtt()),
        "contexts_free" => format!("{}\n", prov.query_free_ctxs()),
        "contexts_max_quota" => format!("{}\n", prov.query_max_ctxs()),
        "doorbells_free" => format!("{}\n", prov.query_free_dbs()),
        "doorbells_max_quota" => format!("{}\n", prov.query_max_dbs()),
        _ => return Err(IovError::errno(libc::ENOENT)),
    };
    Ok(text)
}

/// Write-only `control` attribute.
pub fn vf_control_store(dev: &PfDevice, vfid: u32, verb: &str) -> IovResult<()> {
    if vfid == PFID {
        return Err(IovError::errno(libc::EPERM));
    }
    match verb.trim() {
        "pause" => dev.pause_vf(vfid, false),
        "resume" => dev.resume_vf(vfid),
        "stop" => dev.stop_vf(vfid),
        "clear" => {
            for gt in dev.gts() {
                gt.provisioning.clear(vfid)?;
            }
            Ok(())
        }
        _ => Err(IovError::errno(libc::EINVAL)),
    }
}

/// Read the binary `state` blob: exactly 4 KiB, produced by a GuC save.
pub fn vf_state_read(dev: &PfDevice, vfid: u32) -> IovResult<Vec<u8>> {
    let mut buf = vec![0u8; SAVE_RESTORE_MIN_SIZE];
    dev.root_gt().state.save_vf(vfid, &mut buf)?;
    Ok(buf)
}

/// Write the binary `state` blob back; the VF must be paused.
pub fn vf_state_write(dev: &PfDevice, vfid: u32, buf: &[u8]) -> IovResult<()> {
    if buf.len() != SAVE_RESTORE_MIN_SIZE {
        return Err(IovError::errno(libc::EINVAL));
    }
    dev.root_gt().state.restore_vf(vfid, buf)
}
