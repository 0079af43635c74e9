//! SR-IOV control plane and page-table engine for a GuC-based GPU.
//!
//! Two cooperating halves:
//!
//! * [`pf`] partitions one physical GPU into isolated virtual functions:
//!   quota provisioning pushed to the GuC as KLV blobs, a per-VF reset and
//!   pause state machine, and the VF<->PF message relay.
//! * [`vm`] binds and unbinds address ranges in a GPU address space:
//!   staged multi-level page-table updates, atomic commit, and TLB
//!   invalidation fencing.
//!
//! The GuC firmware and the TLB hardware are driven through the
//! [`guc::transport::GucTransport`] and [`vm::fence::TlbInvalidator`]
//! traits.

pub mod error;
pub mod guc;
pub mod pf;
pub mod vm;

pub use error::{IovError, IovResult};
