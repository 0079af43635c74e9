//! Wire-level GuC interface: message envelopes, action numbers, KLV blobs
//! and the transport handle the control plane drives them through.

pub mod actions;
pub mod hxg;
pub mod klv;
pub mod transport;
