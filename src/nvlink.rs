//! Interconnect topology queries consumed by the capability probe.
//!
//! The query subsystem is scoped: a session is acquired, used for a batch
//! of per-pair queries, and released. Implementations release subsystem
//! resources in the session's `Drop`, so the release happens on every
//! path out of a probe, including query errors.

use crate::error::Result;
use crate::types::DeviceId;

/// One-hop link status between a pair of devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvlinkStatus {
    /// Direct NVLink peer connectivity is available.
    Ok,
    /// The pair is reachable only over PCIe or multi-hop paths.
    NotSupported,
    /// Connectivity disabled by platform or driver policy.
    Disabled,
    /// The driver could not classify the pair.
    Unknown,
}

/// An open topology-query session.
pub trait NvlinkSession {
    /// One-hop NVLink peer status for the ordered pair (`device`, `peer`).
    fn p2p_status(&self, device: DeviceId, peer: DeviceId) -> Result<NvlinkStatus>;
}

/// Factory for scoped topology-query sessions.
pub trait NvlinkTopology: Send + Sync {
    /// Initialize the query subsystem and return a live session.
    fn open_session(&self) -> Result<Box<dyn NvlinkSession + '_>>;
}
