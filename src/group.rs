//! Process-group collaborator: the external collective-communication
//! runtime the coordinator rides on.
//!
//! Every collective here blocks the calling rank until all peers arrive,
//! with no internal timeout. All ranks must issue the same collectives in
//! the same order; a mismatch deadlocks or corrupts the exchange and is a
//! caller precondition, not something this crate detects.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;
use crate::types::Rank;

/// Transport class of the group's collective backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// A fully-capable network-fabric collective backend. P2P coordination
    /// attaches only to a non-fabric group; the fabric backend already
    /// covers the fast path itself.
    Fabric,
    /// A host-mediated sideband backend (object exchange, bootstrap).
    Host,
}

/// Ordered process group with object-valued collectives.
///
/// Payloads are serde-encoded; the transport underneath is opaque.
pub trait ProcessGroup: Send + Sync {
    /// This rank's 0-based index within the group.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn world_size(&self) -> u32;

    /// Transport class of the backing collective runtime.
    fn backend(&self) -> BackendKind;

    /// Gather one value from every rank, ordered by rank index.
    fn all_gather<T>(&self, value: &T) -> impl Future<Output = Result<Vec<T>>> + Send
    where
        T: Serialize + DeserializeOwned + Send + Sync;

    /// Broadcast from `source` to every rank. Only the source rank's
    /// `value` is consulted; other ranks may pass `None`.
    fn broadcast<T>(&self, value: Option<&T>, source: Rank) -> impl Future<Output = Result<T>> + Send
    where
        T: Serialize + DeserializeOwned + Send + Sync;

    /// Block until every rank has arrived.
    fn barrier(&self) -> impl Future<Output = Result<()>> + Send;

    /// For each rank, whether it resides on the same host as `source`.
    fn same_host(&self, source: Rank) -> impl Future<Output = Result<Vec<bool>>> + Send;
}
