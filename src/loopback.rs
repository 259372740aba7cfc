//! In-process multi-rank process group for tests and single-process runs.
//!
//! Every rank is a handle onto shared state; collectives rendezvous on a
//! cyclic barrier with a deposit round and a read round, so a slow reader
//! can never observe the next collective's payload. Collectives must be
//! issued in identical order on every rank, as with any real backend.

use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Barrier;

use crate::error::{MeshReduceError, Result};
use crate::group::{BackendKind, ProcessGroup};
use crate::types::Rank;

/// Options for [`LoopbackGroup::bootstrap_with`].
#[derive(Debug, Clone)]
pub struct LoopbackOptions {
    /// Host name per rank; all ranks share one host when `None`.
    pub hosts: Option<Vec<String>>,
    /// Backend kind the group reports.
    pub backend: BackendKind,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            hosts: None,
            backend: BackendKind::Host,
        }
    }
}

struct LoopbackShared {
    world_size: u32,
    hosts: Vec<String>,
    backend: BackendKind,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Vec<u8>>>>,
}

/// One rank's handle onto an in-process group.
pub struct LoopbackGroup {
    rank: Rank,
    shared: Arc<LoopbackShared>,
}

impl LoopbackGroup {
    /// Create a single-host group of `world_size` ranks, returned in rank
    /// order. Every handle must participate in every collective or the
    /// group hangs.
    pub fn bootstrap(world_size: u32) -> Vec<LoopbackGroup> {
        Self::bootstrap_with(world_size, LoopbackOptions::default())
    }

    /// Create a group with explicit per-rank hosts and backend kind.
    pub fn bootstrap_with(world_size: u32, options: LoopbackOptions) -> Vec<LoopbackGroup> {
        assert!(world_size > 0, "world size must be nonzero");
        let hosts = options
            .hosts
            .unwrap_or_else(|| vec!["localhost".to_string(); world_size as usize]);
        assert_eq!(
            hosts.len(),
            world_size as usize,
            "one host entry per rank required"
        );
        let shared = Arc::new(LoopbackShared {
            world_size,
            hosts,
            backend: options.backend,
            barrier: Barrier::new(world_size as usize),
            slots: Mutex::new(vec![None; world_size as usize]),
        });
        (0..world_size)
            .map(|rank| LoopbackGroup {
                rank,
                shared: Arc::clone(&shared),
            })
            .collect()
    }

    fn deposit(&self, slot: usize, bytes: Vec<u8>) {
        let mut slots = self.shared.slots.lock().unwrap();
        slots[slot] = Some(bytes);
    }

    fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serialize(value).map_err(|e| MeshReduceError::EncodeFailed(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::deserialize(bytes).map_err(|e| MeshReduceError::DecodeFailed(e.to_string()))
    }
}

impl ProcessGroup for LoopbackGroup {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.shared.world_size
    }

    fn backend(&self) -> BackendKind {
        self.shared.backend
    }

    async fn all_gather<T>(&self, value: &T) -> Result<Vec<T>>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.deposit(self.rank as usize, Self::encode(value)?);
        self.shared.barrier.wait().await;
        let gathered: Vec<Vec<u8>> = {
            let slots = self.shared.slots.lock().unwrap();
            slots
                .iter()
                .map(|s| {
                    s.clone().ok_or(MeshReduceError::CollectiveFailed {
                        operation: "all_gather",
                        rank: self.rank,
                        reason: "peer deposited no payload".into(),
                    })
                })
                .collect::<Result<_>>()?
        };
        // Second rendezvous: nobody may overwrite a slot until all have read.
        self.shared.barrier.wait().await;
        gathered.iter().map(|b| Self::decode(b)).collect()
    }

    async fn broadcast<T>(&self, value: Option<&T>, source: Rank) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
    {
        if source >= self.shared.world_size {
            return Err(MeshReduceError::InvalidRank {
                rank: source,
                world_size: self.shared.world_size,
            });
        }
        if self.rank == source {
            let value = value.ok_or(MeshReduceError::MissingBroadcastValue { source_rank: source })?;
            self.deposit(source as usize, Self::encode(value)?);
        }
        self.shared.barrier.wait().await;
        let bytes = {
            let slots = self.shared.slots.lock().unwrap();
            slots[source as usize]
                .clone()
                .ok_or(MeshReduceError::CollectiveFailed {
                    operation: "broadcast",
                    rank: self.rank,
                    reason: "source deposited no payload".into(),
                })?
        };
        self.shared.barrier.wait().await;
        Self::decode(&bytes)
    }

    async fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait().await;
        Ok(())
    }

    async fn same_host(&self, source: Rank) -> Result<Vec<bool>> {
        if source >= self.shared.world_size {
            return Err(MeshReduceError::InvalidRank {
                rank: source,
                world_size: self.shared.world_size,
            });
        }
        let source_host = &self.shared.hosts[source as usize];
        Ok(self
            .shared
            .hosts
            .iter()
            .map(|h| h == source_host)
            .collect())
    }
}
