use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, RwLock};
use tokio::task;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use clippa_core::ids::{MemberId, PartyId};
use clippa_core::protocol::{self, Frame};
use clippa_store::{PartyStore, StoreError};

use crate::error::PartyError;
use crate::handle::MemberHandle;

/// Tuning for a hub's delivery path.
#[derive(Clone, Debug)]
pub struct HubConfig {
    /// Longest a broadcast waits on one recipient's full queue before evicting it.
    pub broadcast_timeout: Duration,
    /// Per-member outbound queue depth.
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            broadcast_timeout: Duration::from_millis(100),
            outbox_capacity: 64,
        }
    }
}

/// What happens to a hub once its last member leaves.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionPolicy {
    /// Keep the hub for the life of the process.
    #[default]
    Retain,
    /// Retire the hub and drop it from the registry.
    EvictWhenEmpty,
}

pub(crate) type RetireHook = Box<dyn Fn(&PartyId) + Send + Sync>;

struct Outbox {
    tx: mpsc::Sender<Frame>,
    evicted: CancellationToken,
    generation: u64,
}

#[derive(Default)]
struct Members {
    outboxes: HashMap<MemberId, Outbox>,
    next_generation: u64,
}

/// In-memory membership and broadcast fan-out for one party.
pub struct Hub {
    party_id: PartyId,
    store: Arc<dyn PartyStore>,
    config: HubConfig,
    retention: RetentionPolicy,
    members: RwLock<Members>,
    retired: AtomicBool,
    on_retired: Option<RetireHook>,
}

impl Hub {
    pub fn new(
        party_id: PartyId,
        store: Arc<dyn PartyStore>,
        config: HubConfig,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            party_id,
            store,
            config,
            retention,
            members: RwLock::new(Members::default()),
            retired: AtomicBool::new(false),
            on_retired: None,
        }
    }

    /// Called with the party id right after the hub retires itself.
    pub(crate) fn with_retire_hook(mut self, hook: RetireHook) -> Self {
        self.on_retired = Some(hook);
        self
    }

    pub fn party_id(&self) -> &PartyId {
        &self.party_id
    }

    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::Acquire)
    }

    pub async fn member_count(&self) -> usize {
        self.members.read().await.outboxes.len()
    }

    /// Sorted snapshot of current member ids.
    pub async fn members(&self) -> Vec<MemberId> {
        let members = self.members.read().await;
        let mut ids: Vec<MemberId> = members.outboxes.keys().cloned().collect();
        ids.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        ids
    }

    /// Add a member with a fresh outbound queue, replacing any stale entry
    /// for the same id, then announce it to everyone else.
    #[instrument(skip(self, member_id), fields(party_id = %self.party_id, member_id = %member_id))]
    pub async fn join(self: &Arc<Self>, member_id: MemberId) -> Result<MemberHandle, PartyError> {
        let (tx, rx) = mpsc::channel(self.config.outbox_capacity.max(1));
        let own_queue = tx.downgrade();
        let evicted = CancellationToken::new();

        let generation = {
            let mut members = self.members.write().await;
            if self.is_retired() {
                return Err(PartyError::HubRetired);
            }
            members.next_generation += 1;
            let generation = members.next_generation;
            let outbox = Outbox {
                tx,
                evicted: evicted.clone(),
                generation,
            };
            if let Some(stale) = members.outboxes.insert(member_id.clone(), outbox) {
                stale.evicted.cancel();
                debug!(stale_generation = stale.generation, "replaced stale member entry");
            }
            generation
        };

        info!(generation, "member joined");
        self.broadcast(&member_id, protocol::joined(&member_id)).await;

        Ok(MemberHandle::new(
            Arc::clone(self),
            member_id,
            rx,
            own_queue,
            evicted,
            generation,
        ))
    }

    /// Remove a member regardless of which join created its entry.
    pub async fn leave(&self, member_id: &MemberId) {
        self.remove(member_id, None).await;
    }

    /// Remove a member only if `generation` still owns its entry.
    pub(crate) async fn leave_slot(&self, member_id: &MemberId, generation: u64) {
        self.remove(member_id, Some(generation)).await;
    }

    #[instrument(skip(self, member_id), fields(party_id = %self.party_id, member_id = %member_id))]
    async fn remove(&self, member_id: &MemberId, generation: Option<u64>) -> bool {
        let retired_now = {
            let mut members = self.members.write().await;
            let owned = members
                .outboxes
                .get(member_id)
                .is_some_and(|o| generation.map_or(true, |g| o.generation == g));
            if !owned {
                debug!("leave ignored, entry absent or superseded");
                return false;
            }
            if let Some(outbox) = members.outboxes.remove(member_id) {
                outbox.evicted.cancel();
            }
            let retire =
                members.outboxes.is_empty() && self.retention == RetentionPolicy::EvictWhenEmpty;
            if retire {
                self.retired.store(true, Ordering::Release);
            }
            retire
        };

        info!("member left");
        if retired_now {
            info!("hub retired");
            if let Some(hook) = &self.on_retired {
                hook(&self.party_id);
            }
        } else {
            self.broadcast(member_id, protocol::left(member_id)).await;
        }
        true
    }

    /// Deliver `frame` to every member except `sender`.
    ///
    /// Holds the read lock for the whole pass. A recipient whose queue stays
    /// full past `broadcast_timeout` is evicted and the pass stops there.
    /// Returns the number of recipients the frame was queued for.
    pub async fn broadcast(&self, sender: &MemberId, frame: Frame) -> usize {
        let members = self.members.read().await;
        let mut delivered = 0;

        for (member_id, outbox) in &members.outboxes {
            if member_id == sender || outbox.evicted.is_cancelled() {
                continue;
            }
            match outbox
                .tx
                .send_timeout(Arc::clone(&frame), self.config.broadcast_timeout)
                .await
            {
                Ok(()) => delivered += 1,
                Err(SendTimeoutError::Timeout(_)) => {
                    outbox.evicted.cancel();
                    warn!(
                        party_id = %self.party_id,
                        member_id = %member_id,
                        delivered,
                        "member evicted, outbound queue full"
                    );
                    return delivered;
                }
                Err(SendTimeoutError::Closed(_)) => {
                    outbox.evicted.cancel();
                    debug!(
                        party_id = %self.party_id,
                        member_id = %member_id,
                        "member evicted, receiver gone"
                    );
                }
            }
        }

        debug!(party_id = %self.party_id, recipients = delivered, "broadcast");
        delivered
    }

    /// Persist `address` as the party leader. No store write when unchanged.
    /// The store round trip runs on the blocking pool.
    pub async fn set_leader(&self, address: &str) -> Result<(), StoreError> {
        let store = Arc::clone(&self.store);
        let party_id = self.party_id.clone();
        let leader = address.to_string();
        let changed = task::spawn_blocking(move || -> Result<bool, StoreError> {
            let mut party = store.get(&party_id)?;
            if party.leader_address == leader {
                return Ok(false);
            }
            party.leader_address = leader;
            store.update(&party)?;
            Ok(true)
        })
        .await
        .map_err(|e| StoreError::Database(format!("leader update task failed: {e}")))??;

        if changed {
            info!(party_id = %self.party_id, leader = address, "leader updated");
        }
        Ok(())
    }

    /// Clear the party leader. No store write when already empty.
    pub async fn reset_leader(&self) -> Result<(), StoreError> {
        self.set_leader("").await
    }
}
