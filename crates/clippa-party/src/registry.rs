use std::collections::HashMap;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::{debug, info};

use clippa_core::ids::{MemberId, PartyId};
use clippa_store::PartyStore;

use crate::error::PartyError;
use crate::handle::MemberHandle;
use crate::hub::{Hub, HubConfig, RetentionPolicy};

struct RegistryInner {
    hubs: RwLock<HashMap<PartyId, Arc<Hub>>>,
    store: Arc<dyn PartyStore>,
    config: HubConfig,
    policy: RetentionPolicy,
}

impl RegistryInner {
    /// Drop the mapping for `party_id` if it still points at a retired hub.
    fn remove_if_retired(&self, party_id: &PartyId) {
        let mut hubs = self.hubs.write();
        if hubs.get(party_id).is_some_and(|hub| hub.is_retired()) {
            hubs.remove(party_id);
            debug!(party_id = %party_id, remaining = hubs.len(), "hub evicted from registry");
        }
    }
}

/// Directory of live hubs keyed by party id. Cheap to clone.
#[derive(Clone)]
pub struct HubRegistry {
    inner: Arc<RegistryInner>,
}

impl HubRegistry {
    pub fn new(store: Arc<dyn PartyStore>, config: HubConfig, policy: RetentionPolicy) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                hubs: RwLock::new(HashMap::new()),
                store,
                config,
                policy,
            }),
        }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.inner.policy
    }

    /// Number of hubs currently mapped.
    pub fn len(&self) -> usize {
        self.inner.hubs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, party_id: &PartyId) -> bool {
        self.inner.hubs.read().contains_key(party_id)
    }

    /// The live hub for `party_id`, creating it on first use.
    ///
    /// Concurrent callers for an unseen id all get the same instance.
    pub fn get_or_create(&self, party_id: &PartyId) -> Arc<Hub> {
        {
            let hubs = self.inner.hubs.read();
            if let Some(hub) = hubs.get(party_id).filter(|h| !h.is_retired()) {
                return Arc::clone(hub);
            }
        }

        let mut hubs = self.inner.hubs.write();
        if let Some(hub) = hubs.get(party_id).filter(|h| !h.is_retired()) {
            return Arc::clone(hub);
        }

        let hub = Arc::new(self.build_hub(party_id.clone()));
        hubs.insert(party_id.clone(), Arc::clone(&hub));
        info!(party_id = %party_id, hubs = hubs.len(), "hub created");
        hub
    }

    /// Join `member_id` to the party's hub, retrying if the hub retired
    /// between lookup and join.
    pub async fn join(
        &self,
        party_id: &PartyId,
        member_id: MemberId,
    ) -> Result<MemberHandle, PartyError> {
        loop {
            let hub = self.get_or_create(party_id);
            match hub.join(member_id.clone()).await {
                Err(PartyError::HubRetired) => {
                    debug!(party_id = %party_id, "hub retired during join, retrying");
                    continue;
                }
                other => return other,
            }
        }
    }

    fn build_hub(&self, party_id: PartyId) -> Hub {
        let hub = Hub::new(
            party_id,
            Arc::clone(&self.inner.store),
            self.inner.config.clone(),
            self.inner.policy,
        );
        match self.inner.policy {
            RetentionPolicy::Retain => hub,
            RetentionPolicy::EvictWhenEmpty => {
                let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);
                hub.with_retire_hook(Box::new(move |party_id| {
                    if let Some(inner) = registry.upgrade() {
                        inner.remove_if_retired(party_id);
                    }
                }))
            }
        }
    }
}
