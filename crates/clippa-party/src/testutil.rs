use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use clippa_core::ids::PartyId;
use clippa_core::protocol::{self, TypedMessage};
use clippa_store::{PartyRow, PartyStore, StoreError};

use crate::handle::MemberHandle;
use crate::hub::{Hub, HubConfig, RetentionPolicy};

/// In-memory store that counts writes and can be told to fail them.
pub(crate) struct CountingStore {
    row: Mutex<PartyRow>,
    updates: AtomicUsize,
    fail: AtomicBool,
    write_delay: Mutex<Option<Duration>>,
}

impl CountingStore {
    pub(crate) fn new(id: PartyId) -> Self {
        Self {
            row: Mutex::new(PartyRow {
                id,
                name: "test".into(),
                secret_hash: String::new(),
                leader_address: String::new(),
                cert_pem: String::new(),
                key_pem: String::new(),
                created_at: String::new(),
                updated_at: String::new(),
            }),
            updates: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            write_delay: Mutex::new(None),
        }
    }

    pub(crate) fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub(crate) fn leader(&self) -> String {
        self.row.lock().leader_address.clone()
    }

    pub(crate) fn fail_updates(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Make every write block the calling thread, like a slow disk.
    pub(crate) fn slow_updates(&self, delay: Duration) {
        *self.write_delay.lock() = Some(delay);
    }
}

impl PartyStore for CountingStore {
    fn get(&self, id: &PartyId) -> Result<PartyRow, StoreError> {
        let row = self.row.lock();
        if &row.id != id {
            return Err(StoreError::NotFound(format!("party {id}")));
        }
        Ok(row.clone())
    }

    fn update(&self, party: &PartyRow) -> Result<(), StoreError> {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(StoreError::Database("disk I/O error".into()));
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        *self.row.lock() = party.clone();
        Ok(())
    }
}

pub(crate) fn hub_with(
    config: HubConfig,
    retention: RetentionPolicy,
) -> (Arc<Hub>, Arc<CountingStore>) {
    let party_id = PartyId::from_raw("party_test");
    let store = Arc::new(CountingStore::new(party_id.clone()));
    let hub = Arc::new(Hub::new(party_id, store.clone(), config, retention));
    (hub, store)
}

/// Everything currently queued for `handle`, decoded.
pub(crate) async fn party_frames(handle: &mut MemberHandle) -> Vec<TypedMessage> {
    tokio::task::yield_now().await;
    let mut frames = Vec::new();
    while let Some(frame) = handle.try_recv_for_test() {
        if let Ok(message) = protocol::parse(&frame) {
            frames.push(message);
        }
    }
    frames
}
