use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use clippa_core::ids::PartyId;

use crate::database::Database;
use crate::error::StoreError;

/// A durable party record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartyRow {
    pub id: PartyId,
    pub name: String,
    #[serde(skip_serializing)]
    pub secret_hash: String,
    /// Empty when no leader is set.
    pub leader_address: String,
    pub cert_pem: String,
    pub key_pem: String,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields supplied when creating a party. The id is generated.
#[derive(Clone, Debug, Default)]
pub struct NewParty {
    pub name: String,
    pub secret_hash: String,
    pub cert_pem: String,
    pub key_pem: String,
}

/// The slice of the party store a hub needs for leader changes.
pub trait PartyStore: Send + Sync {
    fn get(&self, id: &PartyId) -> Result<PartyRow, StoreError>;
    fn update(&self, party: &PartyRow) -> Result<(), StoreError>;
}

#[derive(Clone)]
pub struct PartyRepo {
    db: Database,
}

const PARTY_COLUMNS: &str =
    "id, name, secret_hash, leader_address, cert_pem, key_pem, created_at, updated_at";

impl PartyRepo {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Insert a new party with an empty leader address.
    #[instrument(skip(self, party), fields(name = %party.name))]
    pub fn create(&self, party: NewParty) -> Result<PartyRow, StoreError> {
        let id = PartyId::new();
        let now = Utc::now().to_rfc3339();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO parties (id, name, secret_hash, leader_address, cert_pem, key_pem, created_at, updated_at)
                 VALUES (?1, ?2, ?3, '', ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    id.as_str(),
                    party.name,
                    party.secret_hash,
                    party.cert_pem,
                    party.key_pem,
                    now,
                    now,
                ],
            )?;

            Ok(PartyRow {
                id,
                name: party.name,
                secret_hash: party.secret_hash,
                leader_address: String::new(),
                cert_pem: party.cert_pem,
                key_pem: party.key_pem,
                created_at: now.clone(),
                updated_at: now,
            })
        })
    }

    /// Get a party by ID.
    #[instrument(skip(self), fields(party_id = %id))]
    pub fn get(&self, id: &PartyId) -> Result<PartyRow, StoreError> {
        self.db.with_conn(|conn| {
            let sql = format!("SELECT {PARTY_COLUMNS} FROM parties WHERE id = ?1");
            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query([id.as_str()])?;
            match rows.next()? {
                Some(row) => Ok(row_to_party(row)?),
                None => Err(StoreError::NotFound(format!("party {id}"))),
            }
        })
    }

    /// Persist the mutable fields of a party. The id never changes.
    #[instrument(skip(self, party), fields(party_id = %party.id))]
    pub fn update(&self, party: &PartyRow) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();
        self.db.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE parties
                 SET name = ?2, secret_hash = ?3, leader_address = ?4, cert_pem = ?5, key_pem = ?6, updated_at = ?7
                 WHERE id = ?1",
                rusqlite::params![
                    party.id.as_str(),
                    party.name,
                    party.secret_hash,
                    party.leader_address,
                    party.cert_pem,
                    party.key_pem,
                    now,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(format!("party {}", party.id)));
            }
            Ok(())
        })
    }

    /// Delete a party. Returns whether a row was removed.
    #[instrument(skip(self), fields(party_id = %id))]
    pub fn delete(&self, id: &PartyId) -> Result<bool, StoreError> {
        self.db.with_conn(|conn| {
            let changed = conn.execute("DELETE FROM parties WHERE id = ?1", [id.as_str()])?;
            Ok(changed > 0)
        })
    }

    pub fn count(&self) -> Result<u64, StoreError> {
        self.db.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM parties", [], |row| row.get(0))?;
            Ok(u64::try_from(n).unwrap_or_default())
        })
    }
}

impl PartyStore for PartyRepo {
    fn get(&self, id: &PartyId) -> Result<PartyRow, StoreError> {
        PartyRepo::get(self, id)
    }

    fn update(&self, party: &PartyRow) -> Result<(), StoreError> {
        PartyRepo::update(self, party)
    }
}

fn row_to_party(row: &rusqlite::Row<'_>) -> Result<PartyRow, rusqlite::Error> {
    Ok(PartyRow {
        id: PartyId::from_raw(row.get::<_, String>(0)?),
        name: row.get(1)?,
        secret_hash: row.get(2)?,
        leader_address: row.get(3)?,
        cert_pem: row.get(4)?,
        key_pem: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}
