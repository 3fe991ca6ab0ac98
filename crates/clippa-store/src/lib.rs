pub mod database;
pub mod error;
pub mod parties;
pub mod schema;

pub use database::Database;
pub use error::StoreError;
pub use parties::{NewParty, PartyRepo, PartyRow, PartyStore};
