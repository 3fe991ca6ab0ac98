pub mod auth;
pub mod error;
pub mod handle;
pub mod hub;
pub mod registry;

#[cfg(test)]
pub(crate) mod testutil;

pub use auth::{AuthError, TokenConfig, TokenService};
pub use error::PartyError;
pub use handle::MemberHandle;
pub use hub::{Hub, HubConfig, RetentionPolicy};
pub use registry::HubRegistry;
