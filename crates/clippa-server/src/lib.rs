//! HTTP and WebSocket surface of the clippa party server.

pub mod config;
pub mod error;
pub mod handlers;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::ServerConfig;
pub use error::ApiError;
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{run_session, run_session_until, SessionConfig, SessionEnd, SessionError};
pub use shutdown::ShutdownCoordinator;
