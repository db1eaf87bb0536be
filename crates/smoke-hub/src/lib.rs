pub mod allocator;
pub mod api;
pub mod channel;
pub mod codec;
pub mod config;
pub mod error;
pub mod identity;
pub mod keys;
pub mod metrics;
pub mod rate_limit;
pub mod relay;
pub mod server;
pub mod sqlite_store;
pub mod store;

pub use config::ServerConfig;
pub use error::{ErrorCode, RelayError};
pub use relay::Relay;
pub use server::HubServer;
