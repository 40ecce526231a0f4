//! Multi-user sessions over MCP tool backends.
//!
//! - [`ConfigStore`]: global and per-user backend configs, persisted via a
//!   [`KvStore`]
//! - [`SessionRegistry`] / [`UserSession`]: one session per user, restored
//!   on first use and evicted when idle
//! - [`Gateway`]: the add/remove/list/catalog/chat operations
//! - [`ChatOrchestrator`]: the seam to whatever drives the model

pub mod chat;
pub mod config_store;
pub mod database;
pub mod errors;
pub mod facade;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod settings;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use chat::{ChatEvent, ChatOrchestrator, ChatTurnRequest, ToolInvoker, TurnContext};
pub use config_store::{BackendMap, ConfigStore};
pub use database::SqliteStore;
pub use errors::GatewayError;
pub use facade::Gateway;
pub use persistence::{JsonFileStore, KvStore, MemoryStore};
pub use registry::SessionRegistry;
pub use session::UserSession;
pub use settings::GatewaySettings;
pub use types::{AddBackendRequest, BackendSummary, CatalogTool, ToolCatalog, UserInfo};
