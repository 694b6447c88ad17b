//! Configuration model for the aggregator: the immutable config snapshot,
//! the on-disk JSON store, load-time validation, and the namespace
//! permission engine.

mod model;
mod permissions;
mod store;
mod validate;

pub use model::{
    Config, MANAGER_PREFIX, NamespaceConfig, SCHEMA_VERSION, ServerConfig, ToolPermission,
};
pub use permissions::{Decision, check, is_allowed};
pub use store::{default_config_path, load_from_path, save_to_path};
pub use validate::validate;
