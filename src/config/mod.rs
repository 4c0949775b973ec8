//! Configuration management: the Config Store (C2) and the Secret Store
//! (C1). Server/profile records live in plain JSON on disk; credential
//! material lives exclusively in [`secret_store::SecretStore`].

pub mod crypto;
pub mod keychain;
pub mod secret_store;
pub mod storage;
pub mod types;

pub use keychain::{Keychain, KeychainError};
pub use secret_store::SecretStore;
pub use storage::{config_dir, log_dir, servers_file, stats_db_path, ConfigStorage, StorageError};
pub use types::{AuthType, ConfigFile, QuickProfile, ServerRecord, CONFIG_VERSION};
