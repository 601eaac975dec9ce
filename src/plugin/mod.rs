pub mod adapter;
pub mod executor;
pub mod installer;
pub mod instructions;
pub mod lock;
pub mod manifest;
pub mod merge;
pub mod plan;
pub mod registry;
pub mod vars;

pub use executor::{ExecutionReport, Executor};
pub use installer::{Installer, InstallerOptions, PluginOutcome, SyncAction, SyncResult};
pub use lock::LockFile;
pub use manifest::Manifest;
