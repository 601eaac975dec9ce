use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Pipeline stage an install or uninstall failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Resolve,
    Fetch,
    Parse,
    Validate,
    Configure,
    Plan,
    Install,
    Uninstall,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::Resolve => "resolve",
            Stage::Fetch => "fetch",
            Stage::Parse => "parse",
            Stage::Validate => "validate",
            Stage::Configure => "configure",
            Stage::Plan => "plan",
            Stage::Install => "install",
            Stage::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Error)]
pub enum DexError {
    /// Malformed or invalid declaration. The message is shown verbatim.
    #[error("{0}")]
    Config(String),

    #[error("{stage} failed for plugin `{plugin}`: {message}")]
    Install {
        plugin: String,
        stage: Stage,
        message: String,
    },

    /// An existing file not managed by the installing plugin sits at a write destination.
    #[error(
        "plugin `{plugin}` would overwrite unmanaged file {}; re-run with --force to overwrite it",
        path.display()
    )]
    Conflict { plugin: String, path: PathBuf },

    /// Reading or writing the manifest or lock failed.
    #[error("{0}")]
    State(String),
}

impl DexError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn state(err: anyhow::Error) -> Self {
        Self::State(format!("{err:#}"))
    }

    pub fn install(plugin: impl Into<String>, stage: Stage, err: impl fmt::Display) -> Self {
        Self::Install {
            plugin: plugin.into(),
            stage,
            message: err.to_string(),
        }
    }

    pub fn plugin(&self) -> Option<&str> {
        match self {
            DexError::Config(_) | DexError::State(_) => None,
            DexError::Install { plugin, .. } | DexError::Conflict { plugin, .. } => Some(plugin),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            DexError::Config(_) | DexError::State(_) => None,
            DexError::Install { stage, .. } => Some(*stage),
            DexError::Conflict { .. } => Some(Stage::Install),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, DexError::Conflict { .. })
    }
}

pub type Result<T, E = DexError> = std::result::Result<T, E>;

/// Tags a fallible step with the plugin and stage it belongs to.
pub trait StageContext<T> {
    fn stage(self, plugin: &str, stage: Stage) -> Result<T>;
}

impl<T> StageContext<T> for anyhow::Result<T> {
    fn stage(self, plugin: &str, stage: Stage) -> Result<T> {
        self.map_err(|err| DexError::install(plugin, stage, format!("{err:#}")))
    }
}

impl<T> StageContext<T> for std::io::Result<T> {
    fn stage(self, plugin: &str, stage: Stage) -> Result<T> {
        self.map_err(|err| DexError::install(plugin, stage, err))
    }
}
