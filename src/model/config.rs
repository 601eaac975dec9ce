use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// User-level settings, shared by every project.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub install: InstallConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub log_filter: String,
    /// Registry used by projects that declare none.
    #[serde(default)]
    pub default_registry: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InstallConfig {
    #[serde(default)]
    pub force: bool,
}

/// Partial user file; absent keys fall back to the embedded defaults.
#[derive(Debug, Default, Deserialize)]
struct UserConfig {
    #[serde(default)]
    general: UserGeneralConfig,
    #[serde(default)]
    install: Option<InstallConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct UserGeneralConfig {
    log_filter: Option<String>,
    default_registry: Option<String>,
}

impl AppConfig {
    /// Load configuration with layering: defaults → user config.
    pub fn load() -> Result<Self> {
        let user_path = directories::ProjectDirs::from("", "", "dex")
            .map(|dirs| dirs.config_dir().join("config.toml"));
        Self::load_from(user_path.as_deref())
    }

    pub fn load_from(user_path: Option<&Path>) -> Result<Self> {
        let defaults = include_str!("../../config/default.toml");
        let mut config: AppConfig = toml::from_str(defaults)?;

        if let Some(path) = user_path.filter(|path| path.exists()) {
            let user_str = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let user: UserConfig = toml::from_str(&user_str)
                .with_context(|| format!("parsing {}", path.display()))?;
            config.apply(user);
        }

        if let Some(registry) = config.general.default_registry.as_mut() {
            if registry.starts_with('~') {
                let home = dirs_home().ok_or_else(|| anyhow!("cannot determine home directory"))?;
                *registry = registry.replacen('~', &home.to_string_lossy(), 1);
            }
        }

        Ok(config)
    }

    fn apply(&mut self, user: UserConfig) {
        if let Some(filter) = user.general.log_filter {
            self.general.log_filter = filter;
        }
        if let Some(registry) = user.general.default_registry {
            self.general.default_registry = Some(registry);
        }
        if let Some(install) = user.install {
            self.install = install;
        }
    }

    pub fn default_registry(&self) -> Option<PathBuf> {
        self.general.default_registry.as_ref().map(PathBuf::from)
    }

    /// Directory the rolling log file lives in.
    pub fn log_dir() -> PathBuf {
        directories::ProjectDirs::from("", "", "dex")
            .map(|d| d.data_dir().to_path_buf())
            .unwrap_or_else(|| std::env::temp_dir().join("dex"))
    }
}

fn dirs_home() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}
