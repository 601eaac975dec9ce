use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::plugin::manifest::write_json_atomic;

pub const LOCK_FILE: &str = "dex.lock";
pub const LOCK_FORMAT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockedPlugin {
    pub version: String,
    pub resolved: String,
    pub integrity: String,
    /// Dependency name → constraint, as declared by the installed package.
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// Resolved versions and dependency edges of everything installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockFile {
    pub version: String,
    pub agent: String,
    #[serde(default)]
    plugins: BTreeMap<String, LockedPlugin>,
    #[serde(skip)]
    path: PathBuf,
}

impl LockFile {
    pub fn new(project_dir: &Path, agent: &str) -> Self {
        Self {
            version: LOCK_FORMAT_VERSION.to_string(),
            agent: agent.to_string(),
            plugins: BTreeMap::new(),
            path: project_dir.join(LOCK_FILE),
        }
    }

    /// Loads `dex.lock`; a missing file is an empty lock for `agent`.
    pub fn load(project_dir: &Path, agent: &str) -> Result<Self> {
        let path = project_dir.join(LOCK_FILE);
        if !path.exists() {
            return Ok(Self::new(project_dir, agent));
        }

        let raw = fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let mut lock: LockFile =
            serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        if lock.version != LOCK_FORMAT_VERSION {
            bail!(
                "{} has format version {}, this dex reads {LOCK_FORMAT_VERSION}",
                path.display(),
                lock.version
            );
        }
        lock.path = path;
        Ok(lock)
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, self)
    }

    pub fn get(&self, name: &str) -> Option<&LockedPlugin> {
        self.plugins.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    pub fn insert(&mut self, name: &str, entry: LockedPlugin) {
        self.plugins.insert(name.to_string(), entry);
    }

    pub fn remove(&mut self, name: &str) -> Option<LockedPlugin> {
        self.plugins.remove(name)
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    /// Plugins whose recorded dependencies name `name` directly, sorted.
    pub fn find_dependents(&self, name: &str) -> Vec<String> {
        self.plugins
            .iter()
            .filter(|(dependent, entry)| dependent.as_str() != name && entry.dependencies.contains_key(name))
            .map(|(dependent, _)| dependent.clone())
            .collect()
    }
}
