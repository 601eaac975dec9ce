use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{DexError, Result};
use crate::model::platform::Platform;

pub const PROJECT_FILE: &str = "dex.toml";

/// The project's declaration of which plugins it wants.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    pub project: ProjectSection,
    #[serde(default)]
    pub registries: BTreeMap<String, RegistryConfig>,
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginDeclaration>,
    #[serde(skip)]
    root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectSection {
    #[serde(default)]
    pub name: Option<String>,
    pub agent: String,
    #[serde(default)]
    pub agent_instructions: Option<String>,
    #[serde(default)]
    pub default_registry: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PluginDeclaration {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub registry: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub config: BTreeMap<String, toml::Value>,
}

impl PluginDeclaration {
    /// Config values flattened to strings for template substitution.
    pub fn config_strings(&self) -> BTreeMap<String, String> {
        self.config
            .iter()
            .map(|(key, value)| {
                let text = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), text)
            })
            .collect()
    }
}

impl ProjectConfig {
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(PROJECT_FILE);
        let raw = fs::read_to_string(&path)
            .map_err(|err| DexError::config(format!("{}: {err}", path.display())))?;
        Self::parse(&raw, project_dir)
            .map_err(|err| DexError::config(format!("{}: {err}", path.display())))
    }

    pub fn parse(raw: &str, project_dir: &Path) -> Result<Self> {
        let mut config: ProjectConfig =
            toml::from_str(raw).map_err(|err| DexError::config(err.to_string()))?;
        config.root = project_dir.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        self.platform()?;

        if let Some(default) = self.project.default_registry.as_ref() {
            if !self.registries.contains_key(default) {
                return Err(DexError::config(format!(
                    "default registry `{default}` is not declared under [registries]"
                )));
            }
        }

        for (name, registry) in &self.registries {
            match (registry.path.as_ref(), registry.url.as_deref()) {
                (None, None) => {
                    return Err(DexError::config(format!(
                        "registry `{name}` needs either `path` or `url`"
                    )));
                }
                (None, Some(url)) if !url.starts_with("file://") => {
                    return Err(DexError::config(format!(
                        "registry `{name}` has unsupported url `{url}`: only `file://` registries are available"
                    )));
                }
                _ => {}
            }
        }

        for (name, plugin) in &self.plugins {
            validate_plugin_name(name).map_err(DexError::config)?;
            if let Some(registry) = plugin.registry.as_ref() {
                if !self.registries.contains_key(registry) {
                    return Err(DexError::config(format!(
                        "plugin `{name}` references unknown registry `{registry}`"
                    )));
                }
            }
            if let Some(source) = plugin.source.as_deref() {
                if !is_local_source(source) {
                    return Err(DexError::config(format!(
                        "plugin `{name}` has unsupported source `{source}`: only local paths and `file:` sources are available"
                    )));
                }
            }
            if let Some(constraint) = plugin.version.as_ref() {
                parse_constraint(constraint).map_err(|err| {
                    DexError::config(format!(
                        "plugin `{name}` has invalid version constraint `{constraint}`: {err}"
                    ))
                })?;
            }
        }

        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn platform(&self) -> Result<Platform> {
        self.project
            .agent
            .parse()
            .map_err(|err: anyhow::Error| DexError::config(err.to_string()))
    }

    /// Project-level agent instructions, if any non-blank text is declared.
    pub fn agent_instructions(&self) -> Option<&str> {
        self.project
            .agent_instructions
            .as_deref()
            .map(str::trim)
            .filter(|text| !text.is_empty())
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginDeclaration> {
        self.plugins.get(name)
    }

    /// Registry config for a plugin: its own, else the project default.
    pub fn registry_for(&self, declaration: Option<&PluginDeclaration>) -> Option<(&str, &RegistryConfig)> {
        let name = declaration
            .and_then(|plugin| plugin.registry.as_deref())
            .or(self.project.default_registry.as_deref())?;
        self.registries
            .get_key_value(name)
            .map(|(name, config)| (name.as_str(), config))
    }

    /// Resolves a path written in `dex.toml` against the project root.
    pub fn resolve_path(&self, raw: &str) -> PathBuf {
        let path = PathBuf::from(raw);
        if path.is_absolute() {
            path
        } else {
            self.root.join(path)
        }
    }

    /// Appends `[plugins.<name>]` to `dex.toml`, keeping the rest of the file as written.
    pub fn add_plugin(project_dir: &Path, name: &str, constraint: &str) -> anyhow::Result<()> {
        let path = project_dir.join(PROJECT_FILE);
        let mut doc = fs::read_to_string(&path)?.parse::<toml_edit::DocumentMut>()?;

        let plugins = doc
            .entry("plugins")
            .or_insert(toml_edit::table())
            .as_table_mut()
            .ok_or_else(|| anyhow::anyhow!("`plugins` in {} is not a table", path.display()))?;
        plugins.set_implicit(true);

        if plugins.contains_key(name) {
            return Ok(());
        }

        let mut entry = toml_edit::Table::new();
        entry.insert("version", toml_edit::value(constraint));
        plugins.insert(name, toml_edit::Item::Table(entry));

        fs::write(&path, doc.to_string())?;
        Ok(())
    }

    /// Removes `[plugins.<name>]` from `dex.toml`. Returns whether it was declared.
    pub fn remove_plugin(project_dir: &Path, name: &str) -> anyhow::Result<bool> {
        let path = project_dir.join(PROJECT_FILE);
        let mut doc = fs::read_to_string(&path)?.parse::<toml_edit::DocumentMut>()?;

        let removed = doc
            .get_mut("plugins")
            .and_then(|item| item.as_table_like_mut())
            .and_then(|plugins| plugins.remove(name))
            .is_some();

        if removed {
            fs::write(&path, doc.to_string())?;
        }
        Ok(removed)
    }
}

/// Name of the synthetic plugin carrying project-level agent instructions.
/// The `@` keeps it out of the space of valid plugin names.
pub const PROJECT_PSEUDO_PLUGIN: &str = "@project";

pub fn validate_plugin_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("plugin name must not be empty".to_string());
    }
    if let Some(bad) = name
        .chars()
        .find(|ch| !(ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.')))
    {
        return Err(format!("plugin name `{name}` contains invalid character `{bad}`"));
    }
    Ok(())
}

/// Whether `source` names a local directory (`file:` prefix or a plain path).
pub fn is_local_source(source: &str) -> bool {
    source.starts_with("file:")
        || !(source.contains("://") || source.starts_with("git+") || source.starts_with("github:"))
}

/// Parses a version constraint. A bare version is treated as a caret requirement.
pub fn parse_constraint(constraint: &str) -> anyhow::Result<semver::VersionReq> {
    let trimmed = constraint.trim();
    if trimmed.is_empty() || trimmed == "latest" {
        return Ok(semver::VersionReq::STAR);
    }
    Ok(semver::VersionReq::parse(trimmed)?)
}

/// A `name` or `name@constraint` argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginSpec {
    pub name: String,
    pub constraint: Option<String>,
}

impl PluginSpec {
    pub fn parse(raw: &str) -> Result<Self> {
        let (name, constraint) = match raw.split_once('@') {
            Some((name, constraint)) => (name.trim(), Some(constraint.trim().to_string())),
            None => (raw.trim(), None),
        };
        validate_plugin_name(name).map_err(DexError::config)?;
        if let Some(constraint) = constraint.as_deref() {
            parse_constraint(constraint).map_err(|err| {
                DexError::config(format!("invalid version constraint in `{raw}`: {err}"))
            })?;
        }
        Ok(Self {
            name: name.to_string(),
            constraint: constraint.filter(|c| !c.is_empty()),
        })
    }
}
