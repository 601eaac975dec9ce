use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde_json::{Map, Value};

use crate::model::platform::McpKey;
use crate::plugin::merge;

/// Create a directory, relative to the project root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryCreate {
    pub path: String,
    /// Create missing parents too. Without it a missing parent is an error.
    pub parents: bool,
}

/// Write one file exclusively owned by the plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
    /// Octal permission string such as `755`. Defaults to `644`.
    pub mode: Option<String>,
}

/// Servers merged into the shared MCP document.
#[derive(Debug, Clone, PartialEq)]
pub struct McpContribution {
    pub path: String,
    pub key: McpKey,
    pub servers: Map<String, Value>,
    pub inputs: Vec<Value>,
}

/// Permission values merged into the shared settings document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsContribution {
    pub path: String,
    pub values: BTreeMap<String, Vec<String>>,
}

/// Text owned by the plugin inside the agent-instructions document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstructionsContribution {
    pub path: String,
    pub content: String,
}

/// Everything applying one plugin does to a project.
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub plugin: String,
    pub directories: Vec<DirectoryCreate>,
    pub files: Vec<FileWrite>,
    pub mcp: Option<McpContribution>,
    pub settings: Option<SettingsContribution>,
    pub instructions: Option<InstructionsContribution>,
}

impl Plan {
    pub fn new(plugin: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            directories: Vec::new(),
            files: Vec::new(),
            mcp: None,
            settings: None,
            instructions: None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty()
            && self.files.is_empty()
            && self.mcp.is_none()
            && self.settings.is_none()
            && self.instructions.is_none()
    }

    pub fn add_directory(&mut self, path: impl Into<String>, parents: bool) {
        let path = path.into();
        match self.directories.iter_mut().find(|dir| dir.path == path) {
            Some(existing) => existing.parents |= parents,
            None => self.directories.push(DirectoryCreate { path, parents }),
        }
    }

    /// Adds a file write; a later write to the same path wins.
    pub fn add_file(&mut self, path: impl Into<String>, content: impl Into<String>, mode: Option<String>) {
        let write = FileWrite {
            path: path.into(),
            content: content.into(),
            mode,
        };
        match self.files.iter_mut().find(|file| file.path == write.path) {
            Some(existing) => *existing = write,
            None => self.files.push(write),
        }
    }

    /// Folds a resource-level sub-plan into this one.
    pub fn merge(&mut self, other: Plan) -> Result<()> {
        for dir in other.directories {
            self.add_directory(dir.path, dir.parents);
        }
        for file in other.files {
            self.add_file(file.path, file.content, file.mode);
        }

        if let Some(incoming) = other.mcp {
            match self.mcp.as_mut() {
                None => self.mcp = Some(incoming),
                Some(current) => {
                    if current.path != incoming.path || current.key != incoming.key {
                        bail!(
                            "conflicting MCP destinations `{}` and `{}`",
                            current.path,
                            incoming.path
                        );
                    }
                    current.servers = merge::merge_server_maps(&current.servers, &incoming.servers);
                    current.inputs = merge::merge_inputs(&current.inputs, &incoming.inputs);
                }
            }
        }

        if let Some(incoming) = other.settings {
            match self.settings.as_mut() {
                None => self.settings = Some(incoming),
                Some(current) => {
                    if current.path != incoming.path {
                        bail!(
                            "conflicting settings destinations `{}` and `{}`",
                            current.path,
                            incoming.path
                        );
                    }
                    for (key, values) in incoming.values {
                        let merged = merge::merge_string_lists(
                            current.values.get(&key).map(Vec::as_slice).unwrap_or_default(),
                            &values,
                        );
                        current.values.insert(key, merged);
                    }
                }
            }
        }

        if let Some(incoming) = other.instructions {
            match self.instructions.as_mut() {
                None => self.instructions = Some(incoming),
                Some(current) => {
                    if current.path != incoming.path {
                        bail!(
                            "conflicting instructions destinations `{}` and `{}`",
                            current.path,
                            incoming.path
                        );
                    }
                    current.content = format!(
                        "{}\n\n{}",
                        current.content.trim_end(),
                        incoming.content.trim_start()
                    );
                }
            }
        }

        Ok(())
    }
}

/// Normalizes a project- or package-relative path to `a/b/c` form.
///
/// Absolute paths and `..` components are rejected so no plan can
/// reach outside the directory it is applied to.
pub fn normalize_relative(path: &str) -> Result<String> {
    let unified = path.replace('\\', "/");
    if unified.starts_with('/') || unified.chars().nth(1) == Some(':') {
        bail!("path `{path}` must be relative");
    }

    let mut parts = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => continue,
            ".." => bail!("path `{path}` must not contain `..`"),
            other => parts.push(other),
        }
    }

    if parts.is_empty() {
        bail!("path `{path}` is empty");
    }
    Ok(parts.join("/"))
}
