use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;

use crate::model::platform::Platform;
use crate::model::project::{parse_constraint, validate_plugin_name};
use crate::plugin::plan::normalize_relative;

pub const PACKAGE_FILE: &str = "package.toml";

/// A fetched plugin package's own declaration.
#[derive(Debug, Clone, Deserialize)]
pub struct PackageConfig {
    pub package: PackageSection,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(default)]
    pub variables: BTreeMap<String, VariableDecl>,
    #[serde(default)]
    pub skills: Vec<SkillDecl>,
    #[serde(default)]
    pub commands: Vec<CommandDecl>,
    #[serde(default)]
    pub rules: Vec<RuleDecl>,
    #[serde(default)]
    pub mcp_servers: Vec<McpServerDecl>,
    #[serde(default)]
    pub files: Vec<FileDecl>,
    #[serde(default)]
    pub settings: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub agent_instructions: Option<InstructionsDecl>,
    #[serde(skip)]
    root: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PackageSection {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub platforms: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VariableDecl {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub env: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SkillDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Directory inside the package holding `SKILL.md` and its assets.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommandDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuleDecl {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub path: String,
    #[serde(default)]
    pub globs: Vec<String>,
    #[serde(default)]
    pub always_apply: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpServerDecl {
    pub name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub inputs: Vec<McpInputDecl>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct McpInputDecl {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub password: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileDecl {
    pub src: String,
    pub dest: String,
    #[serde(default)]
    pub mode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstructionsDecl {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

impl PackageConfig {
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(PACKAGE_FILE);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&raw, root).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn parse(raw: &str, root: &Path) -> Result<Self> {
        let mut config: PackageConfig = toml::from_str(raw)?;
        config.root = root.to_path_buf();
        Ok(config)
    }

    pub fn name(&self) -> &str {
        &self.package.name
    }

    pub fn version(&self) -> &str {
        &self.package.version
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Structural checks that do not depend on the target project.
    pub fn validate(&self) -> Result<()> {
        validate_plugin_name(&self.package.name).map_err(|err| anyhow!(err))?;
        semver::Version::parse(&self.package.version)
            .with_context(|| format!("invalid package version `{}`", self.package.version))?;

        for platform in &self.package.platforms {
            platform.parse::<Platform>()?;
        }

        for (dependency, constraint) in &self.dependencies {
            validate_plugin_name(dependency).map_err(|err| anyhow!(err))?;
            parse_constraint(constraint).with_context(|| {
                format!("invalid constraint `{constraint}` for dependency `{dependency}`")
            })?;
        }

        let resource_names = self
            .skills
            .iter()
            .map(|skill| &skill.name)
            .chain(self.commands.iter().map(|command| &command.name))
            .chain(self.rules.iter().map(|rule| &rule.name))
            .chain(self.mcp_servers.iter().map(|server| &server.name));
        for name in resource_names {
            validate_plugin_name(name).map_err(|err| anyhow!("resource: {err}"))?;
        }

        for server in &self.mcp_servers {
            match (&server.command, &server.url) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => bail!(
                    "mcp server `{}` needs exactly one of `command` or `url`",
                    server.name
                ),
            }
        }

        for file in &self.files {
            normalize_relative(&file.dest)
                .with_context(|| format!("invalid destination `{}`", file.dest))?;
        }

        if let Some(instructions) = self.agent_instructions.as_ref() {
            if instructions.content.is_some() == instructions.path.is_some() {
                bail!("[agent_instructions] needs exactly one of `content` or `path`");
            }
        }

        Ok(())
    }

    /// An empty platform list means the package runs everywhere.
    pub fn supports(&self, platform: Platform) -> bool {
        self.package.platforms.is_empty()
            || self
                .package
                .platforms
                .iter()
                .any(|id| id.parse::<Platform>().is_ok_and(|p| p == platform))
    }

    /// Absolute path of a package-relative path, refusing to leave the package.
    pub fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let normalized = normalize_relative(relative)
            .with_context(|| format!("invalid package path `{relative}`"))?;
        Ok(self.root.join(normalized))
    }

    pub fn read(&self, relative: &str) -> Result<String> {
        let path = self.resolve(relative)?;
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))
    }

    pub fn instructions(&self) -> Result<Option<String>> {
        let Some(decl) = self.agent_instructions.as_ref() else {
            return Ok(None);
        };
        let text = match (&decl.content, &decl.path) {
            (Some(content), _) => content.clone(),
            (None, Some(path)) => self.read(path)?,
            (None, None) => return Ok(None),
        };
        let trimmed = text.trim();
        Ok((!trimmed.is_empty()).then(|| trimmed.to_string()))
    }
}
