use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::bail;
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::{DexError, Result, Stage, StageContext};
use crate::model::package::PackageConfig;
use crate::model::platform::Platform;
use crate::model::project::{
    PROJECT_FILE, PROJECT_PSEUDO_PLUGIN, PluginDeclaration, PluginSpec, ProjectConfig,
};
use crate::plugin::adapter::adapter_for;
use crate::plugin::executor::{ExecutionReport, Executor};
use crate::plugin::lock::{LockFile, LockedPlugin};
use crate::plugin::manifest::Manifest;
use crate::plugin::plan::{InstructionsContribution, Plan};
use crate::plugin::registry::{LocalRegistry, Registry, open_registry, open_source};
use crate::plugin::vars::{Variables, resolve_variables};

/// `resolved` value recorded for the project-instructions pseudo-plugin.
const PROJECT_RESOLVED: &str = "project";

/// Entry configuration for one installer run.
#[derive(Debug, Clone)]
pub struct InstallerOptions {
    pub project_dir: PathBuf,
    /// Overwrite unmanaged files and take over files owned by other plugins.
    pub force: bool,
}

/// What happened to one plugin during install or uninstall.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginOutcome {
    pub plugin: String,
    pub version: Option<String>,
    pub report: ExecutionReport,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Installed,
    Updated,
    UpToDate,
    Pruned,
}

impl SyncAction {
    pub fn label(&self) -> &'static str {
        match self {
            SyncAction::Installed => "installed",
            SyncAction::Updated => "updated",
            SyncAction::UpToDate => "up to date",
            SyncAction::Pruned => "pruned",
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResult {
    pub plugin: String,
    pub action: SyncAction,
    pub old_version: Option<String>,
    pub new_version: Option<String>,
    pub reason: String,
}

/// A desired plugin whose version has been resolved but not yet applied.
enum Pending {
    Package {
        name: String,
        registry: Box<dyn Registry>,
        version: String,
    },
    Project {
        text: String,
        version: String,
    },
}

/// A `dex.toml` change held back until its operation has succeeded.
enum ConfigEdit {
    Declare { name: String, constraint: String },
    Undeclare { name: String },
}

/// Drives resolve → fetch → plan → execute for a project and keeps the
/// manifest and lock in step with what is on disk.
pub struct Installer {
    options: InstallerOptions,
    project: ProjectConfig,
    platform: Platform,
    manifest: Manifest,
    lock: LockFile,
    fallback_registry: Option<PathBuf>,
    config_edits: Vec<ConfigEdit>,
}

impl Installer {
    pub fn new(options: InstallerOptions) -> Result<Self> {
        let project = ProjectConfig::load(&options.project_dir)?;
        let platform = project.platform()?;
        let manifest = Manifest::load(&options.project_dir).map_err(DexError::state)?;
        let lock = LockFile::load(&options.project_dir, platform.id()).map_err(DexError::state)?;

        Ok(Self {
            options,
            project,
            platform,
            manifest,
            lock,
            fallback_registry: None,
            config_edits: Vec::new(),
        })
    }

    /// Registry used when neither the plugin nor the project names one.
    pub fn with_default_registry(mut self, path: Option<PathBuf>) -> Self {
        self.fallback_registry = path;
        self
    }

    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    pub fn platform(&self) -> Platform {
        self.platform
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn lock(&self) -> &LockFile {
        &self.lock
    }

    fn project_dir(&self) -> &Path {
        &self.options.project_dir
    }

    /// Installs `specs`, or every declared plugin when `specs` is empty.
    ///
    /// Declared plugins reinstall at their locked version; explicit specs
    /// resolve their constraint afresh and are added to `dex.toml` when the
    /// project does not declare them yet.
    pub fn install(&mut self, specs: &[PluginSpec]) -> Result<Vec<PluginOutcome>> {
        let outcome = self.install_batch(specs);
        self.finish(outcome)
    }

    fn install_batch(&mut self, specs: &[PluginSpec]) -> Result<Vec<PluginOutcome>> {
        let mut outcomes = Vec::new();

        if specs.is_empty() {
            let names: Vec<String> = self.project.plugins.keys().cloned().collect();
            for name in names {
                let constraint = self.locked_or_declared_constraint(&name);
                outcomes.push(self.install_one(&name, constraint.as_deref())?);
            }
            return Ok(outcomes);
        }

        let mut specs: Vec<&PluginSpec> = specs.iter().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        specs.dedup_by(|a, b| a.name == b.name);

        for spec in specs {
            let constraint = spec.constraint.clone().or_else(|| {
                self.project
                    .plugin(&spec.name)
                    .and_then(|declaration| declaration.version.clone())
            });
            let outcome = self.install_one(&spec.name, constraint.as_deref())?;

            if self.project.plugin(&spec.name).is_none() {
                let recorded = match (spec.constraint.as_deref(), outcome.version.as_deref()) {
                    (Some(constraint), _) => constraint.to_string(),
                    (None, Some(version)) => format!("^{version}"),
                    (None, None) => "*".to_string(),
                };
                self.config_edits.push(ConfigEdit::Declare {
                    name: spec.name.clone(),
                    constraint: recorded.clone(),
                });
                self.project.plugins.insert(
                    spec.name.clone(),
                    PluginDeclaration {
                        version: Some(recorded),
                        ..PluginDeclaration::default()
                    },
                );
            }
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    /// Converges the project onto its declaration.
    ///
    /// Every desired plugin is re-applied, including up-to-date ones, so
    /// managed files deleted by hand come back. With `dry_run` only the
    /// actions are computed.
    pub fn sync(&mut self, dry_run: bool) -> Result<Vec<SyncResult>> {
        let previous_agent = self.lock.agent.clone();
        let platform_changed = previous_agent != self.platform.id();

        let mut results = Vec::new();
        let mut pending = Vec::new();
        let mut desired = BTreeSet::new();

        if let Some(text) = self.project.agent_instructions() {
            let version = project_version(text);
            results.push(self.classify(PROJECT_PSEUDO_PLUGIN, &version, platform_changed, &previous_agent));
            pending.push(Pending::Project {
                text: text.to_string(),
                version,
            });
            desired.insert(PROJECT_PSEUDO_PLUGIN.to_string());
        }

        let names: Vec<String> = self.project.plugins.keys().cloned().collect();
        for name in names {
            let constraint = self.declared_or_locked_constraint(&name);
            let registry = self.registry_for(&name).stage(&name, Stage::Resolve)?;
            let version = registry
                .resolve(&name, constraint.as_deref())
                .stage(&name, Stage::Resolve)?;

            results.push(self.classify(&name, &version, platform_changed, &previous_agent));
            pending.push(Pending::Package {
                name: name.clone(),
                registry,
                version,
            });
            desired.insert(name);
        }

        let prunes: Vec<String> = self
            .lock
            .plugin_names()
            .filter(|name| !desired.contains(*name))
            .map(str::to_string)
            .collect();
        for name in &prunes {
            results.push(SyncResult {
                plugin: name.clone(),
                action: SyncAction::Pruned,
                old_version: self.lock.get(name).map(|entry| entry.version.clone()),
                new_version: None,
                reason: "no longer declared".to_string(),
            });
        }

        if dry_run {
            return Ok(results);
        }

        let outcome = self.apply_sync(pending, &prunes);
        self.finish(outcome.map(|()| results))
    }

    fn apply_sync(&mut self, pending: Vec<Pending>, prunes: &[String]) -> Result<()> {
        for item in pending {
            match item {
                Pending::Package {
                    name,
                    registry,
                    version,
                } => {
                    self.apply_package(&name, registry.as_ref(), &version)?;
                }
                Pending::Project { text, version } => {
                    self.apply_project_instructions(&text, &version)?;
                }
            }
        }

        for name in prunes {
            self.remove_installed(name)?;
        }

        self.lock.agent = self.platform.id().to_string();
        Ok(())
    }

    fn classify(&self, name: &str, version: &str, platform_changed: bool, previous_agent: &str) -> SyncResult {
        let old_version = self.lock.get(name).map(|entry| entry.version.clone());
        let (action, reason) = match old_version.as_deref() {
            None => (SyncAction::Installed, "not installed".to_string()),
            Some(old) if old != version => (SyncAction::Updated, format!("version {old} -> {version}")),
            Some(_) if platform_changed => (
                SyncAction::UpToDate,
                format!("platform changed from {previous_agent} to {}", self.platform),
            ),
            Some(_) => (SyncAction::UpToDate, "up to date".to_string()),
        };

        SyncResult {
            plugin: name.to_string(),
            action,
            old_version,
            new_version: Some(version.to_string()),
            reason,
        }
    }

    /// Removes installed plugins, optionally dropping them from `dex.toml`.
    /// Dependents are not consulted; see [`Installer::find_dependents`].
    pub fn uninstall(&mut self, names: &[String], remove_from_config: bool) -> Result<Vec<PluginOutcome>> {
        let outcome = self.uninstall_batch(names, remove_from_config);
        self.finish(outcome)
    }

    fn uninstall_batch(&mut self, names: &[String], remove_from_config: bool) -> Result<Vec<PluginOutcome>> {
        let mut outcomes = Vec::new();

        for name in names {
            if !self.lock.contains(name) && !self.manifest.contains(name) {
                return Err(DexError::install(name.as_str(), Stage::Uninstall, "plugin is not installed"));
            }

            outcomes.push(self.remove_installed(name)?);

            if remove_from_config {
                self.config_edits.push(ConfigEdit::Undeclare { name: name.clone() });
                self.project.plugins.remove(name);
            }
        }

        Ok(outcomes)
    }

    /// Installed plugins that declare a direct dependency on `name`.
    pub fn find_dependents(&self, name: &str) -> Vec<String> {
        self.lock.find_dependents(name)
    }

    /// Reinstalls pin the locked version; only unlocked plugins resolve
    /// their declared constraint.
    fn locked_or_declared_constraint(&self, name: &str) -> Option<String> {
        self.lock
            .get(name)
            .map(|entry| format!("={}", entry.version))
            .or_else(|| self.project.plugin(name).and_then(|declaration| declaration.version.clone()))
    }

    fn declared_or_locked_constraint(&self, name: &str) -> Option<String> {
        self.project
            .plugin(name)
            .and_then(|declaration| declaration.version.clone())
            .or_else(|| self.lock.get(name).map(|entry| format!("={}", entry.version)))
    }

    fn registry_for(&self, name: &str) -> anyhow::Result<Box<dyn Registry>> {
        let declaration = self.project.plugin(name);
        let root = self.project.root();

        if let Some(source) = declaration.and_then(|declaration| declaration.source.as_deref()) {
            return open_source(source, root);
        }
        if let Some((_, registry)) = self.project.registry_for(declaration) {
            return open_registry(registry.path.as_deref(), registry.url.as_deref(), root);
        }
        if let Some(path) = self.fallback_registry.as_ref() {
            return Ok(Box::new(LocalRegistry::new(path.clone())));
        }
        bail!("no registry for `{name}`: declare a `source`, a [registries] entry or a user default_registry")
    }

    fn install_one(&mut self, name: &str, constraint: Option<&str>) -> Result<PluginOutcome> {
        let registry = self.registry_for(name).stage(name, Stage::Resolve)?;
        let version = registry.resolve(name, constraint).stage(name, Stage::Resolve)?;
        self.apply_package(name, registry.as_ref(), &version)
    }

    fn apply_package(&mut self, name: &str, registry: &dyn Registry, version: &str) -> Result<PluginOutcome> {
        info!("{name}: installing {version} from {}", registry.describe());

        // Removed when dropped, on every exit path.
        let scratch = tempfile::Builder::new()
            .prefix("dex-")
            .tempdir()
            .stage(name, Stage::Fetch)?;
        let fetched = registry
            .fetch(name, version, scratch.path())
            .stage(name, Stage::Fetch)?;

        let package = PackageConfig::load(&fetched.root).stage(name, Stage::Parse)?;
        self.validate_package(name, version, &package)?;

        let configured = self
            .project
            .plugin(name)
            .map(PluginDeclaration::config_strings)
            .unwrap_or_default();
        let builtins = Variables::from([
            ("plugin_name".to_string(), package.name().to_string()),
            ("plugin_version".to_string(), package.version().to_string()),
            ("platform".to_string(), self.platform.id().to_string()),
            ("project_dir".to_string(), self.project_dir().display().to_string()),
        ]);
        let vars = resolve_variables(&package, &configured, builtins, |key| std::env::var(key).ok())
            .stage(name, Stage::Configure)?;

        let plan = adapter_for(self.platform)
            .plan(&package, &vars)
            .stage(name, Stage::Plan)?;

        let report = Executor::new(&self.options.project_dir, &mut self.manifest, self.options.force)
            .execute(&plan, &vars)?;

        self.lock.insert(
            name,
            LockedPlugin {
                version: package.version().to_string(),
                resolved: fetched.resolved,
                integrity: fetched.integrity,
                dependencies: package.dependencies.clone(),
            },
        );

        Ok(PluginOutcome {
            plugin: name.to_string(),
            version: Some(package.version().to_string()),
            report,
        })
    }

    fn validate_package(&self, name: &str, version: &str, package: &PackageConfig) -> Result<()> {
        package.validate().stage(name, Stage::Validate)?;

        if package.name() != name {
            return Err(DexError::install(
                name,
                Stage::Validate,
                format!("package declares name `{}`", package.name()),
            ));
        }
        if package.version() != version {
            return Err(DexError::install(
                name,
                Stage::Validate,
                format!("package declares version {} but {version} was resolved", package.version()),
            ));
        }
        if !package.supports(self.platform) {
            return Err(DexError::install(
                name,
                Stage::Validate,
                format!(
                    "{} is not supported (package targets {})",
                    self.platform,
                    package.package.platforms.join(", ")
                ),
            ));
        }

        for dependency in package.dependencies.keys() {
            if self.project.plugin(dependency).is_none() && !self.lock.contains(dependency) {
                warn!("{name}: dependency `{dependency}` is neither declared nor installed");
            }
        }
        Ok(())
    }

    fn apply_project_instructions(&mut self, text: &str, version: &str) -> Result<PluginOutcome> {
        let mut plan = Plan::new(PROJECT_PSEUDO_PLUGIN);
        plan.instructions = Some(InstructionsContribution {
            path: self.platform.layout().instructions_path.to_string(),
            content: text.to_string(),
        });

        let report = Executor::new(&self.options.project_dir, &mut self.manifest, self.options.force)
            .execute(&plan, &Variables::new())?;

        self.lock.insert(
            PROJECT_PSEUDO_PLUGIN,
            LockedPlugin {
                version: version.to_string(),
                resolved: PROJECT_RESOLVED.to_string(),
                integrity: format!("sha256-{}", sha256_hex(text)),
                dependencies: Default::default(),
            },
        );

        Ok(PluginOutcome {
            plugin: PROJECT_PSEUDO_PLUGIN.to_string(),
            version: Some(version.to_string()),
            report,
        })
    }

    fn remove_installed(&mut self, name: &str) -> Result<PluginOutcome> {
        let report = Executor::new(&self.options.project_dir, &mut self.manifest, self.options.force)
            .remove(name)?
            .unwrap_or_default();
        let version = self.lock.remove(name).map(|entry| entry.version);
        info!("{name}: removed");

        Ok(PluginOutcome {
            plugin: name.to_string(),
            version,
            report,
        })
    }

    fn persist(&self) -> Result<()> {
        self.manifest.save().map_err(DexError::state)?;
        self.lock.save().map_err(DexError::state)
    }

    /// Persists the manifest, the lock and any `dex.toml` edits once the
    /// whole batch has succeeded. A failed batch persists nothing: in-memory
    /// state goes back to what is on disk, and files the batch wrote are
    /// left unmanaged.
    fn finish<T>(&mut self, outcome: Result<T>) -> Result<T> {
        let edits = std::mem::take(&mut self.config_edits);
        match outcome {
            Ok(value) => {
                self.persist()?;
                self.apply_config_edits(edits)?;
                Ok(value)
            }
            Err(err) => {
                if let Err(reload_err) = self.reload() {
                    warn!("could not reload state after failure: {reload_err}");
                }
                Err(err)
            }
        }
    }

    fn apply_config_edits(&self, edits: Vec<ConfigEdit>) -> Result<()> {
        for edit in edits {
            match edit {
                ConfigEdit::Declare { name, constraint } => {
                    ProjectConfig::add_plugin(self.project_dir(), &name, &constraint)
                        .stage(&name, Stage::Install)?;
                    info!("{name}: added to {}", PROJECT_FILE);
                }
                ConfigEdit::Undeclare { name } => {
                    let removed = ProjectConfig::remove_plugin(self.project_dir(), &name)
                        .stage(&name, Stage::Uninstall)?;
                    if removed {
                        info!("{name}: removed from {}", PROJECT_FILE);
                    }
                }
            }
        }
        Ok(())
    }

    fn reload(&mut self) -> Result<()> {
        self.project = ProjectConfig::load(&self.options.project_dir)?;
        self.manifest = Manifest::load(&self.options.project_dir).map_err(DexError::state)?;
        self.lock = LockFile::load(&self.options.project_dir, self.platform.id()).map_err(DexError::state)?;
        Ok(())
    }
}

fn sha256_hex(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}

/// Version of the project-instructions pseudo-plugin: a short content hash,
/// so an edit shows up as an update.
fn project_version(text: &str) -> String {
    sha256_hex(text.trim())[..12].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn project(raw: &str) -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("dex.toml"), raw).unwrap();
        dir
    }

    fn installer(dir: &TempDir) -> Installer {
        Installer::new(InstallerOptions {
            project_dir: dir.path().to_path_buf(),
            force: false,
        })
        .unwrap()
    }

    #[test]
    fn project_version_tracks_trimmed_text() {
        assert_eq!(project_version("Use pnpm."), project_version("  Use pnpm.\n"));
        assert_ne!(project_version("Use pnpm."), project_version("Use yarn."));
        assert_eq!(project_version("x").len(), 12);
    }

    #[test]
    fn project_instructions_sync_as_pseudo_plugin() {
        let dir = project(
            r#"
[project]
agent = "claude-code"
agent_instructions = "Use pnpm."
"#,
        );
        let mut installer = installer(&dir);

        let results = installer.sync(false).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].plugin, PROJECT_PSEUDO_PLUGIN);
        assert_eq!(results[0].action, SyncAction::Installed);
        assert_eq!(fs::read_to_string(dir.path().join("CLAUDE.md")).unwrap(), "Use pnpm.\n");

        let locked = installer.lock().get(PROJECT_PSEUDO_PLUGIN).unwrap();
        assert_eq!(locked.resolved, "project");

        let again = installer.sync(false).unwrap();
        assert_eq!(again[0].action, SyncAction::UpToDate);
        assert_eq!(again[0].reason, "up to date");
    }

    #[test]
    fn unknown_plugin_uninstall_fails_at_uninstall_stage() {
        let dir = project("[project]\nagent = \"cursor\"\n");
        let err = installer(&dir).uninstall(&["ghost".to_string()], false).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Uninstall));
        assert_eq!(err.plugin(), Some("ghost"));
    }

    #[test]
    fn plugin_without_registry_fails_to_resolve() {
        let dir = project("[project]\nagent = \"cursor\"\n\n[plugins.lonely]\n");
        let err = installer(&dir).install(&[]).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Resolve));
        assert!(err.to_string().contains("no registry"));
    }

    #[test]
    fn missing_project_file_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        let err = Installer::new(InstallerOptions {
            project_dir: dir.path().to_path_buf(),
            force: false,
        })
        .err()
        .unwrap();
        assert!(matches!(err, DexError::Config(_)));
    }
}
