//! Applies one plugin's [`Plan`] to a project directory.
//!
//! Applying is convergent: whatever the plugin's manifest record says it
//! wrote before but the new plan no longer contains is taken back out, so
//! an empty plan removes the plugin from disk entirely. Files and shared
//! documents whose content would not change are left untouched.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, anyhow, bail};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{DexError, Result, Stage, StageContext};
use crate::model::project::PROJECT_PSEUDO_PLUGIN;
use crate::plugin::instructions::InstructionsDocument;
use crate::plugin::manifest::{Manifest, PluginRecord};
use crate::plugin::merge;
use crate::plugin::plan::{FileWrite, Plan, normalize_relative};
use crate::plugin::vars::{Variables, substitute};

const DEFAULT_FILE_MODE: u32 = 0o644;

/// What one application changed on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub written: usize,
    pub unchanged: usize,
    pub removed: usize,
}

impl ExecutionReport {
    pub fn is_noop(&self) -> bool {
        self.written == 0 && self.removed == 0
    }
}

pub struct Executor<'a> {
    project_dir: &'a Path,
    manifest: &'a mut Manifest,
    force: bool,
}

impl<'a> Executor<'a> {
    pub fn new(project_dir: &'a Path, manifest: &'a mut Manifest, force: bool) -> Self {
        Self {
            project_dir,
            manifest,
            force,
        }
    }

    /// Applies `plan`, replacing whatever the plugin contributed before.
    pub fn execute(&mut self, plan: &Plan, vars: &Variables) -> Result<ExecutionReport> {
        self.apply(plan, vars, Stage::Install)
    }

    /// Takes everything the plugin contributed back out and forgets it.
    /// Returns `None` when the manifest has no record of the plugin.
    pub fn remove(&mut self, plugin: &str) -> Result<Option<ExecutionReport>> {
        if !self.manifest.contains(plugin) {
            return Ok(None);
        }
        let report = self.apply(&Plan::new(plugin), &Variables::new(), Stage::Uninstall)?;
        self.manifest.untrack(plugin);
        Ok(Some(report))
    }

    fn apply(&mut self, plan: &Plan, vars: &Variables, stage: Stage) -> Result<ExecutionReport> {
        let plugin = plan.plugin.as_str();
        let prior = self.manifest.plugin(plugin).cloned().unwrap_or_default();
        let mut report = ExecutionReport::default();

        let writes = self.check_conflicts(plan).map_err(|err| match err {
            CheckError::Conflict(path) => DexError::Conflict {
                plugin: plugin.to_string(),
                path: self.project_dir.join(path),
            },
            CheckError::Invalid(err) => DexError::install(plugin, stage, format!("{err:#}")),
        })?;

        let mut directories = BTreeSet::new();
        for dir in &plan.directories {
            let relative = normalize_relative(&dir.path).stage(plugin, stage)?;
            let path = self.project_dir.join(&relative);
            if dir.parents {
                fs::create_dir_all(&path)
            } else if path.is_dir() {
                Ok(())
            } else {
                fs::create_dir(&path)
            }
            .with_context(|| format!("creating directory {relative}"))
            .stage(plugin, stage)?;
            directories.insert(relative);
        }

        let mut files = BTreeSet::new();
        for (relative, file) in writes {
            let mode = parse_mode(file.mode.as_deref()).stage(plugin, stage)?;
            let content = substitute(&file.content, vars);
            let changed = write_if_changed(&self.project_dir.join(&relative), &content, mode)
                .with_context(|| format!("writing {relative}"))
                .stage(plugin, stage)?;
            if changed {
                debug!("{plugin}: wrote {relative}");
                report.written += 1;
            } else {
                report.unchanged += 1;
            }
            files.insert(relative);
        }

        let shared = self
            .apply_shared(plan, vars, &prior, &mut report)
            .stage(plugin, stage)?;

        for relative in prior.files.difference(&files) {
            if self.manifest.owner(relative) != Some(plugin) {
                continue;
            }
            let path = self.project_dir.join(relative);
            if remove_file_if_exists(&path)
                .with_context(|| format!("removing {relative}"))
                .stage(plugin, stage)?
            {
                debug!("{plugin}: removed {relative}");
                report.removed += 1;
            }
        }

        for relative in prior.directories_deepest_first() {
            if directories.contains(relative) {
                continue;
            }
            if remove_dir_if_empty(&self.project_dir.join(relative))
                .with_context(|| format!("removing directory {relative}"))
                .stage(plugin, stage)?
            {
                debug!("{plugin}: removed directory {relative}");
            }
        }

        self.manifest.replace_tracked(plugin, files, directories);
        self.manifest.replace_merged_files(plugin, shared.merged_files);
        self.manifest.replace_mcp_servers(plugin, shared.mcp_servers);
        self.manifest.replace_settings(plugin, shared.settings);
        self.manifest.replace_agent_content(plugin, shared.has_agent_content);

        info!(
            "{plugin}: {} written, {} unchanged, {} removed",
            report.written, report.unchanged, report.removed
        );
        Ok(report)
    }

    /// Validates every destination before anything is written, so a conflict
    /// on the last file does not leave the first ones behind.
    fn check_conflicts<'p>(
        &mut self,
        plan: &'p Plan,
    ) -> std::result::Result<Vec<(String, &'p FileWrite)>, CheckError> {
        let plugin = plan.plugin.as_str();
        let mut writes = Vec::with_capacity(plan.files.len());
        let mut transfers = Vec::new();

        for file in &plan.files {
            let relative = normalize_relative(&file.path).map_err(CheckError::Invalid)?;
            let exists = self.project_dir.join(&relative).exists();

            match self.manifest.owner(&relative) {
                Some(owner) if owner == plugin => {}
                Some(owner) => {
                    if !self.force {
                        return Err(CheckError::Conflict(relative));
                    }
                    warn!("{plugin}: taking over {relative} from plugin {owner} (--force)");
                    transfers.push(relative.clone());
                }
                None if exists => {
                    if !self.force {
                        return Err(CheckError::Conflict(relative));
                    }
                    warn!("{plugin}: overwriting unmanaged file {relative} (--force)");
                }
                None => {}
            }

            writes.push((relative, file));
        }

        for relative in transfers {
            self.manifest.release_file(&relative);
        }
        Ok(writes)
    }

    fn apply_shared(
        &self,
        plan: &Plan,
        vars: &Variables,
        prior: &PluginRecord,
        report: &mut ExecutionReport,
    ) -> anyhow::Result<SharedContribution> {
        let plugin = plan.plugin.as_str();
        let mut docs = SharedDocs::new(self.project_dir);
        let mut contribution = SharedContribution::default();

        if let Some(mcp) = plan.mcp.as_ref() {
            let relative = normalize_relative(&mcp.path)?;
            let doc = docs.json(&relative)?;
            *doc = merge::merge_mcp(doc, mcp.key, &mcp.servers, &mcp.inputs);
            contribution.mcp_servers = mcp.servers.keys().cloned().collect();
            contribution.merged_files.insert(relative);
        }

        if let Some(settings) = plan.settings.as_ref() {
            let values: BTreeMap<String, BTreeSet<String>> = settings
                .values
                .iter()
                .filter(|(_, list)| !list.is_empty())
                .map(|(key, list)| (key.clone(), list.iter().cloned().collect()))
                .collect();
            if !values.is_empty() {
                let relative = normalize_relative(&settings.path)?;
                let doc = docs.json(&relative)?;
                *doc = merge::merge_settings(doc, &settings.values);
                contribution.settings = values;
                contribution.merged_files.insert(relative);
            }
        }

        if let Some(instructions) = plan.instructions.as_ref() {
            let relative = normalize_relative(&instructions.path)?;
            let content = substitute(&instructions.content, vars);
            let doc = docs.text(&relative)?;
            if plugin == PROJECT_PSEUDO_PLUGIN {
                doc.set_project(&content);
            } else {
                doc.set_region(plugin, &content);
            }
            contribution.has_agent_content = true;
            contribution.merged_files.insert(relative);
        }

        for relative in &prior.merged_files {
            let still_shared = contribution.merged_files.contains(relative);

            if is_json_path(relative) {
                let stale_servers: BTreeSet<String> = prior
                    .mcp_servers
                    .iter()
                    .filter(|server| !(still_shared && contribution.mcp_servers.contains(*server)))
                    .filter(|server| !self.manifest.is_mcp_server_used_by_others(plugin, relative, server))
                    .cloned()
                    .collect();

                let doc = docs.json(relative)?;
                if !stale_servers.is_empty() {
                    *doc = merge::remove_mcp_servers(doc, &stale_servers);
                }

                for (key, values) in &prior.settings {
                    let kept = contribution.settings.get(key).filter(|_| still_shared);
                    let stale: BTreeSet<String> = values
                        .iter()
                        .filter(|value| !kept.is_some_and(|kept| kept.contains(*value)))
                        .filter(|value| {
                            !self
                                .manifest
                                .is_settings_value_used_by_others(plugin, relative, key, value)
                        })
                        .cloned()
                        .collect();
                    if !stale.is_empty() {
                        *doc = merge::remove_settings_values(doc, key, &stale);
                    }
                }
            } else if prior.has_agent_content && !(still_shared && contribution.has_agent_content) {
                let doc = docs.text(relative)?;
                if plugin == PROJECT_PSEUDO_PLUGIN {
                    doc.set_project("");
                } else {
                    doc.remove_region(plugin);
                }
            }
        }

        let (written, removed) = docs.flush()?;
        report.written += written;
        report.removed += removed;
        Ok(contribution)
    }
}

enum CheckError {
    Conflict(String),
    Invalid(anyhow::Error),
}

#[derive(Debug, Default)]
struct SharedContribution {
    merged_files: BTreeSet<String>,
    mcp_servers: BTreeSet<String>,
    settings: BTreeMap<String, BTreeSet<String>>,
    has_agent_content: bool,
}

enum SharedDoc {
    Json(Map<String, Value>),
    Text(InstructionsDocument),
}

/// Shared documents loaded once per application and written back at the end.
struct SharedDocs<'p> {
    root: &'p Path,
    docs: BTreeMap<String, (Option<String>, SharedDoc)>,
}

impl<'p> SharedDocs<'p> {
    fn new(root: &'p Path) -> Self {
        Self {
            root,
            docs: BTreeMap::new(),
        }
    }

    fn load(&mut self, relative: &str, json: bool) -> anyhow::Result<&mut SharedDoc> {
        if !self.docs.contains_key(relative) {
            let path = self.root.join(relative);
            let original = match fs::read_to_string(&path) {
                Ok(text) => Some(text),
                Err(err) if err.kind() == io::ErrorKind::NotFound => None,
                Err(err) => return Err(err).with_context(|| format!("reading {relative}")),
            };
            let text = original.as_deref().unwrap_or_default();

            let doc = if json {
                let map = if text.trim().is_empty() {
                    Map::new()
                } else {
                    match serde_json::from_str::<Value>(text)
                        .with_context(|| format!("parsing {relative}"))?
                    {
                        Value::Object(map) => map,
                        _ => bail!("{relative} is not a JSON object"),
                    }
                };
                SharedDoc::Json(map)
            } else {
                SharedDoc::Text(InstructionsDocument::parse(text))
            };
            self.docs.insert(relative.to_string(), (original, doc));
        }

        self.docs
            .get_mut(relative)
            .map(|(_, doc)| doc)
            .ok_or_else(|| anyhow!("{relative} vanished from the document cache"))
    }

    fn json(&mut self, relative: &str) -> anyhow::Result<&mut Map<String, Value>> {
        match self.load(relative, true)? {
            SharedDoc::Json(map) => Ok(map),
            SharedDoc::Text(_) => bail!("{relative} is not a JSON document"),
        }
    }

    fn text(&mut self, relative: &str) -> anyhow::Result<&mut InstructionsDocument> {
        match self.load(relative, false)? {
            SharedDoc::Text(doc) => Ok(doc),
            SharedDoc::Json(_) => bail!("{relative} is not a text document"),
        }
    }

    /// Writes changed documents and deletes emptied ones. Returns (written, removed).
    fn flush(self) -> anyhow::Result<(usize, usize)> {
        let mut written = 0;
        let mut removed = 0;

        for (relative, (original, doc)) in self.docs {
            let rendered = match &doc {
                SharedDoc::Json(map) if map.is_empty() => None,
                SharedDoc::Json(map) => {
                    let mut text = serde_json::to_string_pretty(map)?;
                    text.push('\n');
                    Some(text)
                }
                SharedDoc::Text(doc) if doc.is_empty() => None,
                SharedDoc::Text(doc) => Some(doc.render()),
            };

            let path = self.root.join(&relative);
            match rendered {
                None => {
                    if original.is_some() && remove_file_if_exists(&path)? {
                        debug!("removed emptied shared file {relative}");
                        removed += 1;
                    }
                }
                Some(text) if original.as_deref() == Some(text.as_str()) => {}
                Some(text) => {
                    if let Some(parent) = path.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    fs::write(&path, text).with_context(|| format!("writing {relative}"))?;
                    debug!("updated shared file {relative}");
                    written += 1;
                }
            }
        }

        Ok((written, removed))
    }
}

fn is_json_path(relative: &str) -> bool {
    relative.ends_with(".json")
}

/// Parses an octal mode such as `755`, `0755` or `0o755`.
fn parse_mode(mode: Option<&str>) -> anyhow::Result<u32> {
    let Some(raw) = mode else {
        return Ok(DEFAULT_FILE_MODE);
    };
    let digits = raw.trim().trim_start_matches("0o");
    let value = u32::from_str_radix(digits, 8).with_context(|| format!("invalid file mode `{raw}`"))?;
    if value > 0o7777 {
        bail!("invalid file mode `{raw}`");
    }
    Ok(value)
}

/// Returns whether the file's content or mode changed.
fn write_if_changed(path: &Path, content: &str, mode: u32) -> io::Result<bool> {
    let same_content = fs::read(path).is_ok_and(|existing| existing == content.as_bytes());
    if !same_content {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content)?;
    }
    let mode_changed = apply_mode(path, mode)?;
    Ok(!same_content || mode_changed)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let current = fs::metadata(path)?.permissions().mode() & 0o7777;
    if current == mode {
        return Ok(false);
    }
    fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    Ok(true)
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> io::Result<bool> {
    Ok(false)
}

fn remove_file_if_exists(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn remove_dir_if_empty(path: &Path) -> io::Result<bool> {
    if !path.is_dir() || fs::read_dir(path)?.next().is_some() {
        return Ok(false);
    }
    fs::remove_dir(path)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::platform::McpKey;
    use crate::plugin::plan::{InstructionsContribution, McpContribution, SettingsContribution};
    use serde_json::json;
    use tempfile::TempDir;

    fn read(root: &Path, relative: &str) -> String {
        fs::read_to_string(root.join(relative)).unwrap()
    }

    fn read_json(root: &Path, relative: &str) -> Value {
        serde_json::from_str(&read(root, relative)).unwrap()
    }

    fn full_plan(plugin: &str) -> Plan {
        let mut plan = Plan::new(plugin);
        plan.add_directory(format!(".claude/skills/{plugin}"), true);
        plan.add_file(
            format!(".claude/skills/{plugin}/SKILL.md"),
            "Skill for ${plugin_name}",
            None,
        );
        plan.mcp = Some(McpContribution {
            path: ".mcp.json".into(),
            key: McpKey::McpServers,
            servers: json!({ plugin: {"command": plugin} }).as_object().cloned().unwrap(),
            inputs: Vec::new(),
        });
        plan.settings = Some(SettingsContribution {
            path: ".claude/settings.json".into(),
            values: BTreeMap::from([("allow".to_string(), vec![format!("bash:{plugin} *")])]),
        });
        plan.instructions = Some(InstructionsContribution {
            path: "CLAUDE.md".into(),
            content: format!("Rules from {plugin}."),
        });
        plan
    }

    fn settings_plan(plugin: &str, allow: &[&str]) -> Plan {
        let mut plan = Plan::new(plugin);
        plan.settings = Some(SettingsContribution {
            path: ".claude/settings.json".into(),
            values: BTreeMap::from([(
                "allow".to_string(),
                allow.iter().map(|v| v.to_string()).collect(),
            )]),
        });
        plan
    }

    fn vars(plugin: &str) -> Variables {
        Variables::from([("plugin_name".to_string(), plugin.to_string())])
    }

    #[test]
    fn applying_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut manifest = Manifest::default();
        let plan = full_plan("alpha");

        let first = Executor::new(root, &mut manifest, false)
            .execute(&plan, &vars("alpha"))
            .unwrap();
        let record_after_first = manifest.plugin("alpha").cloned();
        let skill_after_first = read(root, ".claude/skills/alpha/SKILL.md");

        let second = Executor::new(root, &mut manifest, false)
            .execute(&plan, &vars("alpha"))
            .unwrap();

        assert_eq!(first.written, 4);
        assert!(second.is_noop());
        assert_eq!(second.unchanged, 1);
        assert_eq!(manifest.plugin("alpha").cloned(), record_after_first);
        assert_eq!(read(root, ".claude/skills/alpha/SKILL.md"), skill_after_first);
        assert_eq!(skill_after_first, "Skill for alpha");

        let record = manifest.plugin("alpha").unwrap();
        assert!(record.has_agent_content);
        assert_eq!(record.mcp_servers.len(), 1);
        assert_eq!(record.merged_files.len(), 3);
    }

    #[test]
    fn untracked_file_conflicts_unless_forced() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join(".claude/skills/alpha")).unwrap();
        fs::write(root.join(".claude/skills/alpha/SKILL.md"), "mine").unwrap();

        let mut manifest = Manifest::default();
        let plan = full_plan("alpha");

        let err = Executor::new(root, &mut manifest, false)
            .execute(&plan, &vars("alpha"))
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(read(root, ".claude/skills/alpha/SKILL.md"), "mine");
        assert!(!root.join(".mcp.json").exists());
        assert!(manifest.plugin("alpha").is_none());

        Executor::new(root, &mut manifest, true)
            .execute(&plan, &vars("alpha"))
            .unwrap();
        assert_eq!(read(root, ".claude/skills/alpha/SKILL.md"), "Skill for alpha");
        assert!(manifest.is_tracked(".claude/skills/alpha/SKILL.md"));
    }

    #[test]
    fn file_owned_by_another_plugin_conflicts_and_force_transfers() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut manifest = Manifest::default();

        let mut a = Plan::new("a");
        a.add_file("shared.md", "from a", None);
        Executor::new(root, &mut manifest, false).execute(&a, &Variables::new()).unwrap();

        let mut b = Plan::new("b");
        b.add_file("shared.md", "from b", None);
        let err = Executor::new(root, &mut manifest, false)
            .execute(&b, &Variables::new())
            .unwrap_err();
        assert!(err.is_conflict());

        Executor::new(root, &mut manifest, true).execute(&b, &Variables::new()).unwrap();
        assert_eq!(manifest.owner("shared.md"), Some("b"));
        assert!(manifest.plugin("a").unwrap().files.is_empty());
    }

    #[test]
    fn empty_plan_removes_everything_previously_applied() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("CLAUDE.md"), "Project text.\n").unwrap();
        let mut manifest = Manifest::default();

        Executor::new(root, &mut manifest, false)
            .execute(&full_plan("alpha"), &vars("alpha"))
            .unwrap();
        Executor::new(root, &mut manifest, false)
            .execute(&Plan::new("alpha"), &Variables::new())
            .unwrap();

        assert!(!root.join(".claude/skills/alpha").exists());
        assert!(!root.join(".mcp.json").exists());
        assert!(!root.join(".claude/settings.json").exists());
        assert_eq!(read(root, "CLAUDE.md"), "Project text.\n");
        assert!(manifest.plugin("alpha").unwrap().is_empty());
    }

    #[test]
    fn shrinking_plan_retires_stale_servers_and_settings() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut manifest = Manifest::default();

        let mut plan = Plan::new("p");
        plan.mcp = Some(McpContribution {
            path: ".mcp.json".into(),
            key: McpKey::McpServers,
            servers: json!({"one": {"command": "1"}, "two": {"command": "2"}})
                .as_object()
                .cloned()
                .unwrap(),
            inputs: Vec::new(),
        });
        Executor::new(root, &mut manifest, false).execute(&plan, &Variables::new()).unwrap();

        if let Some(mcp) = plan.mcp.as_mut() {
            mcp.servers = json!({"two": {"command": "2"}}).as_object().cloned().unwrap();
        }
        Executor::new(root, &mut manifest, false).execute(&plan, &Variables::new()).unwrap();

        assert_eq!(read_json(root, ".mcp.json"), json!({"mcpServers": {"two": {"command": "2"}}}));
        assert_eq!(manifest.plugin("p").unwrap().mcp_servers.len(), 1);
    }

    #[test]
    fn shared_settings_values_survive_until_last_contributor_leaves() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut manifest = Manifest::default();

        let a = settings_plan("a", &["bash:npm run *", "write:*.ts"]);
        let b = settings_plan("b", &["bash:npm run *", "bash:yarn *"]);
        Executor::new(root, &mut manifest, false).execute(&a, &Variables::new()).unwrap();
        Executor::new(root, &mut manifest, false).execute(&b, &Variables::new()).unwrap();

        Executor::new(root, &mut manifest, false).remove("a").unwrap();
        assert_eq!(
            read_json(root, ".claude/settings.json")["allow"],
            json!(["bash:npm run *", "bash:yarn *"])
        );

        Executor::new(root, &mut manifest, false).remove("b").unwrap();
        assert!(!root.join(".claude/settings.json").exists());
        assert!(manifest.plugin("b").is_none());
    }

    #[test]
    fn merge_result_is_independent_of_install_order() {
        let install = |order: [&str; 2]| {
            let dir = TempDir::new().unwrap();
            let mut manifest = Manifest::default();
            for plugin in order {
                Executor::new(dir.path(), &mut manifest, false)
                    .execute(&full_plan(plugin), &vars(plugin))
                    .unwrap();
            }
            let mcp = read_json(dir.path(), ".mcp.json");
            let servers: BTreeSet<String> =
                mcp["mcpServers"].as_object().unwrap().keys().cloned().collect();
            let settings = read_json(dir.path(), ".claude/settings.json");
            let allow: BTreeSet<String> = settings["allow"]
                .as_array()
                .unwrap()
                .iter()
                .map(|v| v.as_str().unwrap().to_string())
                .collect();
            (servers, allow)
        };

        assert_eq!(install(["a", "b"]), install(["b", "a"]));
    }

    #[test]
    fn project_instructions_precede_plugin_regions() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let mut manifest = Manifest::default();

        Executor::new(root, &mut manifest, false)
            .execute(&full_plan("alpha"), &vars("alpha"))
            .unwrap();

        let mut project = Plan::new(PROJECT_PSEUDO_PLUGIN);
        project.instructions = Some(InstructionsContribution {
            path: "CLAUDE.md".into(),
            content: "Use pnpm.".into(),
        });
        Executor::new(root, &mut manifest, false)
            .execute(&project, &Variables::new())
            .unwrap();

        let text = read(root, "CLAUDE.md");
        assert!(text.starts_with("Use pnpm.\n\n<!-- dex:alpha -->"));

        Executor::new(root, &mut manifest, false).remove(PROJECT_PSEUDO_PLUGIN).unwrap();
        assert!(read(root, "CLAUDE.md").starts_with("<!-- dex:alpha -->"));
    }

    #[test]
    fn strict_directory_requires_parent() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::default();
        let mut plan = Plan::new("p");
        plan.add_directory("missing/child", false);

        let err = Executor::new(dir.path(), &mut manifest, false)
            .execute(&plan, &Variables::new())
            .unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Install));
        assert_eq!(err.plugin(), Some("p"));
    }

    #[cfg(unix)]
    #[test]
    fn applies_explicit_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::default();
        let mut plan = Plan::new("p");
        plan.add_file("bin/run.sh", "#!/bin/sh\n", Some("755".into()));
        Executor::new(dir.path(), &mut manifest, false)
            .execute(&plan, &Variables::new())
            .unwrap();

        let mode = fs::metadata(dir.path().join("bin/run.sh")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }

    #[test]
    fn parses_modes() {
        assert_eq!(parse_mode(None).unwrap(), 0o644);
        assert_eq!(parse_mode(Some("755")).unwrap(), 0o755);
        assert_eq!(parse_mode(Some("0o600")).unwrap(), 0o600);
        assert_eq!(parse_mode(Some("0755")).unwrap(), 0o755);
        assert!(parse_mode(Some("rwx")).is_err());
        assert!(parse_mode(Some("17777")).is_err());
    }
}
