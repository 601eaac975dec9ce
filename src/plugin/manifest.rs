use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = ".dex/manifest.json";

/// What one plugin has written into the project.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginRecord {
    /// Paths owned by this plugin alone.
    #[serde(default)]
    pub files: BTreeSet<String>,
    #[serde(default)]
    pub directories: BTreeSet<String>,
    /// Shared documents this plugin contributes to.
    #[serde(default)]
    pub merged_files: BTreeSet<String>,
    #[serde(default)]
    pub mcp_servers: BTreeSet<String>,
    /// Settings array key → values contributed under it.
    #[serde(default)]
    pub settings: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub has_agent_content: bool,
}

impl PluginRecord {
    pub fn is_empty(&self) -> bool {
        self == &PluginRecord::default()
    }

    /// Directories deepest first, the order they can be removed in.
    pub fn directories_deepest_first(&self) -> Vec<&str> {
        let mut dirs: Vec<&str> = self.directories.iter().map(String::as_str).collect();
        dirs.sort_by(|a, b| depth(b).cmp(&depth(a)).then_with(|| b.cmp(a)));
        dirs
    }
}

fn depth(path: &str) -> usize {
    path.split('/').count()
}

/// Ownership state for every installed plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    plugins: BTreeMap<String, PluginRecord>,
    #[serde(skip)]
    path: PathBuf,
}

impl Manifest {
    /// Loads `.dex/manifest.json` under `project_dir`; a missing file is an empty manifest.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(MANIFEST_FILE);
        let mut manifest = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str::<Manifest>(&raw)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Manifest::default()
        };
        manifest.path = path;
        Ok(manifest)
    }

    pub fn save(&self) -> Result<()> {
        write_json_atomic(&self.path, self)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn plugin(&self, name: &str) -> Option<&PluginRecord> {
        self.plugins.get(name)
    }

    pub fn plugin_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.keys().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    fn record_mut(&mut self, name: &str) -> &mut PluginRecord {
        self.plugins.entry(name.to_string()).or_default()
    }

    /// Adds files and directories to a plugin's record.
    pub fn track(&mut self, plugin: &str, files: &[String], directories: &[String]) {
        let record = self.record_mut(plugin);
        record.files.extend(files.iter().cloned());
        record.directories.extend(directories.iter().cloned());
    }

    /// Replaces a plugin's files and directories with exactly the given sets.
    pub fn replace_tracked(&mut self, plugin: &str, files: BTreeSet<String>, directories: BTreeSet<String>) {
        let record = self.record_mut(plugin);
        record.files = files;
        record.directories = directories;
    }

    pub fn track_merged_file(&mut self, plugin: &str, path: &str) {
        self.record_mut(plugin).merged_files.insert(path.to_string());
    }

    pub fn replace_merged_files(&mut self, plugin: &str, paths: BTreeSet<String>) {
        self.record_mut(plugin).merged_files = paths;
    }

    pub fn track_mcp_server(&mut self, plugin: &str, server: &str) {
        self.record_mut(plugin).mcp_servers.insert(server.to_string());
    }

    pub fn replace_mcp_servers(&mut self, plugin: &str, servers: BTreeSet<String>) {
        self.record_mut(plugin).mcp_servers = servers;
    }

    pub fn track_settings(&mut self, plugin: &str, key: &str, values: &[String]) {
        self.record_mut(plugin)
            .settings
            .entry(key.to_string())
            .or_default()
            .extend(values.iter().cloned());
    }

    pub fn replace_settings(&mut self, plugin: &str, settings: BTreeMap<String, BTreeSet<String>>) {
        self.record_mut(plugin).settings = settings
            .into_iter()
            .filter(|(_, values)| !values.is_empty())
            .collect();
    }

    pub fn track_agent_content(&mut self, plugin: &str) {
        self.record_mut(plugin).has_agent_content = true;
    }

    pub fn replace_agent_content(&mut self, plugin: &str, has_content: bool) {
        self.record_mut(plugin).has_agent_content = has_content;
    }

    /// Drops the plugin's record and returns it, i.e. everything to clean up.
    pub fn untrack(&mut self, plugin: &str) -> Option<PluginRecord> {
        self.plugins.remove(plugin)
    }

    pub fn is_tracked(&self, path: &str) -> bool {
        self.owner(path).is_some()
    }

    pub fn owner(&self, path: &str) -> Option<&str> {
        self.plugins
            .iter()
            .find(|(_, record)| record.files.contains(path))
            .map(|(name, _)| name.as_str())
    }

    /// Moves an exclusively owned file from its current owner to nobody.
    pub fn release_file(&mut self, path: &str) {
        for record in self.plugins.values_mut() {
            record.files.remove(path);
        }
    }

    /// Whether a plugin other than `plugin` still contributes `value` under
    /// `key` to the shared document at `path`.
    pub fn is_settings_value_used_by_others(&self, plugin: &str, path: &str, key: &str, value: &str) -> bool {
        self.others_merging_into(plugin, path).any(|record| {
            record
                .settings
                .get(key)
                .is_some_and(|values| values.contains(value))
        })
    }

    /// Whether a plugin other than `plugin` still contributes `server` to the
    /// shared document at `path`.
    pub fn is_mcp_server_used_by_others(&self, plugin: &str, path: &str, server: &str) -> bool {
        self.others_merging_into(plugin, path)
            .any(|record| record.mcp_servers.contains(server))
    }

    fn others_merging_into<'a>(&'a self, plugin: &'a str, path: &'a str) -> impl Iterator<Item = &'a PluginRecord> {
        self.plugins
            .iter()
            .filter(move |(name, record)| name.as_str() != plugin && record.merged_files.contains(path))
            .map(|(_, record)| record)
    }
}

/// Writes pretty JSON through a temp file in the same directory, then renames it into place.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut text = serde_json::to_string_pretty(value)?;
    text.push('\n');

    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(text.as_bytes())?;
    tmp.persist(path)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SETTINGS: &str = ".claude/settings.json";

    fn strings(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn replace_tracked_drops_previous_entries() {
        let mut manifest = Manifest::default();
        manifest.track("a", &["x.md".into(), "y.md".into()], &[".claude".into()]);
        manifest.replace_tracked("a", strings(&[".cursor/z.md"]), strings(&[".cursor"]));

        let record = manifest.plugin("a").unwrap();
        assert_eq!(record.files, strings(&[".cursor/z.md"]));
        assert_eq!(record.directories, strings(&[".cursor"]));
        assert!(!manifest.is_tracked("x.md"));
        assert_eq!(manifest.owner(".cursor/z.md"), Some("a"));
    }

    #[test]
    fn settings_value_shared_across_plugins() {
        let mut manifest = Manifest::default();
        for plugin in ["a", "b"] {
            manifest.track_merged_file(plugin, SETTINGS);
        }
        manifest.track_settings("a", "allow", &["bash:npm run *".into(), "write:*.ts".into()]);
        manifest.track_settings("b", "allow", &["bash:npm run *".into(), "bash:yarn *".into()]);

        assert!(manifest.is_settings_value_used_by_others("a", SETTINGS, "allow", "bash:npm run *"));
        assert!(!manifest.is_settings_value_used_by_others("a", SETTINGS, "allow", "write:*.ts"));
        assert!(!manifest.is_settings_value_used_by_others("a", SETTINGS, "deny", "bash:npm run *"));
    }

    #[test]
    fn server_users_are_counted_per_document() {
        let mut manifest = Manifest::default();
        manifest.track_merged_file("a", ".mcp.json");
        manifest.track_mcp_server("a", "github");
        manifest.track_merged_file("b", ".cursor/mcp.json");
        manifest.track_mcp_server("b", "github");

        assert!(!manifest.is_mcp_server_used_by_others("a", ".mcp.json", "github"));
        assert!(manifest.is_mcp_server_used_by_others("a", ".cursor/mcp.json", "github"));
        assert!(!manifest.is_mcp_server_used_by_others("b", ".cursor/mcp.json", "github"));
    }

    #[test]
    fn untrack_returns_record() {
        let mut manifest = Manifest::default();
        manifest.track_mcp_server("a", "github");
        manifest.track_merged_file("a", ".mcp.json");
        manifest.track_agent_content("a");

        let record = manifest.untrack("a").unwrap();
        assert!(record.has_agent_content);
        assert_eq!(record.mcp_servers, strings(&["github"]));
        assert!(manifest.plugin("a").is_none());
        assert!(manifest.untrack("a").is_none());
    }

    #[test]
    fn directories_come_out_deepest_first() {
        let mut record = PluginRecord::default();
        record.directories = strings(&[".claude", ".claude/skills/review", ".claude/skills"]);
        assert_eq!(
            record.directories_deepest_first(),
            [".claude/skills/review", ".claude/skills", ".claude"]
        );
    }

    #[test]
    fn round_trips_through_disk_in_documented_shape() {
        let dir = TempDir::new().unwrap();
        let mut manifest = Manifest::load(dir.path()).unwrap();
        manifest.track("a", &["CLAUDE.md.bak".into()], &[]);
        manifest.track_settings("a", "allow", &["x".into()]);
        manifest.save().unwrap();

        let raw = fs::read_to_string(dir.path().join(MANIFEST_FILE)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["plugins"]["a"]["files"][0], "CLAUDE.md.bak");
        assert_eq!(json["plugins"]["a"]["settings"]["allow"][0], "x");
        assert_eq!(json["plugins"]["a"]["mcp_servers"], serde_json::json!([]));
        assert_eq!(json["plugins"]["a"]["has_agent_content"], false);

        let loaded = Manifest::load(dir.path()).unwrap();
        assert_eq!(loaded.plugin("a"), manifest.plugin("a"));
    }
}
