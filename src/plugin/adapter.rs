use anyhow::{Context, Result, bail};
use serde_json::{Map, Value, json};
use tracing::warn;

use crate::model::package::{CommandDecl, McpServerDecl, PackageConfig, RuleDecl, SkillDecl};
use crate::model::platform::{McpKey, Platform, PlatformLayout};
use crate::plugin::plan::{
    InstructionsContribution, McpContribution, Plan, SettingsContribution, normalize_relative,
};
use crate::plugin::registry::walk_files;
use crate::plugin::vars::{Variables, substitute_value};

/// Turns a package's platform-neutral resources into a plan for one platform.
pub trait Adapter {
    fn platform(&self) -> Platform;

    fn plan(&self, package: &PackageConfig, vars: &Variables) -> Result<Plan>;
}

pub fn adapter_for(platform: Platform) -> Box<dyn Adapter> {
    Box::new(LayoutAdapter::new(platform))
}

/// Adapter driven by the platform's [`PlatformLayout`] table.
#[derive(Debug, Clone, Copy)]
pub struct LayoutAdapter {
    platform: Platform,
    layout: PlatformLayout,
}

impl Adapter for LayoutAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn plan(&self, package: &PackageConfig, vars: &Variables) -> Result<Plan> {
        let plugin = package.name();
        let mut plan = Plan::new(plugin);

        for skill in &package.skills {
            let sub = self
                .plan_skill(package, skill)
                .with_context(|| format!("skill `{}`", skill.name))?;
            plan.merge(sub)?;
        }
        for command in &package.commands {
            let sub = self
                .plan_command(package, command)
                .with_context(|| format!("command `{}`", command.name))?;
            plan.merge(sub)?;
        }
        for rule in &package.rules {
            let sub = self
                .plan_rule(package, rule)
                .with_context(|| format!("rule `{}`", rule.name))?;
            plan.merge(sub)?;
        }
        if !package.mcp_servers.is_empty() {
            plan.merge(self.plan_mcp(plugin, &package.mcp_servers, vars))?;
        }
        if !package.settings.is_empty() {
            plan.merge(self.plan_settings(package))?;
        }
        if let Some(content) = package.instructions()? {
            let mut sub = Plan::new(plugin);
            add_parent_dirs(&mut sub, self.layout.instructions_path);
            sub.instructions = Some(InstructionsContribution {
                path: self.layout.instructions_path.to_string(),
                content,
            });
            plan.merge(sub)?;
        }
        for file in &package.files {
            let dest = normalize_relative(&file.dest)?;
            let mut sub = Plan::new(plugin);
            add_parent_dirs(&mut sub, &dest);
            sub.add_file(dest, package.read(&file.src)?, file.mode.clone());
            plan.merge(sub)?;
        }

        Ok(plan)
    }
}

impl LayoutAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            layout: platform.layout(),
        }
    }

    fn plan_skill(&self, package: &PackageConfig, skill: &SkillDecl) -> Result<Plan> {
        let source = package.resolve(&skill.path)?;
        if !source.join("SKILL.md").is_file() {
            bail!("{} has no SKILL.md", skill.path);
        }

        let mut plan = Plan::new(package.name());
        let dir = format!("{}/{}", self.layout.skills_dir, skill.name);
        plan.add_directory(dir.clone(), true);

        for relative in walk_files(&source)? {
            let relative = relative.to_string_lossy().replace('\\', "/");
            let content = std::fs::read_to_string(source.join(&relative))
                .with_context(|| format!("{relative} is not a UTF-8 text file"))?;
            let content = if relative == "SKILL.md" {
                let mut fields = vec![("name", skill.name.clone())];
                if let Some(description) = skill.description.as_ref() {
                    fields.push(("description", yaml_string(description)));
                }
                with_frontmatter(&content, &fields)
            } else {
                content
            };

            let dest = format!("{dir}/{relative}");
            add_parent_dirs(&mut plan, &dest);
            plan.add_file(dest, content, None);
        }

        Ok(plan)
    }

    fn plan_command(&self, package: &PackageConfig, command: &CommandDecl) -> Result<Plan> {
        let plugin = package.name();
        let dest = match self.platform {
            Platform::ClaudeCode => format!("{}/{plugin}/{}.md", self.layout.commands_dir, command.name),
            Platform::Cursor => format!("{}/{plugin}-{}.md", self.layout.commands_dir, command.name),
            Platform::GithubCopilot => {
                format!("{}/{plugin}-{}.prompt.md", self.layout.commands_dir, command.name)
            }
        };

        let mut content = package.read(&command.path)?;
        if let Some(description) = command.description.as_ref() {
            content = with_frontmatter(&content, &[("description", yaml_string(description))]);
        }

        let mut plan = Plan::new(plugin);
        add_parent_dirs(&mut plan, &dest);
        plan.add_file(dest, content, None);
        Ok(plan)
    }

    fn plan_rule(&self, package: &PackageConfig, rule: &RuleDecl) -> Result<Plan> {
        let plugin = package.name();
        let body = package.read(&rule.path)?;
        let description = rule.description.as_deref().map(yaml_string);

        let (dest, content) = match self.platform {
            Platform::ClaudeCode => {
                let mut fields = Vec::new();
                if let Some(description) = description {
                    fields.push(("description", description));
                }
                if !rule.globs.is_empty() && !rule.always_apply {
                    let list: Vec<String> = rule.globs.iter().map(|g| format!("\n  - {}", yaml_string(g))).collect();
                    fields.push(("paths", list.concat()));
                }
                (
                    format!("{}/{plugin}-{}.md", self.layout.rules_dir, rule.name),
                    with_frontmatter(&body, &fields),
                )
            }
            Platform::Cursor => {
                let fields = [
                    ("description", description.unwrap_or_default()),
                    ("globs", rule.globs.join(",")),
                    ("alwaysApply", rule.always_apply.to_string()),
                ];
                (
                    format!("{}/{plugin}-{}.mdc", self.layout.rules_dir, rule.name),
                    with_frontmatter(&body, &fields),
                )
            }
            Platform::GithubCopilot => {
                let apply_to = if rule.always_apply || rule.globs.is_empty() {
                    "**".to_string()
                } else {
                    rule.globs.join(",")
                };
                (
                    format!("{}/{plugin}-{}.instructions.md", self.layout.rules_dir, rule.name),
                    with_frontmatter(&body, &[("applyTo", yaml_string(&apply_to))]),
                )
            }
        };

        let mut plan = Plan::new(plugin);
        add_parent_dirs(&mut plan, &dest);
        plan.add_file(dest, content, None);
        Ok(plan)
    }

    fn plan_mcp(&self, plugin: &str, servers: &[McpServerDecl], vars: &Variables) -> Plan {
        let key = self.layout.mcp_key;
        let mut configs = Map::new();
        let mut inputs = Vec::new();

        for server in servers {
            configs.insert(
                server.name.clone(),
                substitute_value(&self.server_config(server), vars),
            );
            if key == McpKey::Servers {
                inputs.extend(server.inputs.iter().map(|input| {
                    json!({
                        "id": input.id,
                        "type": "promptString",
                        "description": input.description.clone().unwrap_or_else(|| input.id.clone()),
                        "password": input.password,
                    })
                }));
            }
        }

        let mut plan = Plan::new(plugin);
        add_parent_dirs(&mut plan, self.layout.mcp_path);
        plan.mcp = Some(McpContribution {
            path: self.layout.mcp_path.to_string(),
            key,
            servers: configs,
            inputs,
        });
        plan
    }

    fn server_config(&self, server: &McpServerDecl) -> Value {
        let mut config = Map::new();
        if let Some(command) = server.command.as_ref() {
            if self.platform == Platform::GithubCopilot {
                config.insert("type".into(), json!("stdio"));
            }
            config.insert("command".into(), json!(command));
            config.insert("args".into(), json!(server.args));
            if !server.env.is_empty() {
                config.insert("env".into(), json!(server.env));
            }
        } else if let Some(url) = server.url.as_ref() {
            if self.platform != Platform::Cursor {
                config.insert("type".into(), json!("http"));
            }
            config.insert("url".into(), json!(url));
            if !server.headers.is_empty() {
                config.insert("headers".into(), json!(server.headers));
            }
        }
        Value::Object(config)
    }

    fn plan_settings(&self, package: &PackageConfig) -> Plan {
        let mut plan = Plan::new(package.name());
        let Some(path) = self.layout.settings_path else {
            warn!(
                "{} has no permission settings; skipping settings of plugin {}",
                self.platform,
                package.name()
            );
            return plan;
        };

        add_parent_dirs(&mut plan, path);
        plan.settings = Some(SettingsContribution {
            path: path.to_string(),
            values: package.settings.clone(),
        });
        plan
    }
}

/// Emits every ancestor of `path` as a directory directive, so each one is
/// tracked and removed again once it is empty.
fn add_parent_dirs(plan: &mut Plan, path: &str) {
    for (index, _) in path.match_indices('/') {
        plan.add_directory(&path[..index], true);
    }
}

/// Prefixes YAML frontmatter unless the content already carries some.
/// Empty values are dropped.
fn with_frontmatter(content: &str, fields: &[(&str, String)]) -> String {
    let fields: Vec<&(&str, String)> = fields.iter().filter(|(_, value)| !value.is_empty()).collect();
    if content.starts_with("---") || fields.is_empty() {
        return content.to_string();
    }

    let mut header = String::from("---\n");
    for (key, value) in fields {
        if value.starts_with('\n') {
            header.push_str(&format!("{key}:{value}\n"));
        } else {
            header.push_str(&format!("{key}: {value}\n"));
        }
    }
    header.push_str("---\n\n");
    header.push_str(content.trim_start());
    header
}

fn yaml_string(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn sample_package(dir: &Path) -> PackageConfig {
        fs::create_dir_all(dir.join("skills/review/refs")).unwrap();
        fs::create_dir_all(dir.join("commands")).unwrap();
        fs::create_dir_all(dir.join("scripts")).unwrap();
        fs::write(dir.join("skills/review/SKILL.md"), "Review code.").unwrap();
        fs::write(dir.join("skills/review/refs/checklist.md"), "- tests").unwrap();
        fs::write(dir.join("commands/ship.md"), "Ship it.").unwrap();
        fs::write(dir.join("style.md"), "Use tabs.").unwrap();
        fs::write(dir.join("scripts/lint.sh"), "#!/bin/sh\necho ${plugin_name}\n").unwrap();

        let raw = r#"
[package]
name = "reviewer"
version = "1.0.0"

[[skills]]
name = "review"
description = "Reviews: code"
path = "skills/review"

[[commands]]
name = "ship"
path = "commands/ship.md"

[[rules]]
name = "style"
path = "style.md"
globs = ["*.ts"]

[[mcp_servers]]
name = "github"
command = "npx"
args = ["-y", "server-github", "${org}"]
inputs = [{ id = "gh-token", password = true }]

[[files]]
src = "scripts/lint.sh"
dest = "tools/lint.sh"
mode = "755"

[settings]
allow = ["bash:npm run *"]

[agent_instructions]
content = "Always run the linter."
"#;
        let package = PackageConfig::parse(raw, dir).unwrap();
        package.validate().unwrap();
        package
    }

    fn vars() -> Variables {
        Variables::from([("org".to_string(), "acme".to_string())])
    }

    fn file_paths(plan: &Plan) -> Vec<&str> {
        plan.files.iter().map(|file| file.path.as_str()).collect()
    }

    #[test]
    fn claude_code_layout() {
        let dir = TempDir::new().unwrap();
        let package = sample_package(dir.path());
        let plan = adapter_for(Platform::ClaudeCode).plan(&package, &vars()).unwrap();

        assert_eq!(
            file_paths(&plan),
            [
                ".claude/skills/review/SKILL.md",
                ".claude/skills/review/refs/checklist.md",
                ".claude/commands/reviewer/ship.md",
                ".claude/rules/reviewer-style.md",
                "tools/lint.sh",
            ]
        );
        let skill = &plan.files[0].content;
        assert!(skill.starts_with("---\nname: review\ndescription: \"Reviews: code\"\n---\n\nReview code."));
        assert_eq!(plan.files[4].mode.as_deref(), Some("755"));
        assert!(plan.directories.iter().any(|d| d.path == ".claude/skills/review/refs"));
        for ancestor in [".claude", ".claude/skills", ".claude/commands", ".claude/rules", "tools"] {
            assert!(
                plan.directories.iter().any(|d| d.path == ancestor && d.parents),
                "{ancestor} is not tracked"
            );
        }

        let mcp = plan.mcp.as_ref().unwrap();
        assert_eq!(mcp.path, ".mcp.json");
        assert_eq!(mcp.servers["github"]["args"], json!(["-y", "server-github", "acme"]));
        assert!(mcp.inputs.is_empty());

        assert_eq!(plan.settings.as_ref().unwrap().path, ".claude/settings.json");
        assert_eq!(plan.instructions.as_ref().unwrap().path, "CLAUDE.md");
    }

    #[test]
    fn cursor_skips_settings() {
        let dir = TempDir::new().unwrap();
        let package = sample_package(dir.path());
        let plan = adapter_for(Platform::Cursor).plan(&package, &vars()).unwrap();

        assert!(plan.settings.is_none());
        assert!(file_paths(&plan).contains(&".cursor/rules/reviewer-style.mdc"));
        let rule = plan.files.iter().find(|f| f.path.ends_with(".mdc")).unwrap();
        assert!(rule.content.contains("globs: *.ts\nalwaysApply: false\n"));
        assert_eq!(plan.instructions.as_ref().unwrap().path, "AGENTS.md");
    }

    #[test]
    fn copilot_uses_servers_key_and_inputs() {
        let dir = TempDir::new().unwrap();
        let package = sample_package(dir.path());
        let plan = adapter_for(Platform::GithubCopilot).plan(&package, &vars()).unwrap();

        let mcp = plan.mcp.as_ref().unwrap();
        assert_eq!(mcp.key, McpKey::Servers);
        assert_eq!(mcp.path, ".vscode/mcp.json");
        assert_eq!(mcp.servers["github"]["type"], "stdio");
        assert_eq!(mcp.inputs[0]["id"], "gh-token");
        assert!(file_paths(&plan).contains(&".github/prompts/reviewer-ship.prompt.md"));
    }

    #[test]
    fn skill_without_skill_md_fails() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("empty")).unwrap();
        let raw = "[package]\nname = \"p\"\nversion = \"1.0.0\"\n[[skills]]\nname = \"s\"\npath = \"empty\"\n";
        let package = PackageConfig::parse(raw, dir.path()).unwrap();
        let err = adapter_for(Platform::ClaudeCode).plan(&package, &Variables::new()).unwrap_err();
        assert!(format!("{err:#}").contains("SKILL.md"));
    }
}
