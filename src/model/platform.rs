use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

/// Agent platforms dex can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    ClaudeCode,
    Cursor,
    GithubCopilot,
}

/// Top-level key an MCP document groups its servers under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum McpKey {
    McpServers,
    Servers,
}

impl McpKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpKey::McpServers => "mcpServers",
            McpKey::Servers => "servers",
        }
    }

    pub fn all() -> [McpKey; 2] {
        [McpKey::McpServers, McpKey::Servers]
    }
}

/// Where each kind of resource lands for a platform.
#[derive(Debug, Clone, Copy)]
pub struct PlatformLayout {
    pub skills_dir: &'static str,
    pub commands_dir: &'static str,
    pub rules_dir: &'static str,
    pub mcp_path: &'static str,
    pub mcp_key: McpKey,
    pub settings_path: Option<&'static str>,
    pub instructions_path: &'static str,
}

impl Platform {
    pub const ALL: [Platform; 3] = [
        Platform::ClaudeCode,
        Platform::Cursor,
        Platform::GithubCopilot,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            Platform::ClaudeCode => "claude-code",
            Platform::Cursor => "cursor",
            Platform::GithubCopilot => "github-copilot",
        }
    }

    pub fn layout(&self) -> PlatformLayout {
        match self {
            Platform::ClaudeCode => PlatformLayout {
                skills_dir: ".claude/skills",
                commands_dir: ".claude/commands",
                rules_dir: ".claude/rules",
                mcp_path: ".mcp.json",
                mcp_key: McpKey::McpServers,
                settings_path: Some(".claude/settings.json"),
                instructions_path: "CLAUDE.md",
            },
            Platform::Cursor => PlatformLayout {
                skills_dir: ".cursor/skills",
                commands_dir: ".cursor/commands",
                rules_dir: ".cursor/rules",
                mcp_path: ".cursor/mcp.json",
                mcp_key: McpKey::McpServers,
                settings_path: None,
                instructions_path: "AGENTS.md",
            },
            Platform::GithubCopilot => PlatformLayout {
                skills_dir: ".github/skills",
                commands_dir: ".github/prompts",
                rules_dir: ".github/instructions",
                mcp_path: ".vscode/mcp.json",
                mcp_key: McpKey::Servers,
                settings_path: None,
                instructions_path: ".github/copilot-instructions.md",
            },
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

impl FromStr for Platform {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        let platform = match normalized.as_str() {
            "claude-code" | "claude" => Platform::ClaudeCode,
            "cursor" => Platform::Cursor,
            "github-copilot" | "copilot" => Platform::GithubCopilot,
            _ => {
                let known: Vec<&str> = Platform::ALL.iter().map(Platform::id).collect();
                return Err(anyhow!(
                    "unknown agent platform `{value}` (expected one of: {})",
                    known.join(", ")
                ));
            }
        };
        Ok(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_ids_and_aliases() {
        assert_eq!("claude-code".parse::<Platform>().unwrap(), Platform::ClaudeCode);
        assert_eq!("Copilot".parse::<Platform>().unwrap(), Platform::GithubCopilot);
        for platform in Platform::ALL {
            assert_eq!(platform.id().parse::<Platform>().unwrap(), platform);
        }
    }

    #[test]
    fn rejects_unknown_platform() {
        let err = "emacs".parse::<Platform>().unwrap_err();
        assert!(err.to_string().contains("claude-code"));
    }

    #[test]
    fn copilot_groups_servers_under_servers_key() {
        assert_eq!(Platform::GithubCopilot.layout().mcp_key.as_str(), "servers");
        assert_eq!(Platform::Cursor.layout().mcp_key.as_str(), "mcpServers");
    }
}
