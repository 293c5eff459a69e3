//! Settings manager
//!
//! Effective settings are rebuilt from several sources on every load:
//! built-in MCP servers, MCP servers declared in Claude Code's
//! `settings.json`, skills discovered on disk, and finally the saved
//! overrides file which supplies preferences and enabled flags.
//! Unreadable sources are skipped, never fatal.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use cowork_protocol::{CoworkSettings, McpServer, McpServerConfig, SettingsPatch, SkillInfo};

const MAX_DESCRIPTION_CHARS: usize = 100;
const MAX_TRIGGERS: usize = 10;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to write settings: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode settings: {0}")]
    Json(#[from] serde_json::Error),
}

pub struct SettingsManager {
    overrides_path: PathBuf,
    claude_dir: Option<PathBuf>,
    project_dir: Option<PathBuf>,
}

impl SettingsManager {
    /// `project_dir` contributes `<project>/.claude/skills`.
    pub fn new(
        overrides_path: PathBuf,
        claude_dir: Option<PathBuf>,
        project_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            overrides_path,
            claude_dir,
            project_dir,
        }
    }

    pub fn load(&self) -> CoworkSettings {
        let saved = self.load_overrides();

        let preferences = saved.preferences.unwrap_or_default();

        let mut skills = self.discover_skills();
        for saved_skill in saved.skills.iter().flatten() {
            if let Some(skill) = skills.iter_mut().find(|s| s.id == saved_skill.id) {
                skill.enabled = saved_skill.enabled;
            }
        }

        let mut mcp_servers = built_in_mcp_servers();
        if let Some(claude_dir) = &self.claude_dir {
            mcp_servers.extend(load_claude_mcp_servers(&claude_dir.join("settings.json")));
        }
        for saved_server in saved.mcp_servers.iter().flatten() {
            if let Some(server) = mcp_servers.iter_mut().find(|s| s.id == saved_server.id) {
                server.enabled = saved_server.enabled;
            }
        }

        CoworkSettings {
            mcp_servers,
            skills,
            preferences,
        }
    }

    /// Merge `patch` into the saved overrides at top level, save, and reload.
    pub fn update(&self, patch: SettingsPatch) -> Result<CoworkSettings, SettingsError> {
        let mut saved = self.load_overrides();
        if patch.mcp_servers.is_some() {
            saved.mcp_servers = patch.mcp_servers;
        }
        if patch.skills.is_some() {
            saved.skills = patch.skills;
        }
        if patch.preferences.is_some() {
            saved.preferences = patch.preferences;
        }
        self.save_overrides(&saved)?;
        Ok(self.load())
    }

    /// Unknown ids leave settings unchanged.
    pub fn toggle_mcp(&self, server_id: &str, enabled: bool) -> Result<CoworkSettings, SettingsError> {
        let mut settings = self.load();
        let Some(server) = settings.mcp_servers.iter_mut().find(|s| s.id == server_id) else {
            debug!(
                component = "settings",
                event = "settings.toggle_mcp.unknown",
                server_id = %server_id,
                "Unknown MCP server id"
            );
            return Ok(settings);
        };
        server.enabled = enabled;
        self.update(SettingsPatch {
            mcp_servers: Some(settings.mcp_servers),
            ..SettingsPatch::default()
        })
    }

    /// Unknown ids leave settings unchanged.
    pub fn toggle_skill(&self, skill_id: &str, enabled: bool) -> Result<CoworkSettings, SettingsError> {
        let mut settings = self.load();
        let Some(skill) = settings.skills.iter_mut().find(|s| s.id == skill_id) else {
            debug!(
                component = "settings",
                event = "settings.toggle_skill.unknown",
                skill_id = %skill_id,
                "Unknown skill id"
            );
            return Ok(settings);
        };
        skill.enabled = enabled;
        self.update(SettingsPatch {
            skills: Some(settings.skills),
            ..SettingsPatch::default()
        })
    }

    fn load_overrides(&self) -> SettingsPatch {
        let content = match std::fs::read_to_string(&self.overrides_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return SettingsPatch::default(),
            Err(e) => {
                warn!(
                    component = "settings",
                    event = "settings.overrides.read_failed",
                    path = %self.overrides_path.display(),
                    error = %e,
                    "Failed to read saved settings, using defaults"
                );
                return SettingsPatch::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(saved) => saved,
            Err(e) => {
                warn!(
                    component = "settings",
                    event = "settings.overrides.parse_failed",
                    path = %self.overrides_path.display(),
                    error = %e,
                    "Saved settings are not valid JSON, using defaults"
                );
                SettingsPatch::default()
            }
        }
    }

    fn save_overrides(&self, saved: &SettingsPatch) -> Result<(), SettingsError> {
        if let Some(parent) = self.overrides_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(saved)?;
        let tmp = self.overrides_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.overrides_path)?;
        info!(
            component = "settings",
            event = "settings.saved",
            path = %self.overrides_path.display(),
            "Saved settings overrides"
        );
        Ok(())
    }

    fn discover_skills(&self) -> Vec<SkillInfo> {
        let mut skills = Vec::new();
        if let Some(claude_dir) = &self.claude_dir {
            skills.extend(discover_skills_in(&claude_dir.join("skills"), true));
        }
        if let Some(project_dir) = &self.project_dir {
            skills.extend(discover_skills_in(
                &project_dir.join(".claude").join("skills"),
                false,
            ));
        }
        skills
    }
}

/// Enabled servers, in settings order.
pub fn enabled_mcp_servers(settings: &CoworkSettings) -> Vec<McpServer> {
    settings
        .mcp_servers
        .iter()
        .filter(|s| s.enabled)
        .cloned()
        .collect()
}

fn built_in_mcp_servers() -> Vec<McpServer> {
    let server = |id: &str, name: &str, description: &str, enabled: bool, package: &str| McpServer {
        id: id.to_string(),
        name: name.to_string(),
        description: Some(description.to_string()),
        enabled,
        config: Some(McpServerConfig {
            command: "npx".to_string(),
            args: vec!["-y".to_string(), package.to_string()],
            env: None,
        }),
        built_in: true,
    };
    vec![
        server(
            "filesystem",
            "Filesystem",
            "Read and write files on your computer",
            true,
            "@anthropic-ai/mcp-server-filesystem",
        ),
        server(
            "fetch",
            "Web Fetch",
            "Fetch content from URLs",
            false,
            "@anthropic-ai/mcp-server-fetch",
        ),
        server(
            "memory",
            "Memory",
            "Persistent key-value memory across sessions",
            false,
            "@anthropic-ai/mcp-server-memory",
        ),
    ]
}

#[derive(Deserialize)]
struct ClaudeSettingsFile {
    #[serde(default, rename = "mcpServers")]
    mcp_servers: BTreeMap<String, Value>,
}

#[derive(Deserialize)]
struct ClaudeMcpEntry {
    #[serde(default)]
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: Option<BTreeMap<String, String>>,
}

fn load_claude_mcp_servers(path: &Path) -> Vec<McpServer> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let file: ClaudeSettingsFile = match serde_json::from_str(&content) {
        Ok(file) => file,
        Err(e) => {
            warn!(
                component = "settings",
                event = "settings.claude.parse_failed",
                path = %path.display(),
                error = %e,
                "Ignoring unparseable Claude settings"
            );
            return Vec::new();
        }
    };

    file.mcp_servers
        .into_iter()
        .filter_map(|(name, raw)| {
            let entry: ClaudeMcpEntry = serde_json::from_value(raw).ok()?;
            Some(McpServer {
                id: format!("claude-{name}"),
                description: Some("MCP server from Claude Code settings".to_string()),
                name,
                enabled: true,
                config: Some(McpServerConfig {
                    command: entry.command,
                    args: entry.args,
                    env: entry.env,
                }),
                built_in: false,
            })
        })
        .collect()
}

fn discover_skills_in(skills_dir: &Path, built_in: bool) -> Vec<SkillInfo> {
    let Ok(entries) = std::fs::read_dir(skills_dir) else {
        return Vec::new();
    };
    let mut dirs: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    dirs.into_iter()
        .filter_map(|skill_path| {
            let id = skill_path.file_name()?.to_string_lossy().to_string();
            let md_path = ["SKILL.md", "skill.md"]
                .iter()
                .map(|name| skill_path.join(name))
                .find(|candidate| candidate.is_file())?;
            let content = std::fs::read_to_string(&md_path).ok()?;
            Some(parse_skill(&id, &skill_path, &content, built_in))
        })
        .collect()
}

fn parse_skill(id: &str, skill_path: &Path, content: &str, built_in: bool) -> SkillInfo {
    let name = content
        .lines()
        .find_map(|line| {
            let rest = line.strip_prefix('#')?;
            if !rest.starts_with(char::is_whitespace) {
                return None;
            }
            Some(rest.trim()).filter(|name| !name.is_empty())
        })
        .unwrap_or(id)
        .to_string();

    let description = content
        .lines()
        .filter(|line| !line.starts_with('#'))
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.chars().take(MAX_DESCRIPTION_CHARS).collect())
        .unwrap_or_else(|| format!("Skill: {id}"));

    SkillInfo {
        id: id.to_string(),
        name,
        description,
        path: skill_path.to_string_lossy().to_string(),
        enabled: true,
        built_in,
        triggers: extract_triggers(content),
    }
}

/// `keywords: a, b` and `use when: ...` / `triggers: ...` lines, split on `,` or `;`.
fn extract_triggers(content: &str) -> Vec<String> {
    let mut triggers = Vec::new();
    for needles in [&["keyword"][..], &["use when", "trigger"][..]] {
        if let Some(value) = labelled_value(content, needles) {
            triggers.extend(
                value
                    .split([',', ';'])
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .map(str::to_string),
            );
        }
    }
    triggers.truncate(MAX_TRIGGERS);
    triggers
}

/// Text after the first `<label>[s][: ]+` occurrence, case-insensitive.
fn labelled_value<'a>(content: &'a str, labels: &[&str]) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let lower = line.to_ascii_lowercase();
        labels.iter().find_map(|label| {
            let start = lower.find(label)? + label.len();
            let rest = &line[start..];
            let rest = rest.strip_prefix('s').unwrap_or(rest);
            let value = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
            (value.len() < rest.len() && !value.trim().is_empty()).then_some(value.trim())
        })
    })
}
