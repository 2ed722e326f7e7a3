use crate::protocol::{normalized_protocol_versions, PROTOCOL_VERSION};
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const WORKER_BIN_ENV: &str = "EXTHOST_WORKER_BIN";
pub const ADDITIONAL_ACTIVATION_EVENTS_ENV: &str = "EXTHOST_ADDITIONAL_ACTIVATION_EVENTS";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostSettings {
    #[serde(default)]
    pub supervisor: SupervisorSettings,
    #[serde(default)]
    pub activation: ActivationSettings,
    #[serde(default)]
    pub rejections: RejectionSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupervisorSettings {
    #[serde(default = "default_worker_command")]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub extra_env: HashMap<String, String>,
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,
    #[serde(default = "default_terminate_deadline_ms")]
    pub terminate_deadline_ms: Option<u64>,
    #[serde(default = "default_terminate_grace_ms")]
    pub terminate_grace_ms: u64,
    #[serde(default = "default_protocol_version")]
    pub protocol_version: u32,
    #[serde(default = "default_supported_protocol_versions")]
    pub supported_protocol_versions: Vec<u32>,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActivationSettings {
    #[serde(default = "default_workspace_search_timeout_ms")]
    pub workspace_search_timeout_ms: u64,
    #[serde(default = "default_provider_registration_timeout_ms")]
    pub provider_registration_timeout_ms: u64,
    #[serde(default)]
    pub additional_activation_events: Vec<String>,
    /// Failed attempts before a (host, event) is disabled. 1 never retries.
    #[serde(default = "default_max_failed_activations")]
    pub max_failed_activations: u32,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct RejectionSettings {
    #[serde(default = "default_rejection_grace_ms")]
    pub grace_ms: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoggingSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            args: Vec::new(),
            extra_env: HashMap::new(),
            ready_timeout_ms: default_ready_timeout_ms(),
            terminate_deadline_ms: default_terminate_deadline_ms(),
            terminate_grace_ms: default_terminate_grace_ms(),
            protocol_version: default_protocol_version(),
            supported_protocol_versions: default_supported_protocol_versions(),
        }
    }
}

impl Default for ActivationSettings {
    fn default() -> Self {
        Self {
            workspace_search_timeout_ms: default_workspace_search_timeout_ms(),
            provider_registration_timeout_ms: default_provider_registration_timeout_ms(),
            additional_activation_events: Vec::new(),
            max_failed_activations: default_max_failed_activations(),
        }
    }
}

impl Default for RejectionSettings {
    fn default() -> Self {
        Self {
            grace_ms: default_rejection_grace_ms(),
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl SupervisorSettings {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms.max(10))
    }

    pub fn terminate_deadline(&self) -> Option<Duration> {
        self.terminate_deadline_ms.map(Duration::from_millis)
    }

    pub fn terminate_grace(&self) -> Duration {
        Duration::from_millis(self.terminate_grace_ms)
    }

    pub fn normalized_supported_protocol_versions(&self) -> Vec<u32> {
        normalized_protocol_versions(self.protocol_version, &self.supported_protocol_versions)
    }

    pub fn negotiate_protocol(&self, host_version: u32) -> Option<u32> {
        if host_version == 0 {
            return None;
        }
        self.normalized_supported_protocol_versions()
            .contains(&host_version)
            .then_some(host_version)
    }
}

impl ActivationSettings {
    pub fn workspace_search_timeout(&self) -> Duration {
        Duration::from_millis(self.workspace_search_timeout_ms)
    }

    pub fn provider_registration_timeout(&self) -> Duration {
        Duration::from_millis(self.provider_registration_timeout_ms)
    }

    pub fn normalized_max_failed_activations(&self) -> u32 {
        self.max_failed_activations.max(1)
    }
}

impl RejectionSettings {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl HostSettings {
    pub fn merge_overlay(&self, overlay: &HostSettings) -> HostSettings {
        let mut merged = overlay.clone();
        for event in &self.activation.additional_activation_events {
            if !merged
                .activation
                .additional_activation_events
                .iter()
                .any(|existing| existing == event)
            {
                merged.activation.additional_activation_events.push(event.clone());
            }
        }
        for (key, value) in &self.supervisor.extra_env {
            merged
                .supervisor
                .extra_env
                .entry(key.clone())
                .or_insert_with(|| value.clone());
        }
        merged
    }

    /// Applies the process environment on top of file settings.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(command) = lookup(WORKER_BIN_ENV).filter(|v| !v.trim().is_empty()) {
            self.supervisor.command = command;
        }
        if let Some(raw) = lookup(ADDITIONAL_ACTIVATION_EVENTS_ENV) {
            for event in raw.split(',').map(str::trim).filter(|event| !event.is_empty()) {
                let known = self
                    .activation
                    .additional_activation_events
                    .iter()
                    .any(|existing| existing == event);
                if !known {
                    self.activation
                        .additional_activation_events
                        .push(event.to_string());
                }
            }
        }
    }
}

pub fn settings_path(config_dir: &Path) -> PathBuf {
    config_dir.join("exthost.json")
}

pub fn workspace_settings_path(workspace_root: &Path) -> PathBuf {
    workspace_root.join(".exthost").join("settings.json")
}

pub fn load_settings(config_dir: &Path) -> Result<HostSettings> {
    load_settings_from_path(&settings_path(config_dir))
}

pub fn load_workspace_settings(workspace_root: &Path) -> Result<Option<HostSettings>> {
    let path = workspace_settings_path(workspace_root);
    if !path.exists() {
        return Ok(None);
    }
    let settings = load_settings_from_path(&path)?;
    Ok(Some(settings))
}

/// User settings, overlaid by workspace settings, then by the environment.
pub fn load_effective_settings(
    config_dir: &Path,
    workspace_root: Option<&Path>,
) -> Result<HostSettings> {
    let mut settings = load_settings(config_dir)?;
    if let Some(workspace_root) = workspace_root {
        if let Some(workspace) = load_workspace_settings(workspace_root)? {
            settings = settings.merge_overlay(&workspace);
        }
    }
    settings.apply_env();
    Ok(settings)
}

pub fn save_settings(config_dir: &Path, settings: &HostSettings) -> Result<()> {
    save_settings_to_path(&settings_path(config_dir), settings)
}

fn load_settings_from_path(path: &Path) -> Result<HostSettings> {
    if !path.exists() {
        return Ok(HostSettings::default());
    }

    let raw = fs::read_to_string(path)
        .with_context(|| format!("read settings file: {}", path.display()))?;
    let settings: HostSettings = serde_json::from_str(&raw)
        .with_context(|| format!("parse settings file: {}", path.display()))?;
    Ok(settings)
}

fn save_settings_to_path(path: &Path, settings: &HostSettings) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create config dir: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(settings)?;
    fs::write(path, json).with_context(|| format!("write settings file: {}", path.display()))?;
    Ok(())
}

fn default_worker_command() -> String {
    #[cfg(target_os = "windows")]
    let worker_binary = "exthost-worker.exe";
    #[cfg(not(target_os = "windows"))]
    let worker_binary = "exthost-worker";
    worker_binary.to_string()
}

const fn default_ready_timeout_ms() -> u64 {
    10_000
}

const fn default_terminate_deadline_ms() -> Option<u64> {
    Some(5_000)
}

const fn default_terminate_grace_ms() -> u64 {
    250
}

const fn default_protocol_version() -> u32 {
    PROTOCOL_VERSION
}

fn default_supported_protocol_versions() -> Vec<u32> {
    vec![PROTOCOL_VERSION]
}

const fn default_workspace_search_timeout_ms() -> u64 {
    7_000
}

const fn default_provider_registration_timeout_ms() -> u64 {
    3_000
}

const fn default_max_failed_activations() -> u32 {
    1
}

const fn default_rejection_grace_ms() -> u64 {
    1_000
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_defaults_when_missing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let settings = load_settings(dir.path()).expect("load defaults");
        assert_eq!(settings, HostSettings::default());
        assert_eq!(settings.activation.workspace_search_timeout_ms, 7_000);
        assert_eq!(settings.rejections.grace_ms, 1_000);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::write(
            settings_path(dir.path()),
            r#"{"supervisor":{"terminate_deadline_ms":null},"logging":{"json":true}}"#,
        )
        .expect("write settings");

        let settings = load_settings(dir.path()).expect("load settings");
        assert_eq!(settings.supervisor.terminate_deadline(), None);
        assert_eq!(settings.supervisor.ready_timeout_ms, 10_000);
        assert!(settings.logging.json);
        assert_eq!(settings.logging.level, "info");
    }

    #[test]
    fn save_then_load_roundtrip() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut settings = HostSettings::default();
        settings.supervisor.args = vec!["--stdio".to_string()];
        settings.activation.max_failed_activations = 5;

        save_settings(dir.path(), &settings).expect("save settings");
        let loaded = load_settings(dir.path()).expect("load settings");
        assert_eq!(loaded, settings);
    }

    #[test]
    fn workspace_settings_overlay_user_settings() {
        let user_dir = tempfile::tempdir().expect("user dir");
        let workspace_dir = tempfile::tempdir().expect("workspace dir");

        let mut user = HostSettings::default();
        user.activation
            .additional_activation_events
            .push("onIssueReporterOpened".to_string());
        user.supervisor
            .extra_env
            .insert("RUST_LOG".to_string(), "debug".to_string());
        save_settings(user_dir.path(), &user).expect("save user");

        let mut workspace = HostSettings::default();
        workspace.activation.workspace_search_timeout_ms = 500;
        save_settings_to_path(&workspace_settings_path(workspace_dir.path()), &workspace)
            .expect("save workspace");

        assert!(load_workspace_settings(user_dir.path())
            .expect("load missing workspace")
            .is_none());
        let effective = load_effective_settings(user_dir.path(), Some(workspace_dir.path()))
            .expect("load effective");
        assert_eq!(effective.activation.workspace_search_timeout_ms, 500);
        assert!(effective
            .activation
            .additional_activation_events
            .contains(&"onIssueReporterOpened".to_string()));
        assert_eq!(
            effective.supervisor.extra_env.get("RUST_LOG").map(String::as_str),
            Some("debug")
        );
    }

    #[test]
    fn env_overrides_worker_and_appends_events() {
        let mut settings = HostSettings::default();
        settings
            .activation
            .additional_activation_events
            .push("onA".to_string());
        settings.apply_env_from(|key| match key {
            WORKER_BIN_ENV => Some("/opt/exthost/worker".to_string()),
            ADDITIONAL_ACTIVATION_EVENTS_ENV => Some("onA, onB,,onC".to_string()),
            _ => None,
        });

        assert_eq!(settings.supervisor.command, "/opt/exthost/worker");
        assert_eq!(
            settings.activation.additional_activation_events,
            vec!["onA".to_string(), "onB".to_string(), "onC".to_string()]
        );
    }

    #[test]
    fn negotiate_protocol_accepts_only_supported_versions() {
        let mut settings = SupervisorSettings::default();
        settings.protocol_version = 2;
        settings.supported_protocol_versions = vec![1];
        assert_eq!(settings.normalized_supported_protocol_versions(), vec![2, 1]);
        assert_eq!(settings.negotiate_protocol(1), Some(1));
        assert_eq!(settings.negotiate_protocol(3), None);
        assert_eq!(settings.negotiate_protocol(0), None);
    }
}
