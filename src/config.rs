//! Configuration loading via `ortho-config`.
//!
//! [`RunnerConfig`] merges defaults, `playrun.toml` discovery, and
//! `PLAYRUN_*` environment variables. Backend construction reads the merged
//! values; only the backends a command actually uses are validated.

use std::ffi::OsString;

use camino::Utf8PathBuf;
use ortho_config::OrthoConfig;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::connection::{HostSpec, SshOptions};
use crate::sync::DEFAULT_CONCURRENCY;

/// Default interpreter invoked with the playbook path.
pub const DEFAULT_INTERPRETER: &str = "ansible-playbook";

/// Playbook run when a request names none.
pub const DEFAULT_PLAYBOOK: &str = "site.yml";

/// Runner settings loaded via `ortho-config`.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq, Eq)]
#[ortho_config(
    prefix = "PLAYRUN",
    discovery(
        app_name = "playrun",
        env_var = "PLAYRUN_CONFIG_PATH",
        config_file_name = "playrun.toml",
        dotfile_name = ".playrun.toml",
        project_file_name = "playrun.toml"
    )
)]
pub struct RunnerConfig {
    /// Interpreter invoked with the playbook path.
    #[ortho_config(default = DEFAULT_INTERPRETER.to_owned())]
    pub interpreter: String,
    /// Playbook, relative to the workspace, used when none is requested.
    #[ortho_config(default = DEFAULT_PLAYBOOK.to_owned())]
    pub default_playbook: String,
    /// Container runtime executable (`docker`, `podman`).
    #[ortho_config(default = "docker".to_owned())]
    pub container_runtime: String,
    /// Image providing the interpreter.
    #[ortho_config(default = "cytopia/ansible:latest".to_owned())]
    pub container_image: String,
    /// Mount point of the workspace inside the container.
    #[ortho_config(default = "/workspace".to_owned())]
    pub container_mount_path: String,
    /// Path to the `ssh` executable.
    #[ortho_config(default = "ssh".to_owned())]
    pub ssh_bin: String,
    /// Remote host for the remote-shell backend.
    pub ssh_host: Option<String>,
    /// Remote user to connect as.
    #[ortho_config(default = "root".to_owned())]
    pub ssh_user: String,
    /// Remote SSH port.
    #[ortho_config(default = 22)]
    pub ssh_port: u16,
    /// Private key used for authentication; supports `~` expansion.
    pub ssh_identity_file: Option<String>,
    /// Whether to force batch mode for SSH to avoid password prompts.
    #[ortho_config(default = true)]
    pub ssh_batch_mode: bool,
    /// Whether to enforce host key checking.
    #[ortho_config(default = false)]
    pub ssh_strict_host_key_checking: bool,
    /// Known hosts file override.
    #[ortho_config(default = "/dev/null".to_owned())]
    pub ssh_known_hosts_file: String,
    /// Remote directory holding synced workspaces.
    #[ortho_config(default = "/tmp/playrun".to_owned())]
    pub remote_root: String,
    /// Whether the remote-shell backend syncs the workspace before each run.
    #[ortho_config(default = true)]
    pub auto_sync: bool,
    /// Maximum concurrent file transfers per sync.
    #[ortho_config(default = DEFAULT_CONCURRENCY)]
    pub sync_concurrency: usize,
    /// Raw JSON sync settings (`ignore`, `destination`, `enabled`).
    pub sync_settings: Option<String>,
    /// Cloud shell launcher executable.
    #[ortho_config(default = "cloudshell".to_owned())]
    pub cloud_shell_bin: String,
    /// Directory holding SSH control sockets; defaults to the temp dir.
    pub control_dir: Option<String>,
}

/// Metadata for a configuration field, used to generate actionable error messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(description: &'static str, env_var: &'static str, toml_key: &'static str) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }

    fn missing(&self) -> ConfigError {
        ConfigError::MissingField(format!(
            "missing {}: set {} or add {} to playrun.toml",
            self.description, self.env_var, self.toml_key
        ))
    }
}

impl RunnerConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(metadata.missing());
        }
        Ok(())
    }

    /// Loads configuration without attempting to parse CLI arguments. Values
    /// still merge defaults, configuration files, and environment variables.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([OsString::from("playrun")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Checks the settings every backend relies on.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when a required field is empty
    /// and [`ConfigError::Invalid`] when a value is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.interpreter,
            &FieldMetadata::new("playbook interpreter", "PLAYRUN_INTERPRETER", "interpreter"),
        )?;
        Self::require_field(
            &self.default_playbook,
            &FieldMetadata::new(
                "default playbook",
                "PLAYRUN_DEFAULT_PLAYBOOK",
                "default_playbook",
            ),
        )?;
        if self.sync_concurrency == 0 {
            return Err(ConfigError::Invalid(String::from(
                "sync_concurrency must be at least 1",
            )));
        }
        if let Some(identity) = &self.ssh_identity_file
            && identity.trim().is_empty()
        {
            return Err(ConfigError::Invalid(String::from(
                "ssh_identity_file must not be empty when set",
            )));
        }
        Ok(())
    }

    /// Host targeted by the remote-shell backend.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::MissingField`] when no host or user is set.
    pub fn ssh_host_spec(&self) -> Result<HostSpec, ConfigError> {
        let host = self.ssh_host.as_deref().unwrap_or_default();
        Self::require_field(
            host,
            &FieldMetadata::new("remote host", "PLAYRUN_SSH_HOST", "ssh_host"),
        )?;
        Self::require_field(
            &self.ssh_user,
            &FieldMetadata::new("remote user", "PLAYRUN_SSH_USER", "ssh_user"),
        )?;
        let spec = HostSpec::new(&self.ssh_user, host, self.ssh_port);
        Ok(match &self.ssh_identity_file {
            Some(identity) => spec.with_identity_file(identity),
            None => spec,
        })
    }

    /// SSH client options for the connector.
    #[must_use]
    pub fn ssh_options(&self) -> SshOptions {
        SshOptions {
            ssh_bin: self.ssh_bin.clone(),
            batch_mode: self.ssh_batch_mode,
            strict_host_key_checking: self.ssh_strict_host_key_checking,
            known_hosts_file: self.ssh_known_hosts_file.clone(),
        }
    }

    /// Directory for SSH control sockets.
    #[must_use]
    pub fn control_dir(&self) -> Utf8PathBuf {
        self.control_dir.as_ref().map_or_else(
            || {
                Utf8PathBuf::from_path_buf(std::env::temp_dir())
                    .unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
            },
            Utf8PathBuf::from,
        )
    }

    /// Parsed sync settings; `Value::Null` when none are configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when the value is not valid JSON.
    pub fn sync_settings_value(&self) -> Result<Value, ConfigError> {
        match self.sync_settings.as_deref().map(str::trim) {
            None | Some("") => Ok(Value::Null),
            Some(raw) => serde_json::from_str(raw)
                .map_err(|err| ConfigError::Invalid(format!("sync_settings is not valid JSON: {err}"))),
        }
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// A field is present but unusable.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::{fixture, rstest};

    #[fixture]
    fn config() -> RunnerConfig {
        RunnerConfig {
            interpreter: String::from(DEFAULT_INTERPRETER),
            default_playbook: String::from(DEFAULT_PLAYBOOK),
            container_runtime: String::from("docker"),
            container_image: String::from("cytopia/ansible:latest"),
            container_mount_path: String::from("/workspace"),
            ssh_bin: String::from("ssh"),
            ssh_host: Some(String::from("build.example.com")),
            ssh_user: String::from("deploy"),
            ssh_port: 2222,
            ssh_identity_file: None,
            ssh_batch_mode: true,
            ssh_strict_host_key_checking: false,
            ssh_known_hosts_file: String::from("/dev/null"),
            remote_root: String::from("/srv/playrun"),
            auto_sync: true,
            sync_concurrency: 4,
            sync_settings: None,
            cloud_shell_bin: String::from("cloudshell"),
            control_dir: Some(String::from("/run/playrun")),
        }
    }

    #[rstest]
    fn defaults_validate(config: RunnerConfig) {
        assert_eq!(config.validate(), Ok(()));
    }

    #[rstest]
    fn missing_interpreter_names_env_var_and_key(mut config: RunnerConfig) {
        config.interpreter = String::from("  ");
        let message = config.validate().expect_err("must fail").to_string();
        assert!(message.contains("PLAYRUN_INTERPRETER"), "{message}");
        assert!(message.contains("playrun.toml"), "{message}");
    }

    #[rstest]
    fn zero_concurrency_is_rejected(mut config: RunnerConfig) {
        config.sync_concurrency = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    fn blank_identity_file_is_rejected(mut config: RunnerConfig) {
        config.ssh_identity_file = Some(String::from(" "));
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[rstest]
    fn host_spec_carries_identity(mut config: RunnerConfig) {
        config.ssh_identity_file = Some(String::from("~/.ssh/id_ed25519"));
        let host = config.ssh_host_spec().expect("host");
        assert_eq!(host.to_string(), "deploy@build.example.com:2222");
        assert_eq!(host.identity_file.as_deref(), Some("~/.ssh/id_ed25519"));
    }

    #[rstest]
    fn host_spec_requires_host(mut config: RunnerConfig) {
        config.ssh_host = None;
        let error = config.ssh_host_spec().expect_err("host required");
        assert!(error.to_string().contains("PLAYRUN_SSH_HOST"));
    }

    #[rstest]
    fn sync_settings_parse_as_json(mut config: RunnerConfig) {
        assert_eq!(config.sync_settings_value(), Ok(Value::Null));
        config.sync_settings = Some(String::from(r#"{"enabled":true}"#));
        assert_eq!(
            config.sync_settings_value(),
            Ok(serde_json::json!({"enabled": true}))
        );
        config.sync_settings = Some(String::from("{not json"));
        assert!(config.sync_settings_value().is_err());
    }

    #[rstest]
    fn ssh_options_follow_config(config: RunnerConfig) {
        let options = config.ssh_options();
        assert!(options.batch_mode);
        assert_eq!(options.known_hosts_file, "/dev/null");
        assert_eq!(config.control_dir(), Utf8PathBuf::from("/run/playrun"));
    }
}
