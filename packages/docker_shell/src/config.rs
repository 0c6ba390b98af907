use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::auth::AuthFileConfig;
use crate::session::SessionSettings;

// =============================================================================
// File config (figment-deserialized from defaults / docksh.toml / env vars)
// =============================================================================
//
// Three equivalent ways to configure:
//
//   docksh.toml:     [shell]
//                    program = "podman"
//
//   env var:         DOCKSH_SHELL__PROGRAM=podman   (double underscore = nesting)
//
//   (single underscore stays within field names: DOCKSH_AUTH__AUTHORIZED_KEYS)

/// Config file read from the working directory when `--config` is not given.
pub const DEFAULT_CONFIG_FILE: &str = "docksh.toml";

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    /// Private host key presented to clients.
    #[serde(default = "default_host_key")]
    pub host_key: PathBuf,
    /// Address the listener binds to; the port comes from the command line.
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,
    #[serde(default)]
    pub shell: ShellFileConfig,
    #[serde(default)]
    pub auth: AuthFileConfig,
    #[serde(default)]
    pub ssh: SshFileConfig,
}

impl Default for FileConfig {
    fn default() -> Self {
        Self {
            host_key: default_host_key(),
            bind_host: default_bind_host(),
            shell: ShellFileConfig::default(),
            auth: AuthFileConfig::default(),
            ssh: SshFileConfig::default(),
        }
    }
}

/// Prompt tunables (lives under `[shell]`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShellFileConfig {
    #[serde(default = "default_program")]
    pub program: String,
    /// Defaults to `"<program> > "`.
    #[serde(default)]
    pub prompt: Option<String>,
}

impl Default for ShellFileConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            prompt: None,
        }
    }
}

/// SSH transport tunables (lives under `[ssh]`).
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SshFileConfig {
    /// Drop connections idle this long (0 = never).
    #[serde(default)]
    pub inactivity_timeout_secs: u64,
    /// Delay before answering a failed authentication attempt.
    #[serde(default = "default_auth_rejection_time_ms")]
    pub auth_rejection_time_ms: u64,
}

impl Default for SshFileConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 0,
            auth_rejection_time_ms: default_auth_rejection_time_ms(),
        }
    }
}

fn default_host_key() -> PathBuf {
    PathBuf::from("./nopass_rsa")
}

fn default_bind_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_program() -> String {
    "docker".to_string()
}

fn default_auth_rejection_time_ms() -> u64 {
    1000
}

/// Build a figment that layers: defaults → config file → DOCKSH_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `DOCKSH_SHELL__PROGRAM=podman`  →  `shell.program = "podman"`
///   `DOCKSH_AUTH__MODE=allow-any`   →  `auth.mode = "allow-any"`
pub fn load_config(config_file: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_file))
        .merge(Env::prefixed("DOCKSH_").split("__"))
}

// =============================================================================
// Runtime config (derived from FileConfig, used by the server)
// =============================================================================

/// SSH transport settings (runtime view).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshConfig {
    pub inactivity_timeout: Option<Duration>,
    pub auth_rejection_time: Duration,
}

impl SshConfig {
    pub fn from_file(fc: &SshFileConfig) -> Self {
        Self {
            inactivity_timeout: if fc.inactivity_timeout_secs == 0 {
                None
            } else {
                Some(Duration::from_secs(fc.inactivity_timeout_secs))
            },
            auth_rejection_time: Duration::from_millis(fc.auth_rejection_time_ms),
        }
    }
}

impl SessionSettings {
    pub fn from_file(fc: &ShellFileConfig) -> Self {
        let defaults = SessionSettings::for_program(fc.program.clone());
        Self {
            prompt: fc.prompt.clone().unwrap_or(defaults.prompt),
            program: defaults.program,
        }
    }
}

/// Everything the server needs, resolved from the CLI and the figment.
#[derive(Clone, Debug)]
pub struct ShellConfig {
    pub listen_addr: SocketAddr,
    pub host_key: PathBuf,
    pub session: SessionSettings,
    pub auth: AuthFileConfig,
    pub ssh: SshConfig,
}

impl ShellConfig {
    pub fn resolve(port: u16, config_file: Option<&Path>) -> Result<Self> {
        let path = match config_file {
            Some(path) => {
                anyhow::ensure!(
                    path.exists(),
                    "config file {} does not exist",
                    path.display()
                );
                path
            }
            None => Path::new(DEFAULT_CONFIG_FILE),
        };

        let fc: FileConfig = load_config(path)
            .extract()
            .context("Failed to load configuration")?;
        Ok(Self::from_file(port, fc))
    }

    pub fn from_file(port: u16, fc: FileConfig) -> Self {
        Self {
            listen_addr: SocketAddr::new(fc.bind_host, port),
            host_key: fc.host_key,
            session: SessionSettings::from_file(&fc.shell),
            auth: fc.auth,
            ssh: SshConfig::from_file(&fc.ssh),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::AuthMode;
    use figment::Jail;

    // ── defaults ────────────────────────────────────────────────────────

    #[test]
    fn test_file_config_defaults() {
        let d = FileConfig::default();
        assert_eq!(d.host_key, PathBuf::from("./nopass_rsa"));
        assert_eq!(d.bind_host, IpAddr::from([0, 0, 0, 0]));
        assert_eq!(d.shell.program, "docker");
        assert!(d.shell.prompt.is_none());
        assert_eq!(d.auth.mode, AuthMode::Deny);
        assert_eq!(d.ssh.inactivity_timeout_secs, 0);
        assert_eq!(d.ssh.auth_rejection_time_ms, 1000);
    }

    #[test]
    fn test_shell_config_binds_all_interfaces() {
        let config = ShellConfig::from_file(2222, FileConfig::default());
        assert_eq!(config.listen_addr, "0.0.0.0:2222".parse().unwrap());
        assert_eq!(config.session.prompt, "docker > ");
        assert_eq!(config.session.program, "docker");
    }

    // ── SshConfig::from_file ────────────────────────────────────────────

    #[test]
    fn test_ssh_config_zero_timeout_disables() {
        let sc = SshConfig::from_file(&SshFileConfig::default());
        assert!(sc.inactivity_timeout.is_none());
        assert_eq!(sc.auth_rejection_time, Duration::from_secs(1));
    }

    #[test]
    fn test_ssh_config_custom_values() {
        let sc = SshConfig::from_file(&SshFileConfig {
            inactivity_timeout_secs: 600,
            auth_rejection_time_ms: 250,
        });
        assert_eq!(sc.inactivity_timeout, Some(Duration::from_secs(600)));
        assert_eq!(sc.auth_rejection_time, Duration::from_millis(250));
    }

    // ── SessionSettings::from_file ──────────────────────────────────────

    #[test]
    fn test_custom_prompt_wins() {
        let settings = SessionSettings::from_file(&ShellFileConfig {
            program: "podman".into(),
            prompt: Some("pods$ ".into()),
        });
        assert_eq!(settings.program, "podman");
        assert_eq!(settings.prompt, "pods$ ");
    }

    // ── figment layering ────────────────────────────────────────────────

    #[test]
    fn test_toml_file_overrides_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                DEFAULT_CONFIG_FILE,
                r#"
                    host_key = "/etc/docksh/host_key"
                    bind_host = "127.0.0.1"

                    [shell]
                    program = "podman"

                    [auth]
                    mode = "authorized-keys"
                    authorized_keys = "/etc/docksh/authorized_keys"
                "#,
            )?;

            let config = ShellConfig::resolve(2022, None).map_err(|e| e.to_string())?;
            assert_eq!(config.listen_addr, "127.0.0.1:2022".parse().unwrap());
            assert_eq!(config.host_key, PathBuf::from("/etc/docksh/host_key"));
            assert_eq!(config.session.program, "podman");
            assert_eq!(config.session.prompt, "podman > ");
            assert_eq!(config.auth.mode, AuthMode::AuthorizedKeys);
            assert_eq!(
                config.auth.authorized_keys,
                Some(PathBuf::from("/etc/docksh/authorized_keys"))
            );
            Ok(())
        });
    }

    #[test]
    fn test_env_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("custom.toml", "[shell]\nprogram = \"podman\"\n")?;
            jail.set_env("DOCKSH_SHELL__PROGRAM", "nerdctl");
            jail.set_env("DOCKSH_AUTH__MODE", "allow-any");
            jail.set_env("DOCKSH_SSH__INACTIVITY_TIMEOUT_SECS", "30");

            let config = ShellConfig::resolve(22, Some(Path::new("custom.toml")))
                .map_err(|e| e.to_string())?;
            assert_eq!(config.session.program, "nerdctl");
            assert_eq!(config.auth.mode, AuthMode::AllowAny);
            assert_eq!(config.ssh.inactivity_timeout, Some(Duration::from_secs(30)));
            Ok(())
        });
    }

    #[test]
    fn test_missing_explicit_config_is_an_error() {
        let err = ShellConfig::resolve(22, Some(Path::new("/nonexistent/docksh.toml")))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn test_missing_default_config_uses_defaults() {
        Jail::expect_with(|_jail| {
            let config = ShellConfig::resolve(2222, None).map_err(|e| e.to_string())?;
            assert_eq!(config.session, SessionSettings::default());
            assert_eq!(config.auth.mode, AuthMode::Deny);
            Ok(())
        });
    }
}
