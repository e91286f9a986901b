//! Tunnel configuration loaded from TOML.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::session::{SshAuth, SshTarget};
use crate::tunnel::{TunnelOptions, DEFAULT_BUFFER_SIZE};

/// Environment variable consulted when password auth has no password configured.
pub const PASSWORD_ENV: &str = "SSH_TUNNEL_PASSWORD";

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// SSH server to forward through
    pub ssh: SshConfig,

    /// Local listener and forwarding destination
    pub tunnel: TunnelConfig,
}

/// Authentication method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Key,
    /// Keys held by the SSH agent at $SSH_AUTH_SOCK
    Agent,
}

/// SSH connection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// SSH server host name or address
    pub host: String,

    /// SSH server port (default: 22)
    pub port: u16,

    /// Login user (default: $USER)
    pub user: String,

    pub auth: AuthMethod,

    /// Password for `auth = "password"`; falls back to $SSH_TUNNEL_PASSWORD
    pub password: Option<String>,

    /// Private key for `auth = "key"` (default: ~/.ssh/id_ed25519)
    pub key_path: PathBuf,

    pub key_passphrase: Option<String>,

    /// Verify the server key against ~/.ssh/known_hosts
    pub verify_host_key: bool,

    pub connect_timeout_secs: u64,

    /// Keep-alive interval in seconds (0 disables keep-alives)
    pub keepalive_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        let key_path = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ssh")
            .join("id_ed25519");

        Self {
            host: "localhost".to_string(),
            port: 22,
            user: std::env::var("USER").unwrap_or_else(|_| "root".to_string()),
            auth: AuthMethod::Key,
            password: None,
            key_path,
            key_passphrase: None,
            verify_host_key: true,
            connect_timeout_secs: 15,
            keepalive_secs: 30,
        }
    }
}

/// Forwarding settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Local bind address (default: "127.0.0.1")
    pub bind_host: String,

    /// Local port; 0 lets the OS pick one
    pub bind_port: u16,

    /// Destination host as seen from the SSH server
    pub remote_host: String,

    pub remote_port: u16,

    /// Bytes moved per read in either direction
    pub buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            bind_port: 0,
            remote_host: "localhost".to_string(),
            remote_port: 0,
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

impl TunnelConfig {
    pub fn to_options(&self) -> TunnelOptions {
        TunnelOptions::new(self.remote_host.clone(), self.remote_port)
            .bind(self.bind_host.clone(), self.bind_port)
            .buffer_size(self.buffer_size)
    }

    /// Apply a parsed `-L` specification.
    pub fn apply(&mut self, spec: ForwardSpec) {
        if let Some(host) = spec.bind_host {
            self.bind_host = host;
        }
        self.bind_port = spec.bind_port;
        self.remote_host = spec.remote_host;
        self.remote_port = spec.remote_port;
    }
}

impl SshConfig {
    /// Resolve the connection target, reading the password from the
    /// environment when the config has none.
    pub fn to_target(&self) -> Result<SshTarget> {
        let auth = match self.auth {
            AuthMethod::Password => {
                let password = match &self.password {
                    Some(password) => password.clone(),
                    None => std::env::var(PASSWORD_ENV).map_err(|_| {
                        anyhow!("Password auth selected but no password configured and ${} is unset", PASSWORD_ENV)
                    })?,
                };
                SshAuth::Password(password)
            }
            AuthMethod::Key => SshAuth::PrivateKey {
                path: self.key_path.clone(),
                passphrase: self.key_passphrase.clone(),
            },
            AuthMethod::Agent => SshAuth::Agent,
        };

        Ok(SshTarget {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            auth,
            verify_host_key: self.verify_host_key,
            connect_timeout: Duration::from_secs(self.connect_timeout_secs.max(1)),
            keepalive_interval: (self.keepalive_secs > 0)
                .then(|| Duration::from_secs(self.keepalive_secs)),
        })
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from a file, or return defaults if the file doesn't exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Check the settings needed to start a tunnel.
    pub fn validate(&self) -> Result<()> {
        if self.ssh.host.trim().is_empty() {
            bail!("ssh.host must not be empty");
        }
        if self.ssh.port == 0 {
            bail!("ssh.port must not be 0");
        }
        if self.ssh.user.trim().is_empty() {
            bail!("ssh.user must not be empty");
        }
        if self.tunnel.remote_host.trim().is_empty() {
            bail!("tunnel.remote_host must not be empty");
        }
        if self.tunnel.remote_port == 0 {
            bail!("tunnel.remote_port must be set");
        }
        if self.tunnel.buffer_size == 0 {
            bail!("tunnel.buffer_size must be positive");
        }
        Ok(())
    }
}

/// A parsed `[bind_host:]bind_port:remote_host:remote_port` forward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub bind_host: Option<String>,
    pub bind_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

/// Parse an `ssh -L` style forward specification.
///
/// IPv6 addresses must be bracketed, e.g. `[::1]:8080:db:5432`.
pub fn parse_forward_spec(spec: &str) -> Result<ForwardSpec> {
    let parts = split_host_ports(spec)?;
    let (bind_host, rest) = match parts.len() {
        3 => (None, &parts[..]),
        4 => (Some(parts[0].clone()), &parts[1..]),
        _ => bail!(
            "Invalid forward '{}': expected [bind_host:]bind_port:remote_host:remote_port",
            spec
        ),
    };

    let bind_port = parse_port(&rest[0], spec)?;
    let remote_host = rest[1].clone();
    let remote_port = parse_port(&rest[2], spec)?;

    if remote_host.is_empty() {
        bail!("Invalid forward '{}': remote host is empty", spec);
    }
    if remote_port == 0 {
        bail!("Invalid forward '{}': remote port must not be 0", spec);
    }
    if matches!(&bind_host, Some(h) if h.is_empty()) {
        bail!("Invalid forward '{}': bind host is empty", spec);
    }

    Ok(ForwardSpec {
        bind_host,
        bind_port,
        remote_host,
        remote_port,
    })
}

/// Split on ':' outside of brackets, stripping the brackets.
fn split_host_ports(spec: &str) -> Result<Vec<String>> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_brackets = false;

    for c in spec.chars() {
        match c {
            '[' if !in_brackets && current.is_empty() => in_brackets = true,
            ']' if in_brackets => in_brackets = false,
            ':' if !in_brackets => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if in_brackets {
        bail!("Invalid forward '{}': unterminated '['", spec);
    }
    parts.push(current);
    Ok(parts)
}

fn parse_port(value: &str, spec: &str) -> Result<u16> {
    value
        .parse()
        .with_context(|| format!("Invalid forward '{}': bad port '{}'", spec, value))
}
