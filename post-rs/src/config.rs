//! Server configuration
//!
//! Loaded from a TOML file with one table per area. Every field has a
//! default, so an empty file yields a working plain SMTP listener.

use crate::error::{PostError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub smtp: SmtpConfig,
    pub tls: TlsSettings,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Hostname used in greetings; defaults to the machine hostname
    pub name: Option<String>,
    pub listen_addr: String,
    pub banner: Option<String>,
    pub lmtp: bool,
    pub max_clients: Option<usize>,
    pub socket_timeout_secs: u64,
    pub close_timeout_secs: u64,
    pub disable_reverse_lookup: bool,
    pub reverse_lookup_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpConfig {
    /// Maximum message size in bytes; `0` means no limit
    pub size: Option<usize>,
    pub hide_starttls: bool,
    pub hide_size: bool,
    pub hide_pipelining: bool,
    pub hide_8bitmime: bool,
    pub hide_smtputf8: bool,
    pub auth_methods: Vec<String>,
    pub disabled_commands: Vec<String>,
    pub max_allowed_unauthenticated_commands: Option<usize>,
    pub auth_optional: bool,
    pub allow_insecure_auth: bool,
    pub auth_required_message: Option<String>,
    pub use_xclient: bool,
    pub use_xforward: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    /// Implicit TLS: the handshake happens before the greeting
    pub secure: bool,
    /// With `secure`, let the connection (not the listener) run the handshake
    pub needs_upgrade: bool,
    /// TLS is terminated upstream; treat every connection as secure
    pub secured: bool,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Per-hostname certificates selected through SNI
    pub sni: BTreeMap<String, CertPaths>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CertPaths {
    pub cert_path: String,
    pub key_path: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Peers allowed to send a PROXY preamble; `*` matches any peer
    pub use_proxy: Vec<String>,
    /// Hosts whose connections are marked as ignored (health checks etc.)
    pub ignored_hosts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: None,
            listen_addr: "0.0.0.0:2525".to_string(),
            banner: None,
            lmtp: false,
            max_clients: None,
            socket_timeout_secs: 60,
            close_timeout_secs: 30,
            disable_reverse_lookup: false,
            reverse_lookup_timeout_ms: 1500,
        }
    }
}

impl Default for SmtpConfig {
    fn default() -> Self {
        Self {
            size: None,
            hide_starttls: false,
            hide_size: false,
            hide_pipelining: false,
            hide_8bitmime: false,
            hide_smtputf8: false,
            auth_methods: default_auth_methods(),
            disabled_commands: Vec::new(),
            max_allowed_unauthenticated_commands: Some(10),
            auth_optional: false,
            allow_insecure_auth: false,
            auth_required_message: None,
            use_xclient: false,
            use_xforward: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn default_auth_methods() -> Vec<String> {
    vec!["LOGIN".to_string(), "PLAIN".to_string()]
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|e| PostError::Config(e.to_string()))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(content).map_err(|e| PostError::Config(e.to_string()))?;
        config.normalize();
        config.validate()?;
        Ok(config)
    }

    /// Upper-case command and mechanism lists and restore the default
    /// mechanism list when it was left empty.
    pub fn normalize(&mut self) {
        self.smtp.auth_methods = upper_trimmed(&self.smtp.auth_methods);
        if self.smtp.auth_methods.is_empty() {
            self.smtp.auth_methods = default_auth_methods();
        }
        self.smtp.disabled_commands = upper_trimmed(&self.smtp.disabled_commands);
        if self.smtp.size == Some(0) {
            self.smtp.size = None;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.tls.cert_path.is_some() != self.tls.key_path.is_some() {
            return Err(PostError::Config(
                "tls.cert_path and tls.key_path must be set together".to_string(),
            ));
        }
        if self.server.max_clients == Some(0) {
            return Err(PostError::Config(
                "server.max_clients must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Server name used in greetings and CRAM-MD5 challenges
    pub fn server_name(&self) -> String {
        match &self.server.name {
            Some(name) if !name.trim().is_empty() => name.trim().to_string(),
            _ => gethostname::gethostname()
                .into_string()
                .unwrap_or_else(|_| "localhost".to_string()),
        }
    }

    /// Configured message size limit, with `0` treated as unlimited
    pub fn max_message_size(&self) -> Option<usize> {
        self.smtp.size.filter(|size| *size > 0)
    }

    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.server.socket_timeout_secs)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.server.close_timeout_secs)
    }

    pub fn reverse_lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.server.reverse_lookup_timeout_ms)
    }

    /// True when `command` is administratively disabled
    pub fn is_disabled(&self, command: &str) -> bool {
        self.smtp
            .disabled_commands
            .iter()
            .any(|disabled| disabled.eq_ignore_ascii_case(command))
    }

    /// True when `method` is in the allowed SASL mechanism list
    pub fn allows_auth_method(&self, method: &str) -> bool {
        self.smtp
            .auth_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(method))
    }
}

fn upper_trimmed(values: &[String]) -> Vec<String> {
    values
        .iter()
        .map(|value| value.trim().to_uppercase())
        .filter(|value| !value.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.socket_timeout_secs, 60);
        assert_eq!(config.server.close_timeout_secs, 30);
        assert_eq!(config.server.reverse_lookup_timeout_ms, 1500);
        assert_eq!(config.smtp.auth_methods, vec!["LOGIN", "PLAIN"]);
        assert_eq!(config.smtp.max_allowed_unauthenticated_commands, Some(10));
        assert!(!config.smtp.auth_optional);
    }

    #[test]
    fn test_partial_toml() {
        let config = Config::from_toml(
            r#"
            [server]
            name = "mx.example.com"
            lmtp = true

            [smtp]
            size = 1024
            auth_methods = ["plain", " cram-md5 "]
            disabled_commands = ["vrfy"]
            "#,
        )
        .unwrap();

        assert_eq!(config.server_name(), "mx.example.com");
        assert!(config.server.lmtp);
        assert_eq!(config.server.listen_addr, "0.0.0.0:2525");
        assert_eq!(config.smtp.size, Some(1024));
        assert_eq!(config.smtp.auth_methods, vec!["PLAIN", "CRAM-MD5"]);
        assert!(config.is_disabled("VRFY"));
        assert!(config.allows_auth_method("cram-md5"));
        assert!(!config.allows_auth_method("LOGIN"));
    }

    #[test]
    fn test_zero_size_is_unlimited() {
        let config = Config::from_toml("[smtp]\nsize = 0\n").unwrap();
        assert_eq!(config.smtp.size, None);

        let mut config = Config::default();
        config.smtp.size = Some(0);
        assert_eq!(config.max_message_size(), None);
        config.smtp.size = Some(512);
        assert_eq!(config.max_message_size(), Some(512));
    }

    #[test]
    fn test_empty_auth_methods_restored() {
        let config = Config::from_toml("[smtp]\nauth_methods = []\n").unwrap();
        assert_eq!(config.smtp.auth_methods, vec!["LOGIN", "PLAIN"]);
    }

    #[test]
    fn test_sni_table() {
        let config = Config::from_toml(
            r#"
            [tls.sni."mail.example.org"]
            cert_path = "/etc/post/example.pem"
            key_path = "/etc/post/example.key"
            "#,
        )
        .unwrap();

        assert_eq!(
            config.tls.sni["mail.example.org"].cert_path,
            "/etc/post/example.pem"
        );
    }

    #[test]
    fn test_mismatched_tls_paths_rejected() {
        let result = Config::from_toml("[tls]\ncert_path = \"cert.pem\"\n");
        assert!(matches!(result, Err(PostError::Config(_))));
    }
}
