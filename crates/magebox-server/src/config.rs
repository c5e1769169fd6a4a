//! Server configuration for `MageBox`.
//!
//! Loads configuration from environment variables with sensible defaults.
//! All settings can be overridden via `MAGEBOX_*` environment variables.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use ipnet::IpNet;
use zeroize::Zeroizing;

/// Default listen port.
const DEFAULT_PORT: u16 = 8443;

/// When MFA is demanded of admin users on admin routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MfaPolicy {
    /// Every admin must have MFA enabled and present a code.
    Required,
    /// Admins who enabled MFA must present a code.
    Optional,
    /// MFA is never checked.
    Disabled,
}

impl FromStr for MfaPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "required" => Ok(Self::Required),
            "optional" => Ok(Self::Optional),
            "disabled" => Ok(Self::Disabled),
            other => Err(format!("unknown MFA policy: {other}")),
        }
    }
}

/// Server configuration.
#[derive(Clone)]
pub struct ServerConfig {
    /// Address to bind the HTTP listener to.
    pub bind_addr: SocketAddr,
    /// Directory holding the database and master key file.
    pub data_dir: PathBuf,
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Base64 master key supplied directly instead of the key file.
    pub master_key: Option<Zeroizing<String>>,
    /// Static admin token; hashed at startup and never kept in plaintext.
    pub admin_token: Option<Zeroizing<String>>,
    /// Log level filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// The public endpoint is served over TLS (enables HSTS).
    pub tls_enabled: bool,
    /// Peers whose `X-Forwarded-For` / `X-Real-IP` headers are believed.
    pub trusted_proxies: Vec<IpNet>,
    /// If non-empty, only these client addresses may connect.
    pub ip_allowlist: Vec<IpNet>,
    /// Requests allowed per client per window.
    pub rate_limit: u32,
    pub rate_window: Duration,
    /// Consecutive failures before an IP is locked out.
    pub lockout_max_attempts: u32,
    pub lockout_duration: Duration,
    pub mfa_policy: MfaPolicy,
    /// Issuer label shown in authenticator apps.
    pub mfa_issuer: String,
    /// Whether the SSH certificate authority is active.
    pub ca_enabled: bool,
    pub cert_validity: Duration,
    /// Default invite lifetime in hours.
    pub invite_ttl_hours: i64,
    /// Audit entries older than this many days are purged. `0` keeps
    /// everything.
    pub audit_retention_days: u32,
    pub maintenance_interval: Duration,
    /// SSH dial and inactivity timeout for key deployment.
    pub ssh_timeout: Duration,
    /// Upper bound on concurrently running background tasks.
    pub max_background_tasks: usize,
    /// List entries that failed to parse, reported once logging is up.
    pub rejected_entries: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data");
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], DEFAULT_PORT)),
            db_path: data_dir.join("magebox.db"),
            data_dir,
            master_key: None,
            admin_token: None,
            log_level: "info".to_owned(),
            tls_enabled: false,
            trusted_proxies: Vec::new(),
            ip_allowlist: Vec::new(),
            rate_limit: 100,
            rate_window: Duration::from_secs(60),
            lockout_max_attempts: 5,
            lockout_duration: Duration::from_secs(900),
            mfa_policy: MfaPolicy::Optional,
            mfa_issuer: "MageBox".to_owned(),
            ca_enabled: true,
            cert_validity: Duration::from_secs(24 * 3600),
            invite_ttl_hours: 48,
            audit_retention_days: 0,
            maintenance_interval: Duration::from_secs(300),
            ssh_timeout: Duration::from_secs(30),
            max_background_tasks: 16,
            rejected_entries: Vec::new(),
        }
    }
}

impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_path", &self.db_path)
            .field("master_key", &self.master_key.as_ref().map(|_| "[REDACTED]"))
            .field("admin_token", &self.admin_token.as_ref().map(|_| "[REDACTED]"))
            .field("tls_enabled", &self.tls_enabled)
            .field("mfa_policy", &self.mfa_policy)
            .field("ca_enabled", &self.ca_enabled)
            .finish_non_exhaustive()
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `PORT`: port to bind on (binds to `0.0.0.0`)
    /// - `MAGEBOX_BIND_ADDR`: full bind address (overrides `PORT`, default: `127.0.0.1:8443`)
    /// - `MAGEBOX_DATA_DIR`: data directory (default: `./data`)
    /// - `MAGEBOX_DB_PATH`: database file (default: `<data>/magebox.db`)
    /// - `MAGEBOX_MASTER_KEY`: base64 master key (default: `<data>/master.key`)
    /// - `MAGEBOX_ADMIN_TOKEN`: static admin token
    /// - `MAGEBOX_LOG_LEVEL`: log filter (default: `info`)
    /// - `MAGEBOX_TLS_ENABLED`: send HSTS (default: `false`)
    /// - `MAGEBOX_TRUSTED_PROXIES`, `MAGEBOX_IP_ALLOWLIST`: comma-separated CIDRs or IPs
    /// - `MAGEBOX_RATE_LIMIT`, `MAGEBOX_RATE_WINDOW_SECS`: default `100` per `60`s
    /// - `MAGEBOX_LOCKOUT_MAX_ATTEMPTS`, `MAGEBOX_LOCKOUT_SECS`: default `5`, `900`
    /// - `MAGEBOX_MFA_POLICY`: `required`, `optional` or `disabled` (default: `optional`)
    /// - `MAGEBOX_MFA_ISSUER`: TOTP issuer (default: `MageBox`)
    /// - `MAGEBOX_CA_ENABLED`: SSH CA (default: `true`)
    /// - `MAGEBOX_CERT_VALIDITY_HOURS`: default `24`
    /// - `MAGEBOX_INVITE_TTL_HOURS`: default `48`
    /// - `MAGEBOX_AUDIT_RETENTION_DAYS`: default `0` (keep forever)
    /// - `MAGEBOX_MAINTENANCE_INTERVAL_SECS`: default `300`
    /// - `MAGEBOX_SSH_TIMEOUT_SECS`: default `30`
    /// - `MAGEBOX_MAX_BACKGROUND_TASKS`: default `16`
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable source.
    #[must_use]
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let flag = |key: &str, default: bool| {
            var(key).map_or(default, |v| {
                matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes")
            })
        };
        let secs = |key: &str, default: Duration| {
            parsed(&var, key).map_or(default, Duration::from_secs)
        };

        // Priority: MAGEBOX_BIND_ADDR > PORT > default 127.0.0.1:8443
        let bind_addr = if let Some(addr) = var("MAGEBOX_BIND_ADDR") {
            addr.parse().unwrap_or(defaults.bind_addr)
        } else if let Some(port) = var("PORT") {
            SocketAddr::from(([0, 0, 0, 0], port.parse().unwrap_or(DEFAULT_PORT)))
        } else {
            defaults.bind_addr
        };

        let data_dir = var("MAGEBOX_DATA_DIR").map_or(defaults.data_dir, PathBuf::from);
        let db_path = var("MAGEBOX_DB_PATH")
            .map_or_else(|| data_dir.join("magebox.db"), PathBuf::from);

        let mut rejected_entries = Vec::new();
        let trusted_proxies = parse_networks(
            &var("MAGEBOX_TRUSTED_PROXIES").unwrap_or_default(),
            &mut rejected_entries,
        );
        let ip_allowlist = parse_networks(
            &var("MAGEBOX_IP_ALLOWLIST").unwrap_or_default(),
            &mut rejected_entries,
        );

        let mfa_policy = match var("MAGEBOX_MFA_POLICY").map(|v| v.parse::<MfaPolicy>()) {
            Some(Ok(policy)) => policy,
            Some(Err(e)) => {
                rejected_entries.push(e);
                defaults.mfa_policy
            }
            None => defaults.mfa_policy,
        };

        Self {
            bind_addr,
            data_dir,
            db_path,
            master_key: var("MAGEBOX_MASTER_KEY")
                .filter(|v| !v.trim().is_empty())
                .map(Zeroizing::new),
            admin_token: var("MAGEBOX_ADMIN_TOKEN")
                .filter(|v| !v.trim().is_empty())
                .map(Zeroizing::new),
            log_level: var("MAGEBOX_LOG_LEVEL").unwrap_or(defaults.log_level),
            tls_enabled: flag("MAGEBOX_TLS_ENABLED", defaults.tls_enabled),
            trusted_proxies,
            ip_allowlist,
            rate_limit: parsed(&var, "MAGEBOX_RATE_LIMIT").unwrap_or(defaults.rate_limit),
            rate_window: secs("MAGEBOX_RATE_WINDOW_SECS", defaults.rate_window),
            lockout_max_attempts: parsed(&var, "MAGEBOX_LOCKOUT_MAX_ATTEMPTS")
                .unwrap_or(defaults.lockout_max_attempts),
            lockout_duration: secs("MAGEBOX_LOCKOUT_SECS", defaults.lockout_duration),
            mfa_policy,
            mfa_issuer: var("MAGEBOX_MFA_ISSUER").unwrap_or(defaults.mfa_issuer),
            ca_enabled: flag("MAGEBOX_CA_ENABLED", defaults.ca_enabled),
            cert_validity: parsed(&var, "MAGEBOX_CERT_VALIDITY_HOURS")
                .map_or(defaults.cert_validity, |h: u64| Duration::from_secs(h * 3600)),
            invite_ttl_hours: parsed(&var, "MAGEBOX_INVITE_TTL_HOURS")
                .unwrap_or(defaults.invite_ttl_hours),
            audit_retention_days: parsed(&var, "MAGEBOX_AUDIT_RETENTION_DAYS")
                .unwrap_or(defaults.audit_retention_days),
            maintenance_interval: secs(
                "MAGEBOX_MAINTENANCE_INTERVAL_SECS",
                defaults.maintenance_interval,
            ),
            ssh_timeout: secs("MAGEBOX_SSH_TIMEOUT_SECS", defaults.ssh_timeout),
            max_background_tasks: parsed(&var, "MAGEBOX_MAX_BACKGROUND_TASKS")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.max_background_tasks),
            rejected_entries,
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

/// Parse a comma-separated list of CIDRs or bare addresses. A bare address
/// becomes a single-host network. Unparsable entries are collected into
/// `rejected`.
pub fn parse_networks(list: &str, rejected: &mut Vec<String>) -> Vec<IpNet> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            entry
                .parse::<IpNet>()
                .ok()
                .or_else(|| entry.parse::<IpAddr>().ok().map(IpNet::from))
                .or_else(|| {
                    rejected.push(format!("invalid network: {entry}"));
                    None
                })
        })
        .collect()
}

/// Whether `ip` falls inside any of `networks`.
#[must_use]
pub fn contains_ip(networks: &[IpNet], ip: IpAddr) -> bool {
    networks.iter().any(|net| net.contains(&ip))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> ServerConfig {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        ServerConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_without_variables() {
        let cfg = config(&[]);
        assert_eq!(cfg.bind_addr, "127.0.0.1:8443".parse().unwrap());
        assert_eq!(cfg.db_path, PathBuf::from("./data/magebox.db"));
        assert_eq!(cfg.rate_limit, 100);
        assert_eq!(cfg.lockout_max_attempts, 5);
        assert_eq!(cfg.lockout_duration, Duration::from_secs(900));
        assert_eq!(cfg.mfa_policy, MfaPolicy::Optional);
        assert!(cfg.ca_enabled);
        assert!(!cfg.tls_enabled);
        assert!(cfg.master_key.is_none());
    }

    #[test]
    fn bind_addr_priority() {
        assert_eq!(
            config(&[("PORT", "9000")]).bind_addr,
            "0.0.0.0:9000".parse().unwrap()
        );
        assert_eq!(
            config(&[("PORT", "9000"), ("MAGEBOX_BIND_ADDR", "10.0.0.1:7000")]).bind_addr,
            "10.0.0.1:7000".parse().unwrap()
        );
    }

    #[test]
    fn db_path_follows_data_dir() {
        let cfg = config(&[("MAGEBOX_DATA_DIR", "/var/lib/magebox")]);
        assert_eq!(cfg.db_path, PathBuf::from("/var/lib/magebox/magebox.db"));
    }

    #[test]
    fn networks_skip_invalid_entries() {
        let cfg = config(&[("MAGEBOX_TRUSTED_PROXIES", "10.0.0.0/8, 192.168.1.1, nope, ::1")]);
        assert_eq!(cfg.trusted_proxies.len(), 3);
        assert_eq!(cfg.rejected_entries, ["invalid network: nope"]);
        assert!(contains_ip(&cfg.trusted_proxies, "10.20.30.40".parse().unwrap()));
        assert!(contains_ip(&cfg.trusted_proxies, "192.168.1.1".parse().unwrap()));
        assert!(!contains_ip(&cfg.trusted_proxies, "192.168.1.2".parse().unwrap()));
    }

    #[test]
    fn mfa_policy_parsing() {
        assert_eq!(
            config(&[("MAGEBOX_MFA_POLICY", "Required")]).mfa_policy,
            MfaPolicy::Required
        );
        let bad = config(&[("MAGEBOX_MFA_POLICY", "sometimes")]);
        assert_eq!(bad.mfa_policy, MfaPolicy::Optional);
        assert_eq!(bad.rejected_entries.len(), 1);
    }

    #[test]
    fn durations_and_flags() {
        let cfg = config(&[
            ("MAGEBOX_CERT_VALIDITY_HOURS", "8"),
            ("MAGEBOX_TLS_ENABLED", "1"),
            ("MAGEBOX_CA_ENABLED", "false"),
            ("MAGEBOX_MAX_BACKGROUND_TASKS", "0"),
        ]);
        assert_eq!(cfg.cert_validity, Duration::from_secs(8 * 3600));
        assert!(cfg.tls_enabled);
        assert!(!cfg.ca_enabled);
        assert_eq!(cfg.max_background_tasks, 16);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = config(&[("MAGEBOX_ADMIN_TOKEN", "hunter2")]);
        assert!(!format!("{cfg:?}").contains("hunter2"));
    }
}
