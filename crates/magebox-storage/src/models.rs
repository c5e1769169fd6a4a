//! Domain models.
//!
//! These are what callers see: secret columns are already decrypted, and
//! secret-bearing fields are skipped by `Serialize` and redacted in `Debug`.

use std::fmt;

use chrono::{DateTime, Utc};
use magebox_core::deploy::DeployTarget;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

// ── Roles ────────────────────────────────────────────────────────────

/// Access level of a team member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Dev,
    Readonly,
}

impl Role {
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Admin => write!(f, "admin"),
            Self::Dev => write!(f, "dev"),
            Self::Readonly => write!(f, "readonly"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Self::Admin),
            "dev" => Ok(Self::Dev),
            "readonly" => Ok(Self::Readonly),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

// ── Projects ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
}

// ── Users ────────────────────────────────────────────────────────────

/// A team member with decrypted MFA material.
#[derive(Clone, Serialize)]
pub struct User {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
    pub public_key: Option<String>,
    #[serde(skip)]
    pub token_hash: String,
    #[serde(skip)]
    pub mfa_secret: Option<Zeroizing<String>>,
    pub mfa_enabled: bool,
    #[serde(skip)]
    pub recovery_codes: Vec<String>,
    pub failed_login_count: i64,
    /// Serial of the most recently issued certificate, as a decimal string.
    pub cert_serial: Option<String>,
    pub cert_valid_before: Option<DateTime<Utc>>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: Option<DateTime<Utc>>,
    /// Derived from the grant table, never stored on the user row.
    pub projects: Vec<String>,
}

impl User {
    /// Whether the account has passed its expiry time.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|exp| exp <= now)
    }
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("role", &self.role)
            .field("expires_at", &self.expires_at)
            .field("mfa_enabled", &self.mfa_enabled)
            .field("projects", &self.projects)
            .finish_non_exhaustive()
    }
}

/// Input for creating a user.
#[derive(Clone)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: Role,
    pub expires_at: Option<DateTime<Utc>>,
    pub public_key: Option<String>,
    pub token_hash: String,
    pub created_by: String,
}

/// Partial update applied by `PUT /api/admin/users/{name}`.
#[derive(Debug, Clone, Default)]
pub struct UserUpdate {
    pub email: Option<String>,
    pub role: Option<Role>,
    /// `Some(None)` clears the expiry.
    pub expires_at: Option<Option<DateTime<Utc>>>,
}

// ── Environments ─────────────────────────────────────────────────────

/// A deploy target without its private key.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Environment {
    pub id: i64,
    pub project_id: i64,
    pub project: String,
    pub name: String,
    pub host: String,
    #[sqlx(try_from = "i64")]
    pub port: u16,
    pub deploy_user: String,
    pub host_key_fingerprint: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Environment {
    /// `project/name`
    #[must_use]
    pub fn qualified_name(&self) -> String {
        format!("{}/{}", self.project, self.name)
    }
}

/// An environment together with its decrypted deploy key.
#[derive(Clone)]
pub struct DeployableEnvironment {
    pub environment: Environment,
    pub deploy_key: Zeroizing<String>,
}

impl DeployableEnvironment {
    #[must_use]
    pub fn target(&self) -> DeployTarget {
        DeployTarget {
            host: self.environment.host.clone(),
            port: self.environment.port,
            user: self.environment.deploy_user.clone(),
            private_key: self.deploy_key.clone(),
            host_key_fingerprint: self.environment.host_key_fingerprint.clone(),
        }
    }
}

impl fmt::Debug for DeployableEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeployableEnvironment")
            .field("environment", &self.environment)
            .field("deploy_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Clone)]
pub struct NewEnvironment {
    pub project: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub deploy_user: String,
    pub deploy_key: Zeroizing<String>,
}

// ── Invites ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct Invite {
    pub id: i64,
    #[serde(skip)]
    pub token_hash: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub projects: Vec<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewInvite {
    pub token_hash: String,
    pub username: String,
    pub email: String,
    pub role: Role,
    pub projects: Vec<String>,
    pub created_by: String,
    pub expires_at: DateTime<Utc>,
}

// ── Audit ────────────────────────────────────────────────────────────

/// Filters for audit retrieval. Results are newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub user: Option<String>,
    pub action: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

// ── Certificate authority ────────────────────────────────────────────

/// The CA key pair as stored in the config table.
#[derive(Clone)]
pub struct CaKeys {
    pub private_key: Zeroizing<String>,
    pub public_key: String,
}

impl fmt::Debug for CaKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CaKeys")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &self.public_key)
            .finish()
    }
}
