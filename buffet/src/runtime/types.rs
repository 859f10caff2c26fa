//! Core data types for session lifecycle management.

use chrono::{DateTime, Utc};
use rusqlite::ToSql;
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

use buffet_shared::errors::{BuffetError, BuffetResult};

use crate::catalogue::CatalogueMetadata;

pub use crate::runtime::state::SessionStatus;

// ============================================================================
// SESSION ID
// ============================================================================

/// Session identifier (ULID format for sortability).
///
/// ```
/// use buffet::SessionId;
///
/// let id = SessionId::new();
/// assert_eq!(id.as_str().len(), 26);
/// assert_eq!(id.short().len(), 8);
/// ```
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Length of full session ID (26 chars = ULID format).
    pub const FULL_LENGTH: usize = 26;

    /// Length of short session ID for display (8 chars).
    pub const SHORT_LENGTH: usize = 8;

    /// Generate a new ULID-based session ID.
    pub fn new() -> Self {
        Self(ulid::Ulid::new().to_string())
    }

    /// Parse a SessionId, returning `None` unless `s` is a 26-char ULID.
    pub fn parse(s: &str) -> Option<Self> {
        if Self::is_valid(s) {
            Some(Self(s.to_string()))
        } else {
            None
        }
    }

    pub fn is_valid(s: &str) -> bool {
        s.len() == Self::FULL_LENGTH && ulid::Ulid::from_string(s).is_ok()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 8 characters, for logs and tables.
    pub fn short(&self) -> &str {
        &self.0[..Self::SHORT_LENGTH]
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.short())
    }
}

impl AsRef<str> for SessionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for SessionId {
    type Err = BuffetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| BuffetError::NotFound(format!("session {}", s)))
    }
}

impl ToSql for SessionId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
    }
}

impl FromSql for SessionId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        Self::parse(text)
            .ok_or_else(|| FromSqlError::Other(format!("invalid session id '{}'", text).into()))
    }
}

// ============================================================================
// OWNER ID
// ============================================================================

/// Authenticated user identity, as supplied by the identity provider.
///
/// Owner ids end up in file names (control socket, capture directory), so
/// only a conservative character set is accepted.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct OwnerId(String);

impl OwnerId {
    pub const MAX_LENGTH: usize = 64;

    pub fn new(id: impl Into<String>) -> BuffetResult<Self> {
        let id = id.into();
        if id.is_empty() || id.len() > Self::MAX_LENGTH {
            return Err(BuffetError::InvalidArgument(format!(
                "owner id must be 1-{} characters",
                Self::MAX_LENGTH
            )));
        }
        if id.starts_with('.')
            || !id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@'))
        {
            return Err(BuffetError::InvalidArgument(format!(
                "owner id '{}' contains unsupported characters",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OwnerId({})", self.0)
    }
}

impl TryFrom<String> for OwnerId {
    type Error = BuffetError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<OwnerId> for String {
    fn from(owner: OwnerId) -> Self {
        owner.0
    }
}

impl std::str::FromStr for OwnerId {
    type Err = BuffetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl ToSql for OwnerId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::Borrowed(ValueRef::Text(self.0.as_bytes())))
    }
}

impl FromSql for OwnerId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Self::new(value.as_str()?).map_err(|e| FromSqlError::Other(Box::new(e)))
    }
}

// ============================================================================
// REQUESTER
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    User,
    Admin,
}

/// Identity attached to a request that acts on an existing session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub owner: OwnerId,
    pub role: Role,
}

impl Requester {
    pub fn user(owner: OwnerId) -> Self {
        Self {
            owner,
            role: Role::User,
        }
    }

    pub fn admin(owner: OwnerId) -> Self {
        Self {
            owner,
            role: Role::Admin,
        }
    }

    /// Owners act on their own sessions; admins act on any.
    pub fn may_act_on(&self, session_owner: &OwnerId) -> bool {
        self.role == Role::Admin || &self.owner == session_owner
    }
}

// ============================================================================
// PUBLIC PROJECTIONS
// ============================================================================

/// What a session owner is allowed to see.
///
/// Process ids and the capture path stay internal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionView {
    pub id: SessionId,
    /// Port the browser viewer connects to.
    pub public_port: u16,
    pub image_ref: String,
    pub owner_id: OwnerId,
    /// `None` when the display runs without a password.
    pub display_credential: Option<String>,
    pub catalogue_metadata: Option<CatalogueMetadata>,
}

/// Operator inventory row: no credential, no pids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub owner_id: OwnerId,
    pub slot: u16,
    pub public_port: u16,
    pub display_port: u16,
    pub image_ref: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

/// Why a session came up without a display credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum DegradedReason {
    /// The host's display service cannot take a password.
    CredentialUnsupported,
    /// The control channel failed; the VM runs without a password.
    ControlChannel(String),
}

impl fmt::Display for DegradedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DegradedReason::CredentialUnsupported => {
                write!(f, "display credential unsupported on this host")
            }
            DegradedReason::ControlChannel(detail) => {
                write!(f, "display credential not set: {}", detail)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum ProvisioningOutcome {
    FullySucceeded,
    SucceededDegraded(DegradedReason),
}

impl ProvisioningOutcome {
    pub fn is_degraded(&self) -> bool {
        matches!(self, ProvisioningOutcome::SucceededDegraded(_))
    }
}

/// Result of a successful `create`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provisioned {
    pub view: SessionView,
    pub outcome: ProvisioningOutcome,
}
