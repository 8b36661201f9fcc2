//! Identity and access: who is connecting, and may they open this
//! document.
//!
//! Both checks are external collaborators behind async traits so
//! deployments can plug in their own identity provider and sharing
//! model. Two self-contained implementations ship with the crate:
//! [`HmacTokenVerifier`] and [`StaticAccessOracle`].

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

use crate::DocumentId;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a session may do once attached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Editor,
    Viewer,
}

impl Role {
    pub fn can_edit(self) -> bool {
        !matches!(self, Role::Viewer)
    }
}

/// Access oracle verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Owner,
    Collaborator(Role),
    Denied,
}

impl Access {
    pub fn role(self) -> Option<Role> {
        match self {
            Access::Owner => Some(Role::Owner),
            Access::Collaborator(role) => Some(role),
            Access::Denied => None,
        }
    }

    /// Owners may create a document that does not exist yet.
    pub fn may_create(self) -> bool {
        matches!(self, Access::Owner)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("no credential presented")]
    Missing,
    #[error("credential is malformed")]
    Malformed,
    #[error("credential signature is invalid")]
    BadSignature,
    #[error("credential expired")]
    Expired,
    #[error("signing key rejected")]
    InvalidKey,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

#[async_trait]
pub trait AccessOracle: Send + Sync {
    async fn authorize(&self, user: &UserId, document: DocumentId) -> Access;
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Shared-secret tokens of the form `{user}.{expires_unix}.{hex hmac}`.
///
/// User ids may contain dots; the signature and expiry are taken from
/// the right.
#[derive(Clone)]
pub struct HmacTokenVerifier {
    keyed: HmacSha256,
}

impl HmacTokenVerifier {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, AuthError> {
        let keyed = HmacSha256::new_from_slice(secret.as_ref()).map_err(|_| AuthError::InvalidKey)?;
        Ok(Self { keyed })
    }

    fn mac(&self, message: &str) -> HmacSha256 {
        let mut mac = self.keyed.clone();
        mac.update(message.as_bytes());
        mac
    }

    /// Mint a token for `user` valid until `expires_at` (unix seconds).
    pub fn issue(&self, user: &UserId, expires_at: u64) -> String {
        let body = format!("{user}.{expires_at}");
        let sig = hex::encode(self.mac(&body).finalize().into_bytes());
        format!("{body}.{sig}")
    }

    /// Mint a token valid for `ttl_secs` from now.
    pub fn issue_for(&self, user: &UserId, ttl_secs: u64) -> String {
        self.issue(user, unix_now().saturating_add(ttl_secs))
    }

    pub fn check(&self, token: &str, now: u64) -> Result<UserId, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let (body, sig) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        let (user, expires) = body.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if user.is_empty() {
            return Err(AuthError::Malformed);
        }
        let expires: u64 = expires.parse().map_err(|_| AuthError::Malformed)?;
        let sig = hex::decode(sig).map_err(|_| AuthError::Malformed)?;

        self.mac(body)
            .verify_slice(&sig)
            .map_err(|_| AuthError::BadSignature)?;
        if expires <= now {
            return Err(AuthError::Expired);
        }
        Ok(UserId::new(user))
    }
}

#[async_trait]
impl TokenVerifier for HmacTokenVerifier {
    async fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        self.check(token, unix_now())
    }
}

/// One document's sharing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub document: DocumentId,
    pub owner: UserId,
    #[serde(default)]
    pub collaborators: HashMap<UserId, Role>,
}

/// Access decisions from a fixed rule table.
///
/// Documents without a rule are open to `default_owner` if set (used for
/// local development), and denied otherwise.
#[derive(Debug, Clone, Default)]
pub struct StaticAccessOracle {
    rules: HashMap<DocumentId, AccessRule>,
    default_owner: Option<UserId>,
}

impl StaticAccessOracle {
    pub fn new(rules: impl IntoIterator<Item = AccessRule>) -> Self {
        Self {
            rules: rules.into_iter().map(|r| (r.document, r)).collect(),
            default_owner: None,
        }
    }

    pub fn with_default_owner(mut self, owner: UserId) -> Self {
        self.default_owner = Some(owner);
        self
    }

    pub fn decide(&self, user: &UserId, document: DocumentId) -> Access {
        match self.rules.get(&document) {
            Some(rule) if &rule.owner == user => Access::Owner,
            Some(rule) => match rule.collaborators.get(user) {
                Some(Role::Owner) => Access::Owner,
                Some(role) => Access::Collaborator(*role),
                None => Access::Denied,
            },
            None if self.default_owner.as_ref() == Some(user) => Access::Owner,
            None => Access::Denied,
        }
    }
}

#[async_trait]
impl AccessOracle for StaticAccessOracle {
    async fn authorize(&self, user: &UserId, document: DocumentId) -> Access {
        self.decide(user, document)
    }
}
