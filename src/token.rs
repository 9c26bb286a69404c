// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use rand::RngCore;
use serde::de::Error as SerdeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::grain::GrainId;
use crate::requirement::Requirement;
use crate::role::RoleAssignment;
use crate::vertex::{AccountId, Vertex};

/// Size of token identifiers.
pub const TOKEN_ID_LEN: usize = blake3::OUT_LEN;

/// The stored identifier of a sharing token: the BLAKE3 digest of the bearer secret.
///
/// Possession of the secret authenticates the bearer; only the digest is ever persisted, so a
/// leaked token table does not leak usable credentials.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId([u8; TOKEN_ID_LEN]);

impl TokenId {
    /// Derive the stored identifier from a bearer secret.
    pub fn from_secret(secret: &TokenSecret) -> Self {
        Self(*blake3::hash(secret.as_str().as_bytes()).as_bytes())
    }

    /// Create a `TokenId` from its raw bytes representation.
    pub const fn from_bytes(bytes: [u8; TOKEN_ID_LEN]) -> Self {
        Self(bytes)
    }

    /// Bytes of the identifier.
    pub fn as_bytes(&self) -> &[u8; TOKEN_ID_LEN] {
        &self.0
    }

    /// Convert the identifier to a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({})", self.to_hex())
    }
}

impl Serialize for TokenId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for TokenId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let hex_str = String::deserialize(deserializer)?;
        let bytes = hex::decode(&hex_str).map_err(D::Error::custom)?;
        let bytes: [u8; TOKEN_ID_LEN] = bytes
            .try_into()
            .map_err(|_| D::Error::custom("invalid token id length"))?;
        Ok(Self(bytes))
    }
}

/// The secret bearer string backing a token.
///
/// Handed out exactly once, when the token is created; never stored.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenSecret(String);

impl TokenSecret {
    /// Generate a fresh random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TokenSecret {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the secret itself.
        write!(f, "TokenSecret(..)")
    }
}

/// Who ultimately receives the permissions a token carries.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenOwner {
    /// A user account redeemed the share. `title` is the recipient's name for the grain;
    /// `upstream_title` records the sharer's title at share time when the recipient renamed it.
    Account {
        account_id: AccountId,
        title: String,
        upstream_title: Option<String>,
    },

    /// Another grain holds the token (a saved capability).
    Grain { grain_id: GrainId, save_label: String },

    /// Nobody redeemed the token yet: whoever presents the secret is the recipient.
    Webkey,

    /// Held internally by the frontend itself.
    Frontend,

    /// A short-lived token backing an interactive powerbox request.
    ClientRequest { grain_id: GrainId, session_id: String },

    /// A short-lived token backing an interactive powerbox offer.
    ClientOffer { grain_id: GrainId, session_id: String },
}

/// A sharing token: one edge of the sharing graph.
///
/// A token carries a role assignment from a sharer to a recipient. The sharer is either the
/// issuing account (for a root token) or the parent token (for a child token created by
/// redeeming a prior share); `account_id` is `None` exactly when `parent` is set, since child
/// tokens inherit their issuer through the parent chain. The recipient is the account named in
/// the owner descriptor, or the token's own bearer when no account has redeemed it.
///
/// A token only propagates permissions while every one of its membrane requirements holds.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharingToken {
    pub id: TokenId,
    pub grain_id: GrainId,
    pub parent: Option<TokenId>,
    pub account_id: Option<AccountId>,
    pub role_assignment: RoleAssignment,
    pub owner: TokenOwner,
    pub requirements: Vec<Requirement>,
    pub label: String,

    /// Creation time, Unix milliseconds.
    pub created: u64,

    /// Hard expiry, Unix milliseconds.
    pub expires: Option<u64>,

    /// Self-destruct deadline for tokens which were never redeemed, Unix milliseconds.
    pub expires_if_unused: Option<u64>,

    /// Whether the bearer may re-share (webkey tokens only; inherited from the parent chain).
    pub for_sharing: bool,

    /// Whether an `ApiHost` record accompanies this token.
    pub has_api_host: bool,

    pub revoked: bool,
    pub suspended: bool,
    pub trashed: bool,
}

impl SharingToken {
    /// The vertex which receives permissions from this token.
    pub fn recipient_vertex(&self) -> Vertex {
        match &self.owner {
            TokenOwner::Account { account_id, .. } => Vertex::Account(account_id.clone()),
            _ => Vertex::Token(self.id),
        }
    }

    /// The vertex this token draws permissions from, when the record is well-formed.
    pub fn sharer_vertex(&self) -> Option<Vertex> {
        match (&self.parent, &self.account_id) {
            (Some(parent), _) => Some(Vertex::Token(*parent)),
            (None, Some(account_id)) => Some(Vertex::Account(account_id.clone())),
            (None, None) => None,
        }
    }

    /// Whether the token may still propagate permissions at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        !self.revoked
            && !self.suspended
            && !self.trashed
            && self.expires.is_none_or(|deadline| now < deadline)
    }
}

/// Companion record granting unauthenticated HTTP access for a webkey token.
///
/// Keyed by a digest of the secret in a separate namespace, so the serving path can find it from
/// an incoming bearer secret without being able to enumerate tokens.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiHost {
    pub id: String,
    pub token_digest: TokenId,
    pub dav_classes: Vec<String>,
}

impl ApiHost {
    /// Derive the host record for a token's secret.
    pub fn for_secret(secret: &TokenSecret, token_id: &TokenId, dav_classes: Vec<String>) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"api-host:");
        hasher.update(secret.as_str().as_bytes());
        Self {
            id: hex::encode(hasher.finalize().as_bytes()),
            token_digest: TokenId::from_bytes(*blake3::hash(token_id.as_bytes()).as_bytes()),
            dav_classes,
        }
    }
}
