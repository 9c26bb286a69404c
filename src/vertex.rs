// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::token::TokenId;

/// Identifier of a user account.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AccountId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for AccountId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A principal which can be the subject of a permission query: a user account, or the bearer of
/// an un-redeemed token.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Principal {
    Account(AccountId),
    Token(TokenId),
}

impl Principal {
    /// The sharing-graph vertex this principal occupies.
    pub fn vertex(&self) -> Vertex {
        match self {
            Principal::Account(account_id) => Vertex::Account(account_id.clone()),
            Principal::Token(token_id) => Vertex::Token(*token_id),
        }
    }
}

/// A vertex in the sharing graph of one grain.
///
/// `Owner` is the pseudo-vertex standing for "the grain's owner", the ultimate source of all
/// permissions on the grain; it only appears during graph traversal and is never the subject of
/// a query. A vertex is always qualified by a grain id in context, since a user can hold
/// permissions on many grains while a token belongs to exactly one.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vertex {
    Owner,
    Account(AccountId),
    Token(TokenId),
}

impl fmt::Display for Vertex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Vertex::Owner => write!(f, "owner"),
            Vertex::Account(account_id) => write!(f, "account:{account_id}"),
            Vertex::Token(token_id) => write!(f, "token:{token_id}"),
        }
    }
}
