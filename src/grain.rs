// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::role::RoleCatalog;
use crate::vertex::AccountId;

/// Identifier of a grain, the protected resource permissions are computed against.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GrainId(String);

impl GrainId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GrainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for GrainId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for GrainId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A grain record, as the resolution engine sees it.
///
/// All permissions on a grain ultimately flow from its owning account. A grain with `private`
/// unset is a legacy "public" grain: any account which knows the grain's id receives the default
/// role. No such grain has been creatable for years; the carve-out exists purely so old grains
/// keep working and must never be extended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Grain {
    pub id: GrainId,
    pub owner_id: AccountId,
    pub title: String,
    pub private: bool,

    /// The app's role definitions, cached on the grain record.
    pub catalog: RoleCatalog,

    pub trashed: bool,
    pub suspended: bool,
}

impl Grain {
    /// Whether the grain may contribute permissions at all.
    pub fn is_live(&self) -> bool {
        !self.trashed && !self.suspended
    }
}
