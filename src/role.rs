// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::permission::PermissionSet;

/// Which role an assignment names.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoleChoice {
    /// No role was explicitly chosen, e.g. because the app defined no roles at the time the
    /// share took place. The catalog's default role applies, if there is one.
    #[default]
    DefaultRole,

    /// Every permission the catalog declares, even when no defined role grants them all.
    AllAccess,

    /// A specific role, by index into the catalog.
    Role(usize),
}

/// The permissions passed from one principal to another when sharing.
///
/// Usually this names a single role, but it can also carry explicit permission bits to grant or
/// revoke on top of the chosen role.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub choice: RoleChoice,
    pub add: PermissionSet,
    pub remove: PermissionSet,
}

impl RoleAssignment {
    /// Assignment of the catalog's default role with no extra bits.
    pub fn default_role() -> Self {
        Self::default()
    }

    /// Assignment of every declared permission.
    pub fn all_access() -> Self {
        Self {
            choice: RoleChoice::AllAccess,
            ..Default::default()
        }
    }

    /// Assignment of the role at `index`.
    pub fn role(index: usize) -> Self {
        Self {
            choice: RoleChoice::Role(index),
            ..Default::default()
        }
    }
}

/// One app-defined role: a named bundle of permissions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleDef {
    pub permissions: PermissionSet,

    /// Whether this role is assigned to principals which hold no explicit role.
    pub default: bool,
}

/// A grain's cached role catalog: the mapping from roles to permission sets declared by the app,
/// along with the number of permissions the app defines.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCatalog {
    pub permission_count: usize,
    pub roles: Vec<RoleDef>,
}
