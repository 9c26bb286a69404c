// SPDX-License-Identifier: MIT OR Apache-2.0

use serde::{Deserialize, Serialize};

use crate::role::{RoleAssignment, RoleCatalog, RoleChoice};

/// A single permission on a grain.
///
/// `CanAccess` is the implicit "may open the grain at all" permission which every share carries;
/// it exists independently of the app-defined permission vector. `App` permissions are indices
/// into the grain's role catalog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionId {
    CanAccess,
    App(usize),
}

/// A set of permissions like "read" or "write", represented as a boolean vector indexed by
/// app-defined permission ID.
///
/// Permissions are independent of each other; apps define roles like "editor" or "viewer" as
/// aliases for permission sets, but all computation here is done on the sets themselves.
///
/// Sets of different lengths are comparable: the shorter set is treated as if it were padded
/// with `false` up to the longer length.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionSet(Vec<bool>);

impl PermissionSet {
    /// The empty permission set.
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// A set with every bit up to `count` set.
    pub fn all(count: usize) -> Self {
        Self(vec![true; count])
    }

    /// Resolve a role assignment into concrete permissions using the grain's role catalog.
    ///
    /// A default-role choice scans the catalog for the role flagged as default; "all access"
    /// grants every permission the catalog declares; a specific role index uses that role's
    /// permission vector when the index is valid and the empty set otherwise. The assignment's
    /// explicit add and remove bits are applied last in all cases.
    pub fn from_role_assignment(assignment: &RoleAssignment, catalog: &RoleCatalog) -> Self {
        let mut result = match assignment.choice {
            RoleChoice::DefaultRole => catalog
                .roles
                .iter()
                .find(|role| role.default)
                .map(|role| role.permissions.clone())
                .unwrap_or_default(),
            RoleChoice::AllAccess => Self::all(catalog.permission_count),
            RoleChoice::Role(index) => catalog
                .roles
                .get(index)
                .map(|role| role.permissions.clone())
                .unwrap_or_default(),
        };

        result.add(&assignment.add);
        result.remove(&assignment.remove);
        result
    }

    /// Number of explicitly represented bits.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the bit at `index` is set. Indices past the end read as unset.
    pub fn get(&self, index: usize) -> bool {
        self.0.get(index).copied().unwrap_or(false)
    }

    /// Whether no bit is set.
    pub fn is_empty(&self) -> bool {
        !self.0.iter().any(|bit| *bit)
    }

    /// Whether every bit set in `self` is also set in `other`, under the zero-pad rule.
    pub fn is_subset_of(&self, other: &PermissionSet) -> bool {
        self.0
            .iter()
            .enumerate()
            .all(|(index, bit)| !*bit || other.get(index))
    }

    /// Union `other` into `self`, growing as needed. Returns whether any bit changed.
    pub fn add(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        if other.0.len() > self.0.len() {
            self.0.resize(other.0.len(), false);
        }
        for (index, bit) in other.0.iter().enumerate() {
            if *bit && !self.0[index] {
                self.0[index] = true;
                changed = true;
            }
        }
        changed
    }

    /// Clear every bit of `self` that is set in `other`. Returns whether any bit changed.
    pub fn remove(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for index in 0..self.0.len().min(other.0.len()) {
            if other.0[index] && self.0[index] {
                self.0[index] = false;
                changed = true;
            }
        }
        changed
    }

    /// Intersect `self` with `other`. Bits past the end of `other` are cleared. Returns whether
    /// any bit changed.
    pub fn intersect(&mut self, other: &PermissionSet) -> bool {
        let mut changed = false;
        for (index, bit) in self.0.iter_mut().enumerate() {
            if *bit && !other.get(index) {
                *bit = false;
                changed = true;
            }
        }
        changed
    }

    /// The permissions an edge with this set carries: `CanAccess`, then every set app bit.
    pub fn with_can_access(&self) -> impl Iterator<Item = PermissionId> + '_ {
        std::iter::once(PermissionId::CanAccess).chain(
            self.0
                .iter()
                .enumerate()
                .filter(|(_, bit)| **bit)
                .map(|(index, _)| PermissionId::App(index)),
        )
    }

    /// The underlying boolean vector.
    pub fn as_bools(&self) -> &[bool] {
        &self.0
    }
}

impl From<Vec<bool>> for PermissionSet {
    fn from(bits: Vec<bool>) -> Self {
        Self(bits)
    }
}
