// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::grain::GrainId;
use crate::permission::PermissionSet;
use crate::token::TokenId;
use crate::vertex::{AccountId, Principal};

/// A membrane requirement: a precondition under which a token remains valid.
///
/// When a capability travels from grain to grain it crosses revocable membranes; each crossing
/// leaves a requirement on the resulting token. A token only propagates permissions while *all*
/// of its requirements hold, so revoking any link in the chain revokes everything derived
/// through it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    /// Some principal must hold the given permissions on the given grain. This is what makes
    /// edges conditional and can pull other grains' sharing graphs into a computation.
    PermissionsHeld {
        grain_id: GrainId,
        holder: Principal,
        permissions: PermissionSet,
    },

    /// The account must be a global administrator.
    IsAdmin { account_id: AccountId },

    /// The referenced token must itself still be valid (not revoked or suspended).
    TokenValid { token_id: TokenId },
}

/// An accumulator of not-yet-proven requirements gathered across many tokens.
///
/// This is the frontier a resolution consults when its current knowledge is not enough to prove
/// the goal: each outstanding requirement points at tokens or grains which might have to be
/// pulled in. Overlapping permissions-held requirements for the same (grain, principal) pair
/// collapse into one entry by unioning their permission bits.
#[derive(Debug, Default)]
pub struct RequirementSet {
    held: HashMap<GrainId, HashMap<Principal, PermissionSet>>,
    admin: HashSet<AccountId>,
    token_valid: HashSet<TokenId>,
}

impl RequirementSet {
    pub fn is_empty(&self) -> bool {
        self.held.values().all(|holders| holders.is_empty())
            && self.admin.is_empty()
            && self.token_valid.is_empty()
    }

    /// Merge `requirements` into the accumulated set.
    pub fn add_requirements(&mut self, requirements: &[Requirement]) {
        for requirement in requirements {
            match requirement {
                Requirement::PermissionsHeld {
                    grain_id,
                    holder,
                    permissions,
                } => {
                    self.held
                        .entry(grain_id.clone())
                        .or_default()
                        .entry(holder.clone())
                        .and_modify(|held| {
                            held.add(permissions);
                        })
                        .or_insert_with(|| permissions.clone());
                }
                Requirement::IsAdmin { account_id } => {
                    self.admin.insert(account_id.clone());
                }
                Requirement::TokenValid { token_id } => {
                    self.token_valid.insert(*token_id);
                }
            }
        }
    }

    /// Grains referenced by permissions-held requirements.
    pub fn grain_ids(&self) -> impl Iterator<Item = &GrainId> {
        self.held.keys()
    }

    /// Replay the accumulated requirements as canonical values.
    pub fn for_each(&self, mut f: impl FnMut(Requirement)) {
        for token_id in &self.token_valid {
            f(Requirement::TokenValid { token_id: *token_id });
        }

        for account_id in &self.admin {
            f(Requirement::IsAdmin {
                account_id: account_id.clone(),
            });
        }

        for (grain_id, holders) in &self.held {
            for (holder, permissions) in holders {
                f(Requirement::PermissionsHeld {
                    grain_id: grain_id.clone(),
                    holder: holder.clone(),
                    permissions: permissions.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::permission::PermissionSet;
    use crate::vertex::Principal;

    use super::{Requirement, RequirementSet};

    #[test]
    fn overlapping_held_requirements_collapse() {
        let mut requirements = RequirementSet::default();
        assert!(requirements.is_empty());

        let holder = Principal::Account("alice".into());
        requirements.add_requirements(&[
            Requirement::PermissionsHeld {
                grain_id: "g1".into(),
                holder: holder.clone(),
                permissions: PermissionSet::from(vec![true, false]),
            },
            Requirement::PermissionsHeld {
                grain_id: "g1".into(),
                holder: holder.clone(),
                permissions: PermissionSet::from(vec![false, true]),
            },
        ]);
        assert!(!requirements.is_empty());

        let mut replayed = Vec::new();
        requirements.for_each(|requirement| replayed.push(requirement));
        assert_eq!(
            replayed,
            vec![Requirement::PermissionsHeld {
                grain_id: "g1".into(),
                holder,
                permissions: PermissionSet::from(vec![true, true]),
            }]
        );

        let grains: Vec<_> = requirements.grain_ids().collect();
        assert_eq!(grains, vec![&"g1".into()]);
    }

    #[test]
    fn admin_requirements_make_the_set_non_empty() {
        let mut requirements = RequirementSet::default();
        requirements.add_requirements(&[Requirement::IsAdmin {
            account_id: "alice".into(),
        }]);
        assert!(!requirements.is_empty());
    }
}
