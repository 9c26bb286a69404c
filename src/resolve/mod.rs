// SPDX-License-Identifier: MIT OR Apache-2.0

//! The forward-chaining permission solver.
//!
//! Deciding whether a principal holds a permission is a propositional HORNSAT problem: there is
//! a boolean variable for every (grain, vertex, permission) triple, plus one per token validity
//! fact and one per admin-status fact, and every sharing token contributes Horn clauses of the
//! form "if the sharer holds P and all requirements hold, the recipient holds P". All variables
//! start false and are only ever flipped to true when an edge forces it, so the computation is
//! monotone and terminates at a fixpoint regardless of processing order.
//!
//! A [`Resolution`] runs one such computation. It alternates between two phases: a local
//! worklist fixpoint which never touches the store, and a frontier expansion which follows the
//! requirements that blocked progress, pulling in newly referenced grains and tokens. Expansion
//! only widens the active-token set when the computation is genuinely stuck, which keeps store
//! traffic proportional to the complexity of the actual sharing paths rather than to the total
//! number of tokens issued.

mod relevant;
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::grain::{Grain, GrainId};
use crate::permission::{PermissionId, PermissionSet};
use crate::requirement::{Requirement, RequirementSet};
use crate::store::SharingStore;
use crate::token::{SharingToken, TokenId, TokenOwner};
use crate::vertex::{AccountId, Vertex};

/// One proposition tracked by the solver.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum VarId {
    /// "`vertex` holds `permission` on `grain_id`."
    Held {
        grain_id: GrainId,
        vertex: Vertex,
        permission: PermissionId,
    },

    /// "The token is still valid (not revoked or suspended)."
    TokenValid(TokenId),

    /// "The account is a global administrator."
    IsAdmin(AccountId),
}

impl VarId {
    fn held(grain_id: &GrainId, vertex: &Vertex, permission: PermissionId) -> Self {
        VarId::Held {
            grain_id: grain_id.clone(),
            vertex: vertex.clone(),
            permission,
        }
    }

    /// The permission this variable proves at its vertex.
    fn permission(&self) -> PermissionId {
        match self {
            VarId::Held { permission, .. } => *permission,
            VarId::TokenValid(_) | VarId::IsAdmin(_) => PermissionId::CanAccess,
        }
    }
}

/// State of one proposition. Once `value` flips to true it never reverts within a computation;
/// the dependent lists record which tokens to notify when that happens.
#[derive(Debug, Default)]
struct Variable {
    value: bool,

    /// The token whose edge proved this variable, for provenance.
    cause: Option<TokenId>,

    /// Tokens whose source vertex is this variable's vertex for this permission.
    direct_dependents: Vec<TokenId>,

    /// Tokens with an unmet requirement which this variable satisfies.
    requirement_dependents: Vec<TokenId>,
}

/// A pending "set this variable to true" event on the worklist.
#[derive(Debug)]
struct Proof {
    var: VarId,
    cause: Option<TokenId>,
}

/// Where an active token's proven permissions flow to.
#[derive(Debug)]
enum ActiveTarget {
    /// An ordinary sharing edge: permissions arrive at the recipient vertex of the grain.
    Share { grain_id: GrainId, recipient: Vertex },

    /// A token pulled in by a validity requirement: the only fact it can prove is its own
    /// validity.
    Validity,
}

/// A token included in the live computation.
///
/// Tracks which permissions the token's role assignment can carry, which of those have been
/// proven to arrive at the token's source end, and how many of its requirements are still unmet.
#[derive(Debug)]
struct ActiveToken {
    id: TokenId,
    requirements: Vec<Requirement>,
    unmet_requirements: usize,
    target: ActiveTarget,

    /// Permission -> whether it has been proven to reach this token. Keys are exactly the
    /// permissions the token can carry.
    received: HashMap<PermissionId, bool>,
}

impl ActiveToken {
    fn requirements_met(&self) -> bool {
        self.unmet_requirements == 0
    }

    fn proof(&self, permission: PermissionId) -> Proof {
        let var = match &self.target {
            ActiveTarget::Share {
                grain_id,
                recipient,
            } => VarId::held(grain_id, recipient, permission),
            ActiveTarget::Validity => VarId::TokenValid(self.id),
        };
        Proof {
            var,
            cause: Some(self.id),
        }
    }

    /// Record that `permission` has been proven to reach this token, propagating it onward when
    /// the token's requirements are all met.
    fn set_receives(
        &mut self,
        permission: PermissionId,
        set_true: &mut Vec<Proof>,
        unmet: &mut RequirementSet,
    ) {
        if let Some(slot) = self.received.get_mut(&permission) {
            *slot = true;
        }

        if self.requirements_met() {
            set_true.push(self.proof(permission));
        } else {
            // Permissions flow to this token, so its requirements are now worth chasing. Some
            // may already be proven; the next expansion round discovers that it activates
            // nothing new.
            unmet.add_requirements(&self.requirements);
        }
    }

    /// Record that one more of this token's requirements has been proven.
    fn requirement_met(&mut self, set_true: &mut Vec<Proof>) {
        self.unmet_requirements = self
            .unmet_requirements
            .checked_sub(1)
            .unwrap_or_else(|| panic!("unmet-requirement count underflow for token {}", self.id));

        if self.requirements_met() {
            // That was the last missing requirement: every permission already proven to reach
            // this token now propagates through it.
            for (permission, received) in &self.received {
                if *received {
                    set_true.push(self.proof(*permission));
                }
            }
        }
    }
}

/// The tokens and grains a finished proof rests on.
///
/// `token_ids` is a sufficient set: re-proving against exactly these tokens reproduces the
/// result, and the proof survives only as long as every one of them stays valid.
#[derive(Debug, Default)]
pub struct Responsible {
    pub token_ids: HashSet<TokenId>,
    pub grain_ids: HashSet<GrainId>,
}

/// One permission computation over a lazily discovered slice of the sharing graph.
///
/// A resolution is built, run to fixpoint (or exhaustion) and discarded; its caches are owned
/// exclusively by the computation and are never shared. The store is only consulted at the
/// seams: when the computation starts and when requirement expansion references grains or
/// tokens not yet known. Passing no store runs the same algorithm against the already cached
/// records only, which is how results are re-verified against a pinned token set.
#[derive(Debug, Default)]
pub struct Resolution {
    grains: HashMap<GrainId, Grain>,
    admins: HashMap<AccountId, bool>,
    tokens: HashMap<TokenId, SharingToken>,
    tokens_by_recipient: HashMap<GrainId, HashMap<AccountId, Vec<TokenId>>>,
    variables: HashMap<VarId, Variable>,
    active: HashMap<TokenId, ActiveToken>,
    set_true: Vec<Proof>,
    unmet: RequirementSet,
}

impl Resolution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a grain record directly, without consulting a store.
    pub fn add_grain(&mut self, grain: Grain) {
        self.grains.insert(grain.id.clone(), grain);
    }

    /// Seed a token record directly. Tokens already known are left untouched; the token is not
    /// activated until discovery decides it is relevant.
    pub fn add_token(&mut self, token: SharingToken) {
        if self.tokens.contains_key(&token.id) {
            return;
        }
        if let TokenOwner::Account { account_id, .. } = &token.owner {
            self.tokens_by_recipient
                .entry(token.grain_id.clone())
                .or_default()
                .entry(account_id.clone())
                .or_default()
                .push(token.id);
        }
        self.tokens.insert(token.id, token);
    }

    pub fn add_tokens(&mut self, tokens: impl IntoIterator<Item = SharingToken>) {
        for token in tokens {
            self.add_token(token);
        }
    }

    /// Drop all per-proof state, keeping the grain and admin caches.
    pub fn reset(&mut self) {
        self.tokens.clear();
        self.tokens_by_recipient.clear();
        self.variables.clear();
        self.active.clear();
        self.set_true.clear();
        self.unmet = RequirementSet::default();
    }

    /// Try to prove that `vertex` holds `target` on `grain_id`.
    ///
    /// Returns the full set of permissions proven for the vertex, which may be a superset of
    /// `target` or fall short of it, or `None` when not even base access could be proven. With
    /// a store, the computation discovers grains and tokens lazily; without one it works from
    /// the seeded records alone.
    pub fn prove<S: SharingStore>(
        &mut self,
        grain_id: &GrainId,
        vertex: &Vertex,
        target: &PermissionSet,
        store: Option<&S>,
    ) -> Result<Option<PermissionSet>, S::Error> {
        if let Some(store) = store {
            self.add_grains(store, std::slice::from_ref(grain_id))?;
        }

        self.activate_relevant(grain_id, vertex);

        let mut round = 0usize;
        loop {
            round += 1;
            let result = self.run_forward_chaining(grain_id, vertex);
            if let Some(proven) = &result {
                if target.is_subset_of(proven) {
                    return Ok(result);
                }
            }

            if !self.expand_requirements(store)? {
                debug!(%grain_id, %vertex, round, "requirement expansion stalled, returning best known result");
                return Ok(result);
            }
        }
    }

    /// The permissions already proven for `vertex` on `grain_id`, sized to the grain's declared
    /// permission count. `None` when base access is unproven.
    pub fn proven_permissions(
        &self,
        grain_id: &GrainId,
        vertex: &Vertex,
    ) -> Option<PermissionSet> {
        let can_access = self
            .variables
            .get(&VarId::held(grain_id, vertex, PermissionId::CanAccess))
            .is_some_and(|variable| variable.value);
        if !can_access {
            return None;
        }

        let count = self
            .grains
            .get(grain_id)
            .map(|grain| grain.catalog.permission_count)
            .unwrap_or(0);
        let bits: Vec<bool> = (0..count)
            .map(|index| {
                self.variables
                    .get(&VarId::held(grain_id, vertex, PermissionId::App(index)))
                    .is_some_and(|variable| variable.value)
            })
            .collect();
        Some(PermissionSet::from(bits))
    }

    /// Transitively collect the tokens used to prove the permissions `vertex` holds on
    /// `grain_id`, including tokens which fulfilled membrane requirements along the way.
    ///
    /// Every proven variable records the token immediately responsible for it; this walks that
    /// trail backwards through the sharing graph. The result is the slice of the data set whose
    /// continued validity the proof depends on, which is what the live-invalidation watch
    /// subscribes to.
    pub fn responsible_tokens(&self, grain_id: &GrainId, vertex: &Vertex) -> Responsible {
        fn push(var: VarId, visited: &mut HashSet<VarId>, stack: &mut Vec<VarId>) {
            if visited.insert(var.clone()) {
                stack.push(var);
            }
        }

        let mut result = Responsible::default();
        let mut visited: HashSet<VarId> = HashSet::new();
        let mut stack: Vec<VarId> = Vec::new();

        let Some(proven) = self.proven_permissions(grain_id, vertex) else {
            return result;
        };
        for permission in proven.with_can_access() {
            push(
                VarId::held(grain_id, vertex, permission),
                &mut visited,
                &mut stack,
            );
        }

        while let Some(var) = stack.pop() {
            if let VarId::Held { grain_id, .. } = &var {
                result.grain_ids.insert(grain_id.clone());
            }
            let Some(variable) = self.variables.get(&var) else {
                continue;
            };
            let Some(cause) = variable.cause else {
                continue;
            };
            let Some(token) = self.tokens.get(&cause) else {
                continue;
            };

            // Keep walking towards the source of the proof.
            match &var {
                VarId::Held { permission, .. } => {
                    if let Some(sharer) = token.sharer_vertex() {
                        push(
                            VarId::held(&token.grain_id, &sharer, *permission),
                            &mut visited,
                            &mut stack,
                        );
                    }
                }
                VarId::TokenValid(_) => {
                    if let Some(parent) = token.parent {
                        push(VarId::TokenValid(parent), &mut visited, &mut stack);
                    }
                }
                VarId::IsAdmin(_) => {}
            }

            if result.token_ids.insert(cause) {
                // The proof also depends on everything this token's requirements rest on.
                for requirement in &token.requirements {
                    match requirement {
                        Requirement::PermissionsHeld {
                            grain_id,
                            holder,
                            permissions,
                        } => {
                            let holder_vertex = holder.vertex();
                            for permission in permissions.with_can_access() {
                                push(
                                    VarId::held(grain_id, &holder_vertex, permission),
                                    &mut visited,
                                    &mut stack,
                                );
                            }
                        }
                        Requirement::TokenValid { token_id } => {
                            push(VarId::TokenValid(*token_id), &mut visited, &mut stack);
                        }
                        // Admin status is resolved per computation and not watched for
                        // invalidation; revoking admin rights does not retract proofs
                        // already handed out.
                        Requirement::IsAdmin { .. } => {}
                    }
                }
            }
        }

        result
    }

    fn variable(&mut self, var: VarId) -> &mut Variable {
        self.variables.entry(var).or_default()
    }

    fn add_grains<S: SharingStore>(
        &mut self,
        store: &S,
        ids: &[GrainId],
    ) -> Result<(), S::Error> {
        if ids.is_empty() {
            return Ok(());
        }
        for grain in store.grains(ids)? {
            self.grains.insert(grain.id.clone(), grain);
        }
        for token in store.tokens_for_grains(ids)? {
            self.add_token(token);
        }
        Ok(())
    }

    /// Discover and activate every known token that could lie on a path from the grain owner to
    /// `vertex`. Returns whether anything new was activated.
    fn activate_relevant(&mut self, grain_id: &GrainId, vertex: &Vertex) -> bool {
        let found = relevant::relevant_tokens(self, grain_id, vertex);
        let mut progress = self.activate_owner_edges(grain_id, &found.owner_edges);
        for token_id in &found.token_ids {
            if self.activate_token(token_id) {
                progress = true;
            }
        }
        progress
    }

    /// Push the synthetic owner grants: the owner holds everything, and on legacy public grains
    /// other accounts hold the default role.
    fn activate_owner_edges(
        &mut self,
        grain_id: &GrainId,
        edges: &[relevant::OwnerEdge],
    ) -> bool {
        for edge in edges {
            let Some(grain) = self.grains.get(grain_id) else {
                continue;
            };
            let permissions = PermissionSet::from_role_assignment(&edge.role, &grain.catalog);
            let vertex = Vertex::Account(edge.account_id.clone());
            for permission in permissions.with_can_access() {
                self.set_true.push(Proof {
                    var: VarId::held(grain_id, &vertex, permission),
                    cause: None,
                });
            }
        }
        !edges.is_empty()
    }

    /// Register interest in all of a token's requirements, returning how many are currently
    /// unproven.
    fn register_requirements(
        &mut self,
        token_id: TokenId,
        requirements: &[Requirement],
    ) -> usize {
        let mut unmet = 0;
        for requirement in requirements {
            match requirement {
                Requirement::PermissionsHeld {
                    grain_id,
                    holder,
                    permissions,
                } => {
                    let holder_vertex = holder.vertex();
                    for permission in permissions.with_can_access() {
                        let variable =
                            self.variable(VarId::held(grain_id, &holder_vertex, permission));
                        if !variable.value {
                            unmet += 1;
                            variable.requirement_dependents.push(token_id);
                        }
                    }
                }
                Requirement::IsAdmin { account_id } => {
                    let variable = self.variable(VarId::IsAdmin(account_id.clone()));
                    if !variable.value {
                        unmet += 1;
                        variable.requirement_dependents.push(token_id);
                    }
                }
                Requirement::TokenValid { token_id: required } => {
                    let variable = self.variable(VarId::TokenValid(*required));
                    if !variable.value {
                        unmet += 1;
                        variable.requirement_dependents.push(token_id);
                    }
                }
            }
        }
        unmet
    }

    /// Include a known token in the computation as a sharing edge. Returns whether the token
    /// was newly activated.
    ///
    /// The accumulated knowledge has to be folded in at activation time: requirements may
    /// already be proven, and the source vertex may already hold some of the carried
    /// permissions.
    fn activate_token(&mut self, token_id: &TokenId) -> bool {
        if self.active.contains_key(token_id) {
            return false;
        }
        let Some(token) = self.tokens.get(token_id).cloned() else {
            return false;
        };
        let Some(grain) = self.grains.get(&token.grain_id) else {
            return false;
        };
        let Some(sharer) = token.sharer_vertex() else {
            return false;
        };

        let permissions =
            PermissionSet::from_role_assignment(&token.role_assignment, &grain.catalog);
        let recipient = token.recipient_vertex();
        let grain_id = token.grain_id.clone();

        let unmet_requirements = self.register_requirements(*token_id, &token.requirements);
        let mut active = ActiveToken {
            id: *token_id,
            requirements: token.requirements.clone(),
            unmet_requirements,
            target: ActiveTarget::Share {
                grain_id: grain_id.clone(),
                recipient: recipient.clone(),
            },
            received: permissions
                .with_can_access()
                .map(|permission| (permission, false))
                .collect(),
        };

        // Add one edge per permission the token can carry.
        let carried: Vec<PermissionId> = permissions.with_can_access().collect();
        for permission in carried {
            let recipient_proven = self
                .variable(VarId::held(&grain_id, &recipient, permission))
                .value;
            if recipient_proven {
                continue;
            }

            let source_proven = {
                let source = self.variable(VarId::held(&grain_id, &sharer, permission));
                if !source.value {
                    source.direct_dependents.push(*token_id);
                }
                source.value
            };
            if source_proven {
                active.set_receives(permission, &mut self.set_true, &mut self.unmet);
            }
        }

        self.active.insert(*token_id, active);
        true
    }

    /// Include a known token in the computation as the subject of a validity requirement. The
    /// only fact such a token proves is its own validity, which holds when the token exists
    /// un-revoked and its parent chain is valid.
    fn activate_validity_token(&mut self, token_id: &TokenId) -> bool {
        if self.active.contains_key(token_id) {
            return false;
        }
        let Some(token) = self.tokens.get(token_id).cloned() else {
            return false;
        };

        let unmet_requirements = self.register_requirements(*token_id, &token.requirements);
        let mut active = ActiveToken {
            id: *token_id,
            requirements: token.requirements.clone(),
            unmet_requirements,
            target: ActiveTarget::Validity,
            received: HashMap::from([(PermissionId::CanAccess, false)]),
        };

        let already_proven = self.variable(VarId::TokenValid(*token_id)).value;
        if !already_proven {
            match token.parent {
                None => {
                    // Root of the chain: the store only hands out live tokens, so existence is
                    // the proof.
                    active.set_receives(
                        PermissionId::CanAccess,
                        &mut self.set_true,
                        &mut self.unmet,
                    );
                }
                Some(parent) => {
                    let source_proven = {
                        let source = self.variable(VarId::TokenValid(parent));
                        if !source.value {
                            source.direct_dependents.push(*token_id);
                        }
                        source.value
                    };
                    if source_proven {
                        active.set_receives(
                            PermissionId::CanAccess,
                            &mut self.set_true,
                            &mut self.unmet,
                        );
                    }
                }
            }
        }

        self.active.insert(*token_id, active);
        true
    }

    /// Drain the worklist to fixpoint, then report what is proven for the goal vertex.
    fn run_forward_chaining(
        &mut self,
        grain_id: &GrainId,
        vertex: &Vertex,
    ) -> Option<PermissionSet> {
        while let Some(event) = self.set_true.pop() {
            let variable = self.variables.entry(event.var.clone()).or_default();
            if variable.value {
                continue;
            }
            variable.value = true;
            variable.cause = event.cause;

            let permission = event.var.permission();
            let direct = std::mem::take(&mut variable.direct_dependents);
            let requirement = std::mem::take(&mut variable.requirement_dependents);

            for token_id in direct {
                // A token has exactly one source vertex per permission, so this permission
                // cannot have been delivered to the token before.
                let Self {
                    active,
                    set_true,
                    unmet,
                    ..
                } = &mut *self;
                active
                    .get_mut(&token_id)
                    .expect("direct dependent is active")
                    .set_receives(permission, set_true, unmet);
            }

            for token_id in requirement {
                let Self {
                    active, set_true, ..
                } = &mut *self;
                active
                    .get_mut(&token_id)
                    .expect("requirement dependent is active")
                    .requirement_met(set_true);
            }
        }

        self.proven_permissions(grain_id, vertex)
    }

    /// Chase the requirements which blocked the last fixpoint, activating whatever tokens might
    /// prove them. Returns whether anything was newly activated, i.e. whether another chaining
    /// round could make progress.
    fn expand_requirements<S: SharingStore>(
        &mut self,
        store: Option<&S>,
    ) -> Result<bool, S::Error> {
        let missing: Vec<GrainId> = self
            .unmet
            .grain_ids()
            .filter(|id| !self.grains.contains_key(*id))
            .cloned()
            .collect();
        if let Some(store) = store {
            self.add_grains(store, &missing)?;
        }

        // Requirements discovered while processing are deferred to the next round.
        let outstanding = std::mem::take(&mut self.unmet);
        let mut requirements = Vec::new();
        outstanding.for_each(|requirement| requirements.push(requirement));

        let mut progress = false;
        for requirement in requirements {
            match requirement {
                Requirement::PermissionsHeld {
                    grain_id, holder, ..
                } => {
                    // Over-approximates: this activates tokens carrying any permission towards
                    // the holder, not only the permissions the requirement names.
                    if self.activate_relevant(&grain_id, &holder.vertex()) {
                        progress = true;
                    }
                }
                Requirement::TokenValid { token_id } => {
                    // Activate the token and its transitive parents.
                    let mut current = token_id;
                    loop {
                        if !self.tokens.contains_key(&current) {
                            if let Some(store) = store {
                                if let Some(token) = store.token(&current)? {
                                    self.add_token(token);
                                }
                            }
                        }
                        let Some(token) = self.tokens.get(&current) else {
                            break;
                        };
                        let parent = token.parent;
                        if self.activate_validity_token(&current) {
                            progress = true;
                        }
                        match parent {
                            Some(parent) => current = parent,
                            None => break,
                        }
                    }
                }
                Requirement::IsAdmin { account_id } => {
                    let is_admin = match self.admins.get(&account_id) {
                        Some(answer) => *answer,
                        None => match store {
                            Some(store) => {
                                let answer = store
                                    .admin_accounts(std::slice::from_ref(&account_id))?
                                    .contains(&account_id);
                                self.admins.insert(account_id.clone(), answer);
                                answer
                            }
                            None => false,
                        },
                    };
                    if is_admin {
                        let variable = self.variable(VarId::IsAdmin(account_id.clone()));
                        if !variable.value {
                            if !variable.requirement_dependents.is_empty() {
                                progress = true;
                            }
                            self.set_true.push(Proof {
                                var: VarId::IsAdmin(account_id),
                                cause: None,
                            });
                        }
                    }
                }
            }
        }

        Ok(progress)
    }
}
