// SPDX-License-Identifier: MIT OR Apache-2.0

//! Discovery of the tokens which could matter for one (grain, vertex) goal.
//!
//! Out of all tokens currently known to a computation, only those lying on some path from the
//! grain owner to the goal vertex can contribute to a proof. Finding them takes two passes:
//! a backward walk from the goal collecting every edge that could feed it, then a forward walk
//! from the owner restricted to the edges the first pass discovered. Tokens dangling off-path
//! are never activated, which keeps the active set proportional to actual path complexity.

use std::collections::{HashMap, HashSet};

use petgraph::prelude::DiGraphMap;

use crate::grain::GrainId;
use crate::role::RoleAssignment;
use crate::token::TokenId;
use crate::vertex::{AccountId, Vertex};

use super::Resolution;

/// A synthetic initial edge: the named account receives `role` directly from the grain owner
/// pseudo-vertex, with no token backing it.
#[derive(Debug)]
pub(super) struct OwnerEdge {
    pub account_id: AccountId,
    pub role: RoleAssignment,
}

/// Result of relevant-token discovery.
#[derive(Debug, Default)]
pub(super) struct Relevant {
    pub token_ids: Vec<TokenId>,
    pub owner_edges: Vec<OwnerEdge>,
}

fn intern(interner: &mut HashMap<Vertex, usize>, vertex: &Vertex) -> usize {
    let next = interner.len();
    *interner.entry(vertex.clone()).or_insert(next)
}

/// Find all known tokens which could carry permissions of `grain_id` from the grain owner to
/// `target`, ignoring any requirements those tokens are conditional on.
///
/// Only edges already present in the computation's caches are considered; an edge the caches do
/// not hold is treated as if it had been revoked. No store queries happen here.
pub(super) fn relevant_tokens(
    resolution: &Resolution,
    grain_id: &GrainId,
    target: &Vertex,
) -> Relevant {
    let Some(grain) = resolution.grains.get(grain_id) else {
        return Relevant::default();
    };

    let mut interner: HashMap<Vertex, usize> = HashMap::new();
    let mut discovered: DiGraphMap<usize, Vec<TokenId>> = DiGraphMap::new();
    let mut owner_edges = Vec::new();

    // Backward pass: repeatedly pop a vertex, find every edge ending at it, and queue the
    // source vertices. Token-backed edges land in the discovered graph keyed from sharer to
    // the token's recipient.
    let mut visited: HashSet<Vertex> = HashSet::from([target.clone()]);
    let mut stack = vec![target.clone()];

    while let Some(vertex) = stack.pop() {
        let mut incoming: Vec<(Vertex, Option<TokenId>)> = Vec::new();

        match &vertex {
            // The owner pseudo-vertex is the source of everything; nothing feeds it.
            Vertex::Owner => {}
            Vertex::Token(token_id) => {
                // A bearer vertex has exactly one incoming edge: the token itself.
                if let Some(token) = resolution.tokens.get(token_id) {
                    if let Some(sharer) = token.sharer_vertex() {
                        incoming.push((sharer, Some(token.id)));
                    }
                }
            }
            Vertex::Account(account_id) => {
                if *account_id == grain.owner_id {
                    incoming.push((Vertex::Owner, None));
                    owner_edges.push(OwnerEdge {
                        account_id: account_id.clone(),
                        role: RoleAssignment::all_access(),
                    });
                } else if !grain.private {
                    // Legacy public grain: any account that knows the grain id receives the
                    // default role, so the account hangs directly off the owner pseudo-vertex
                    // and explicit shares are not consulted. An account that never learned the
                    // grain id cannot ask to open it, and cannot be the subject of membrane
                    // requirements against it either. Frozen behavior for grains created
                    // before privacy became mandatory; never to be extended.
                    incoming.push((Vertex::Owner, None));
                    owner_edges.push(OwnerEdge {
                        account_id: account_id.clone(),
                        role: RoleAssignment::default_role(),
                    });
                } else if let Some(token_ids) = resolution
                    .tokens_by_recipient
                    .get(grain_id)
                    .and_then(|by_account| by_account.get(account_id))
                {
                    // Ordinary case: every token addressed to this account.
                    for token_id in token_ids {
                        if let Some(token) = resolution.tokens.get(token_id) {
                            if let Some(sharer) = token.sharer_vertex() {
                                incoming.push((sharer, Some(token.id)));
                            }
                        }
                    }
                }
            }
        }

        for (sharer, token_id) in incoming {
            if let Some(token_id) = token_id {
                // The forward pass resumes from the token's own recipient vertex, which for a
                // redeemed token is the receiving account rather than the bearer vertex the
                // backward pass arrived through.
                let recipient = resolution
                    .tokens
                    .get(&token_id)
                    .map(|token| token.recipient_vertex())
                    .unwrap_or_else(|| vertex.clone());
                let from = intern(&mut interner, &sharer);
                let to = intern(&mut interner, &recipient);
                match discovered.edge_weight_mut(from, to) {
                    Some(tokens) => tokens.push(token_id),
                    None => {
                        discovered.add_edge(from, to, vec![token_id]);
                    }
                }
            }
            if visited.insert(sharer.clone()) {
                stack.push(sharer);
            }
        }
    }

    // Forward pass from the owner account, walking only the edges discovered above and
    // collecting every token actually traversed.
    let mut token_ids = Vec::new();
    let owner_vertex = Vertex::Account(grain.owner_id.clone());
    let Some(&start) = interner.get(&owner_vertex) else {
        return Relevant {
            token_ids,
            owner_edges,
        };
    };

    let mut seen: HashSet<usize> = HashSet::from([start]);
    let mut forward = vec![start];
    while let Some(node) = forward.pop() {
        for (_, next, tokens) in discovered.edges(node) {
            token_ids.extend(tokens.iter().copied());
            if seen.insert(next) {
                forward.push(next);
            }
        }
    }

    Relevant {
        token_ids,
        owner_edges,
    }
}
