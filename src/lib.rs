// SPDX-License-Identifier: MIT OR Apache-2.0

//! Sharing-graph permission resolution for capability-sharing applications.
//!
//! A *grain* is a protected resource whose owner can share access with other principals by
//! issuing *sharing tokens*. Recipients can share onward, tokens can be conditioned on
//! *membrane requirements* ("this only stays valid while Alice can still write to that other
//! grain"), and anything can be revoked at any time. Deciding what a principal may do therefore
//! means searching a directed graph whose edges carry conditional validity, without ever
//! loading the whole graph into memory.
//!
//! The core of the crate is [`Resolution`], a forward-chaining solver which exploits the Horn
//! structure of the problem: permissions only ever accumulate along satisfied edges, so running
//! the worklist to fixpoint is sound, terminating and independent of processing order. Token
//! discovery is lazy; the store is only consulted when an unmet requirement points outside the
//! already known slice of the graph.
//!
//! Most callers use the entry points in [`api`] instead of driving a resolution directly:
//!
//! - [`may_open_grain`] answers the basic access question,
//! - [`grain_permissions`] computes the full permission set, optionally keeping it watched for
//!   live invalidation against exactly the tokens the result depends on,
//! - [`downstream_tokens`] audits who was granted access through whom,
//! - [`create_token`], [`update_token`] and the cleanup sweeps cover the token lifecycle.
//!
//! Persistence is abstracted behind the read/write/notify traits in [`store`];
//! [`store::MemoryStore`] is a complete in-memory implementation.

pub mod api;
mod grain;
mod permission;
mod requirement;
mod resolve;
mod role;
pub mod store;
mod token;
mod vertex;
mod watch;

pub use api::{
    ApiHostParams, CreatedToken, GrainPermissions, NewTokenOwner, ShareRoot, TokenError,
    TokenProvider, cleanup_client_tokens, cleanup_expired_unused, create_token,
    downstream_tokens, grain_permissions, may_open_grain, update_token,
};
pub use grain::{Grain, GrainId};
pub use permission::{PermissionId, PermissionSet};
pub use requirement::{Requirement, RequirementSet};
pub use resolve::{Resolution, Responsible, VarId};
pub use role::{RoleAssignment, RoleCatalog, RoleChoice, RoleDef};
pub use token::{ApiHost, SharingToken, TokenId, TokenOwner, TokenSecret};
pub use vertex::{AccountId, Principal, Vertex};
pub use watch::WatchHandle;
