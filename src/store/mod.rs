// SPDX-License-Identifier: MIT OR Apache-2.0

//! Interfaces to the persistence layer holding grains and sharing tokens.
//!
//! The resolution engine never talks to a database directly; it consumes snapshot reads through
//! [`SharingStore`], while the token-lifecycle entry points additionally require the write
//! surface of [`SharingStoreMut`] and the invalidation-watch feature requires the
//! change-notification surface of [`SharingEvents`]. Read and write interfaces are kept separate
//! so that implementations can back them with different connection kinds or transaction scopes.
//!
//! All read methods return *live* records only: grains which are not trashed or suspended, and
//! tokens which are not revoked, suspended, trashed or expired. A dangling reference simply
//! fails to contribute an edge to the sharing graph.

mod memory;

use std::collections::HashSet;
use std::sync::Arc;

use crate::grain::{Grain, GrainId};
use crate::role::RoleAssignment;
use crate::token::{ApiHost, SharingToken, TokenId};
use crate::vertex::AccountId;

pub use memory::{MemoryStore, MemoryStoreError, MemorySubscription};

/// A change observed on a watched token.
#[derive(Clone, Debug)]
pub enum TokenEvent {
    Changed {
        old: SharingToken,
        new: SharingToken,
    },
    Removed(SharingToken),
}

/// A change observed on a watched grain.
#[derive(Clone, Debug)]
pub enum GrainEvent {
    Changed { old: Grain, new: Grain },
    Removed(Grain),
}

pub type TokenEventHandler = Arc<dyn Fn(&TokenEvent) + Send + Sync>;
pub type GrainEventHandler = Arc<dyn Fn(&GrainEvent) + Send + Sync>;

/// A registered change watch. Dropping the subscription does *not* stop it; call
/// [`Subscription::stop`], which must be idempotent.
pub trait Subscription {
    fn stop(&self);
}

/// Snapshot reads over the sharing data set.
pub trait SharingStore {
    type Error: std::error::Error;

    /// Fetch live grain records by id. Unknown, trashed and suspended grains are omitted.
    fn grains(&self, ids: &[GrainId]) -> Result<Vec<Grain>, Self::Error>;

    /// Fetch all live sharing tokens issued against the given grains.
    fn tokens_for_grains(&self, ids: &[GrainId]) -> Result<Vec<SharingToken>, Self::Error>;

    /// Fetch live sharing tokens by id.
    fn tokens_by_ids(&self, ids: &[TokenId]) -> Result<Vec<SharingToken>, Self::Error>;

    /// Point lookup of a single live token.
    fn token(&self, id: &TokenId) -> Result<Option<SharingToken>, Self::Error>;

    /// Point lookup of a token record regardless of its status flags.
    fn token_record(&self, id: &TokenId) -> Result<Option<SharingToken>, Self::Error>;

    /// Which of the given accounts are global administrators.
    fn admin_accounts(&self, ids: &[AccountId]) -> Result<HashSet<AccountId>, Self::Error>;
}

/// Field updates applied to a stored token.
#[derive(Clone, Debug, Default)]
pub struct TokenUpdate {
    pub label: Option<String>,
    pub role_assignment: Option<RoleAssignment>,
    pub revoked: Option<bool>,
    pub suspended: Option<bool>,
}

/// Writes over the sharing data set.
pub trait SharingStoreMut: SharingStore {
    fn insert_token(&self, token: SharingToken) -> Result<(), Self::Error>;

    fn insert_api_host(&self, host: ApiHost) -> Result<(), Self::Error>;

    /// Apply `update` to the token with the given id. Returns whether the token existed.
    fn update_token(&self, id: &TokenId, update: TokenUpdate) -> Result<bool, Self::Error>;

    /// Delete tokens whose unused-expiry deadline has passed. Returns the number removed.
    fn remove_expired_unused(&self, now: u64) -> Result<usize, Self::Error>;

    /// Delete short-lived powerbox request/offer tokens created before `cutoff`. Returns the
    /// number removed.
    fn remove_stale_client_tokens(&self, cutoff: u64) -> Result<usize, Self::Error>;
}

/// Change notification over tokens and grains.
///
/// Delivery is at-least-once; handlers must tolerate events for changes they have already
/// observed through reads.
pub trait SharingEvents: SharingStore {
    type Subscription: Subscription + Send + 'static;

    fn watch_tokens(
        &self,
        ids: &[TokenId],
        handler: TokenEventHandler,
    ) -> Result<Self::Subscription, Self::Error>;

    fn watch_grains(
        &self,
        ids: &[GrainId],
        handler: GrainEventHandler,
    ) -> Result<Self::Subscription, Self::Error>;
}
