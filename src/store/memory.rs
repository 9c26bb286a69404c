// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::grain::{Grain, GrainId};
use crate::token::{ApiHost, SharingToken, TokenId, TokenOwner};
use crate::vertex::AccountId;

use super::{
    GrainEvent, GrainEventHandler, SharingEvents, SharingStore, SharingStoreMut, Subscription,
    TokenEvent, TokenEventHandler, TokenUpdate,
};

/// Error type for [`MemoryStore`].
///
/// The in-memory store cannot fail; the type exists only to satisfy the store contracts.
#[derive(Debug, Error)]
pub enum MemoryStoreError {}

#[derive(Debug, Default)]
struct Inner {
    grains: HashMap<GrainId, Grain>,
    tokens: HashMap<TokenId, SharingToken>,
    api_hosts: HashMap<String, ApiHost>,
    admins: HashSet<AccountId>,
}

#[derive(Default)]
struct Watchers {
    next_id: u64,
    tokens: HashMap<u64, (HashSet<TokenId>, TokenEventHandler)>,
    grains: HashMap<u64, (HashSet<GrainId>, GrainEventHandler)>,
}

/// In-memory reference implementation of the store contracts.
///
/// Cloning is cheap and clones share state. Watch handlers fire synchronously from the mutating
/// call, after all locks have been released, so a handler may freely call back into the store.
/// Time does not advance on its own; tests drive expiry through [`MemoryStore::set_now`].
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    watchers: Arc<Mutex<Watchers>>,
    now: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store's current notion of "now", Unix milliseconds.
    pub fn now(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }

    /// Advance the store clock used for expiry filtering.
    pub fn set_now(&self, now: u64) {
        self.now.store(now, Ordering::Relaxed);
    }

    pub fn insert_grain(&self, grain: Grain) {
        self.inner
            .write()
            .expect("store lock")
            .grains
            .insert(grain.id.clone(), grain);
    }

    /// Mutate a stored grain in place, firing change watchers when anything changed. Returns
    /// whether the grain existed.
    pub fn update_grain(&self, id: &GrainId, f: impl FnOnce(&mut Grain)) -> bool {
        let event = {
            let mut inner = self.inner.write().expect("store lock");
            let Some(grain) = inner.grains.get_mut(id) else {
                return false;
            };
            let old = grain.clone();
            f(grain);
            let new = grain.clone();
            (old != new).then_some(GrainEvent::Changed { old, new })
        };
        if let Some(event) = event {
            self.fire_grain_event(id, &event);
        }
        true
    }

    pub fn remove_grain(&self, id: &GrainId) -> bool {
        let removed = self.inner.write().expect("store lock").grains.remove(id);
        match removed {
            Some(grain) => {
                self.fire_grain_event(id, &GrainEvent::Removed(grain));
                true
            }
            None => false,
        }
    }

    /// Delete a token outright, firing removal watchers.
    pub fn remove_token(&self, id: &TokenId) -> bool {
        let removed = self.inner.write().expect("store lock").tokens.remove(id);
        match removed {
            Some(token) => {
                self.fire_token_event(id, &TokenEvent::Removed(token));
                true
            }
            None => false,
        }
    }

    pub fn set_admin(&self, account_id: AccountId, is_admin: bool) {
        let mut inner = self.inner.write().expect("store lock");
        if is_admin {
            inner.admins.insert(account_id);
        } else {
            inner.admins.remove(&account_id);
        }
    }

    pub fn api_host(&self, id: &str) -> Option<ApiHost> {
        self.inner
            .read()
            .expect("store lock")
            .api_hosts
            .get(id)
            .cloned()
    }

    fn fire_token_event(&self, id: &TokenId, event: &TokenEvent) {
        let handlers: Vec<TokenEventHandler> = {
            let watchers = self.watchers.lock().expect("watcher lock");
            watchers
                .tokens
                .values()
                .filter(|(ids, _)| ids.contains(id))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    fn fire_grain_event(&self, id: &GrainId, event: &GrainEvent) {
        let handlers: Vec<GrainEventHandler> = {
            let watchers = self.watchers.lock().expect("watcher lock");
            watchers
                .grains
                .values()
                .filter(|(ids, _)| ids.contains(id))
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }
}

impl SharingStore for MemoryStore {
    type Error = MemoryStoreError;

    fn grains(&self, ids: &[GrainId]) -> Result<Vec<Grain>, Self::Error> {
        let inner = self.inner.read().expect("store lock");
        Ok(ids
            .iter()
            .filter_map(|id| inner.grains.get(id))
            .filter(|grain| grain.is_live())
            .cloned()
            .collect())
    }

    fn tokens_for_grains(&self, ids: &[GrainId]) -> Result<Vec<SharingToken>, Self::Error> {
        let now = self.now();
        let inner = self.inner.read().expect("store lock");
        Ok(inner
            .tokens
            .values()
            .filter(|token| ids.contains(&token.grain_id) && token.is_live(now))
            .cloned()
            .collect())
    }

    fn tokens_by_ids(&self, ids: &[TokenId]) -> Result<Vec<SharingToken>, Self::Error> {
        let now = self.now();
        let inner = self.inner.read().expect("store lock");
        Ok(ids
            .iter()
            .filter_map(|id| inner.tokens.get(id))
            .filter(|token| token.is_live(now))
            .cloned()
            .collect())
    }

    fn token(&self, id: &TokenId) -> Result<Option<SharingToken>, Self::Error> {
        let now = self.now();
        let inner = self.inner.read().expect("store lock");
        Ok(inner
            .tokens
            .get(id)
            .filter(|token| token.is_live(now))
            .cloned())
    }

    fn token_record(&self, id: &TokenId) -> Result<Option<SharingToken>, Self::Error> {
        Ok(self
            .inner
            .read()
            .expect("store lock")
            .tokens
            .get(id)
            .cloned())
    }

    fn admin_accounts(&self, ids: &[AccountId]) -> Result<HashSet<AccountId>, Self::Error> {
        let inner = self.inner.read().expect("store lock");
        Ok(ids
            .iter()
            .filter(|id| inner.admins.contains(*id))
            .cloned()
            .collect())
    }
}

impl SharingStoreMut for MemoryStore {
    fn insert_token(&self, token: SharingToken) -> Result<(), Self::Error> {
        self.inner
            .write()
            .expect("store lock")
            .tokens
            .insert(token.id, token);
        Ok(())
    }

    fn insert_api_host(&self, host: ApiHost) -> Result<(), Self::Error> {
        self.inner
            .write()
            .expect("store lock")
            .api_hosts
            .insert(host.id.clone(), host);
        Ok(())
    }

    fn update_token(&self, id: &TokenId, update: TokenUpdate) -> Result<bool, Self::Error> {
        let event = {
            let mut inner = self.inner.write().expect("store lock");
            let Some(token) = inner.tokens.get_mut(id) else {
                return Ok(false);
            };
            let old = token.clone();
            if let Some(label) = update.label {
                token.label = label;
            }
            if let Some(role_assignment) = update.role_assignment {
                token.role_assignment = role_assignment;
            }
            if let Some(revoked) = update.revoked {
                token.revoked = revoked;
            }
            if let Some(suspended) = update.suspended {
                token.suspended = suspended;
            }
            let new = token.clone();
            (old != new).then_some(TokenEvent::Changed { old, new })
        };
        if let Some(event) = event {
            self.fire_token_event(id, &event);
        }
        Ok(true)
    }

    fn remove_expired_unused(&self, now: u64) -> Result<usize, Self::Error> {
        let expired: Vec<TokenId> = {
            let inner = self.inner.read().expect("store lock");
            inner
                .tokens
                .values()
                .filter(|token| {
                    token
                        .expires_if_unused
                        .is_some_and(|deadline| deadline < now)
                })
                .map(|token| token.id)
                .collect()
        };
        for id in &expired {
            self.remove_token(id);
        }
        Ok(expired.len())
    }

    fn remove_stale_client_tokens(&self, cutoff: u64) -> Result<usize, Self::Error> {
        let stale: Vec<TokenId> = {
            let inner = self.inner.read().expect("store lock");
            inner
                .tokens
                .values()
                .filter(|token| {
                    matches!(
                        token.owner,
                        TokenOwner::ClientRequest { .. } | TokenOwner::ClientOffer { .. }
                    ) && token.created < cutoff
                })
                .map(|token| token.id)
                .collect()
        };
        for id in &stale {
            self.remove_token(id);
        }
        Ok(stale.len())
    }
}

enum WatcherKind {
    Tokens,
    Grains,
}

/// Watch registration handle for [`MemoryStore`].
pub struct MemorySubscription {
    kind: WatcherKind,
    id: u64,
    watchers: Arc<Mutex<Watchers>>,
}

impl Subscription for MemorySubscription {
    fn stop(&self) {
        let mut watchers = self.watchers.lock().expect("watcher lock");
        match self.kind {
            WatcherKind::Tokens => {
                watchers.tokens.remove(&self.id);
            }
            WatcherKind::Grains => {
                watchers.grains.remove(&self.id);
            }
        }
    }
}

impl SharingEvents for MemoryStore {
    type Subscription = MemorySubscription;

    fn watch_tokens(
        &self,
        ids: &[TokenId],
        handler: TokenEventHandler,
    ) -> Result<Self::Subscription, Self::Error> {
        let mut watchers = self.watchers.lock().expect("watcher lock");
        let id = watchers.next_id;
        watchers.next_id += 1;
        watchers
            .tokens
            .insert(id, (ids.iter().copied().collect(), handler));
        Ok(MemorySubscription {
            kind: WatcherKind::Tokens,
            id,
            watchers: self.watchers.clone(),
        })
    }

    fn watch_grains(
        &self,
        ids: &[GrainId],
        handler: GrainEventHandler,
    ) -> Result<Self::Subscription, Self::Error> {
        let mut watchers = self.watchers.lock().expect("watcher lock");
        let id = watchers.next_id;
        watchers.next_id += 1;
        watchers
            .grains
            .insert(id, (ids.iter().cloned().collect(), handler));
        Ok(MemorySubscription {
            kind: WatcherKind::Grains,
            id,
            watchers: self.watchers.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::grain::Grain;
    use crate::role::{RoleAssignment, RoleCatalog};
    use crate::store::{
        SharingEvents, SharingStore, SharingStoreMut, Subscription, TokenEvent, TokenUpdate,
    };
    use crate::token::{SharingToken, TokenId, TokenOwner, TokenSecret};

    use super::MemoryStore;

    fn token(secret: &str, grain: &str) -> SharingToken {
        SharingToken {
            id: TokenId::from_secret(&TokenSecret::from(secret)),
            grain_id: grain.into(),
            parent: None,
            account_id: Some("alice".into()),
            role_assignment: RoleAssignment::default(),
            owner: TokenOwner::Webkey,
            requirements: vec![],
            label: secret.to_owned(),
            created: 0,
            expires: None,
            expires_if_unused: None,
            for_sharing: false,
            has_api_host: false,
            revoked: false,
            suspended: false,
            trashed: false,
        }
    }

    fn grain(id: &str) -> Grain {
        Grain {
            id: id.into(),
            owner_id: "alice".into(),
            title: id.to_owned(),
            private: true,
            catalog: RoleCatalog::default(),
            trashed: false,
            suspended: false,
        }
    }

    #[test]
    fn reads_filter_dead_records() {
        let store = MemoryStore::new();
        store.insert_grain(grain("g1"));
        store.insert_grain(Grain {
            trashed: true,
            ..grain("g2")
        });

        assert_eq!(store.grains(&["g1".into(), "g2".into()]).unwrap().len(), 1);

        let live = token("live", "g1");
        let revoked = SharingToken {
            revoked: true,
            ..token("revoked", "g1")
        };
        let expired = SharingToken {
            expires: Some(50),
            ..token("expired", "g1")
        };
        store.insert_token(live.clone()).unwrap();
        store.insert_token(revoked.clone()).unwrap();
        store.insert_token(expired.clone()).unwrap();
        store.set_now(100);

        let tokens = store.tokens_for_grains(&["g1".into()]).unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].id, live.id);

        assert!(store.token(&revoked.id).unwrap().is_none());
        assert!(store.token_record(&revoked.id).unwrap().is_some());
        assert!(store.token(&expired.id).unwrap().is_none());
    }

    #[test]
    fn update_fires_watchers_once_per_change() {
        let store = MemoryStore::new();
        let tok = token("t", "g1");
        store.insert_token(tok.clone()).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen_by_handler = seen.clone();
        let subscription = store
            .watch_tokens(
                &[tok.id],
                Arc::new(move |event| {
                    assert!(matches!(event, TokenEvent::Changed { .. }));
                    seen_by_handler.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        store
            .update_token(
                &tok.id,
                TokenUpdate {
                    revoked: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        // A no-op update fires nothing.
        store
            .update_token(
                &tok.id,
                TokenUpdate {
                    revoked: Some(true),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);

        subscription.stop();
        store
            .update_token(
                &tok.id,
                TokenUpdate {
                    revoked: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn sweeps_remove_only_matching_tokens() {
        let store = MemoryStore::new();
        let keep = token("keep", "g1");
        let unused = SharingToken {
            expires_if_unused: Some(10),
            ..token("unused", "g1")
        };
        let stale_request = SharingToken {
            owner: TokenOwner::ClientRequest {
                grain_id: "g1".into(),
                session_id: "s".into(),
            },
            created: 5,
            ..token("request", "g1")
        };
        store.insert_token(keep.clone()).unwrap();
        store.insert_token(unused.clone()).unwrap();
        store.insert_token(stale_request.clone()).unwrap();

        assert_eq!(store.remove_expired_unused(100).unwrap(), 1);
        assert_eq!(store.remove_stale_client_tokens(100).unwrap(), 1);
        assert!(store.token_record(&keep.id).unwrap().is_some());
        assert!(store.token_record(&unused.id).unwrap().is_none());
        assert!(store.token_record(&stale_request.id).unwrap().is_none());
    }

    #[test]
    fn admin_lookup_is_a_set_intersection() {
        let store = MemoryStore::new();
        store.set_admin("alice".into(), true);
        let admins = store
            .admin_accounts(&["alice".into(), "bob".into()])
            .unwrap();
        assert!(admins.contains(&"alice".into()));
        assert!(!admins.contains(&"bob".into()));
    }
}
