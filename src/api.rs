// SPDX-License-Identifier: MIT OR Apache-2.0

//! Public entry points: permission queries with optional live invalidation, sharing-graph
//! auditing, and the token lifecycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, warn};

use crate::grain::GrainId;
use crate::permission::PermissionSet;
use crate::resolve::Resolution;
use crate::role::{RoleAssignment, RoleCatalog};
use crate::store::{
    GrainEvent, SharingEvents, SharingStore, SharingStoreMut, TokenEvent, TokenUpdate,
};
use crate::token::{ApiHost, SharingToken, TokenId, TokenOwner, TokenSecret};
use crate::vertex::{AccountId, Principal};
use crate::watch::WatchHandle;

/// How often `grain_permissions` re-runs its optimistic two-phase protocol before accepting a
/// result it could not verify.
const VERIFY_ATTEMPTS: usize = 3;

/// Resolutions slower than this are logged.
const SLOW_RESOLUTION: Duration = Duration::from_millis(200);

/// Grace window before short-lived powerbox request/offer tokens are swept.
const CLIENT_TOKEN_GRACE_MS: u64 = 10 * 60 * 1000;

/// Errors from the token-lifecycle entry points.
#[derive(Debug, Error)]
pub enum TokenError<E: std::error::Error> {
    #[error(transparent)]
    Store(#[from] E),

    #[error("grain not found")]
    GrainNotFound,

    #[error("parent token not found")]
    ParentNotFound,

    #[error("token not found")]
    TokenNotFound,

    #[error("caller is not authorized to modify this token")]
    NotAuthorized,
}

/// Whether `principal` is allowed to open the grain at all.
pub fn may_open_grain<S: SharingStore>(
    store: &S,
    grain_id: &GrainId,
    principal: &Principal,
) -> Result<bool, S::Error> {
    let mut resolution = Resolution::new();
    let proven = resolution.prove(
        grain_id,
        &principal.vertex(),
        &PermissionSet::new(),
        Some(store),
    )?;
    Ok(proven.is_some())
}

/// Result of [`grain_permissions`].
pub struct GrainPermissions {
    /// The permissions the principal holds, or `None` when it may not open the grain at all.
    pub permissions: Option<PermissionSet>,

    /// Handle over the live subscriptions backing the result. Inert unless an invalidation
    /// callback was supplied.
    pub watch: WatchHandle,
}

/// Compute the full set of permissions `principal` holds on `grain_id`.
///
/// When `on_invalidated` is supplied, the result stays watched: the callback fires exactly once
/// as soon as any token or grain the proof depends on changes in a way that could narrow the
/// result. Only the provably relevant slice of the sharing graph is watched, never the whole
/// token table. The caller must call `stop()` on the returned watch once the result is no
/// longer of interest.
///
/// The computation is optimistic. Phase one proves an upper bound against a snapshot and
/// collects the responsible tokens; phase two re-proves the bound from a fresh read of exactly
/// those tokens, with watchers already registered so no write slips between the two unobserved.
/// If verification keeps failing under concurrent writes the last computed result is returned
/// anyway after a few attempts (and a warning is logged); the caller sees a momentarily stale
/// answer, followed by its invalidation callback.
///
/// Admin status is resolved per computation and is not watched: an account losing its
/// administrator bit does not fire the invalidation callback.
pub fn grain_permissions<S>(
    store: &S,
    grain_id: &GrainId,
    principal: &Principal,
    catalog: &RoleCatalog,
    on_invalidated: Option<Box<dyn FnOnce() + Send>>,
) -> Result<GrainPermissions, S::Error>
where
    S: SharingStore + SharingEvents,
{
    let vertex = principal.vertex();
    let started = Instant::now();

    let mut permissions: Option<PermissionSet> = None;
    let mut watch = WatchHandle::new();

    for attempt in 1..=VERIFY_ATTEMPTS {
        watch.stop();
        watch = WatchHandle::new();

        let mut resolution = Resolution::new();
        let all = PermissionSet::from_role_assignment(&RoleAssignment::all_access(), catalog);
        let Some(upper_bound) = resolution.prove(grain_id, &vertex, &all, Some(store))? else {
            permissions = None;
            break;
        };

        let needed = resolution.responsible_tokens(grain_id, &vertex);
        resolution.reset();

        let needed_tokens: Vec<TokenId> = needed.token_ids.into_iter().collect();
        let needed_grains: Vec<GrainId> = needed.grain_ids.into_iter().collect();

        // Register watchers before re-reading, so a write racing the verification is either
        // observed by the re-proof or delivered as an event.
        if on_invalidated.is_some() {
            let handle = watch.clone();
            let token_subscription = store.watch_tokens(
                &needed_tokens,
                Arc::new(move |event| {
                    if token_event_invalidates(event) {
                        handle.invalidate();
                    }
                }),
            )?;
            watch.push(Box::new(token_subscription));

            let handle = watch.clone();
            let grain_subscription = store.watch_grains(
                &needed_grains,
                Arc::new(move |event| {
                    if grain_event_invalidates(event) {
                        handle.invalidate();
                    }
                }),
            )?;
            watch.push(Box::new(grain_subscription));
        }

        resolution.add_tokens(store.tokens_by_ids(&needed_tokens)?);
        let verified = resolution.prove(grain_id, &vertex, &upper_bound, None::<&S>)?;

        let confirmed = verified
            .as_ref()
            .is_some_and(|proven| upper_bound.is_subset_of(proven));
        permissions = verified;
        if confirmed {
            break;
        }

        debug!(attempt, %grain_id, "permission verification raced a concurrent write, retrying");
        if attempt == VERIFY_ATTEMPTS {
            warn!(
                %grain_id, %vertex,
                "permission verification kept racing concurrent writes, returning unverified result"
            );
        }
    }

    if let Some(callback) = on_invalidated {
        watch.arm(callback);
    }

    let elapsed = started.elapsed();
    if elapsed > SLOW_RESOLUTION {
        warn!(?elapsed, %grain_id, %vertex, "slow grain permission resolution");
    }

    Ok(GrainPermissions { permissions, watch })
}

fn token_event_invalidates(event: &TokenEvent) -> bool {
    match event {
        TokenEvent::Removed(_) => true,
        TokenEvent::Changed { old, new } => {
            new.trashed
                || new.role_assignment != old.role_assignment
                || new.revoked != old.revoked
                || new.suspended != old.suspended
        }
    }
}

fn grain_event_invalidates(event: &GrainEvent) -> bool {
    match event {
        GrainEvent::Removed(_) => true,
        // Only the public-to-private flip matters for privacy: a public grain grants its
        // default role to everyone, so taking that away narrows results, while granting it
        // never does.
        GrainEvent::Changed { old, new } => {
            new.trashed || new.suspended || (!old.private && new.private)
        }
    }
}

/// The starting point for a downstream-share walk.
#[derive(Clone, Debug)]
pub enum ShareRoot {
    /// Everything derived from one token.
    Token { grain_id: GrainId, token_id: TokenId },

    /// Everything a particular account shared onward.
    Sharer {
        grain_id: GrainId,
        account_id: AccountId,
    },
}

/// Collect every sharing token transitively downstream of `root`: child redemptions, and the
/// further shares made by recipients. Used to answer "who has access through me".
///
/// Only defined for private grains; on a legacy public grain the sharing graph says nothing
/// about who can access, so the result is empty. Membrane requirements are not taken into
/// account here: a downstream token is reported even when its requirements currently fail.
pub fn downstream_tokens<S: SharingStore>(
    store: &S,
    root: &ShareRoot,
) -> Result<Vec<SharingToken>, S::Error> {
    let grain_id = match root {
        ShareRoot::Token { grain_id, .. } | ShareRoot::Sharer { grain_id, .. } => grain_id,
    };
    let Some(grain) = store.grains(std::slice::from_ref(grain_id))?.pop() else {
        return Ok(Vec::new());
    };
    if !grain.private {
        return Ok(Vec::new());
    }

    let all = store.tokens_for_grains(std::slice::from_ref(grain_id))?;
    let mut by_parent: HashMap<TokenId, Vec<usize>> = HashMap::new();
    let mut by_sharer: HashMap<AccountId, Vec<usize>> = HashMap::new();
    for (index, token) in all.iter().enumerate() {
        if let Some(parent) = token.parent {
            by_parent.entry(parent).or_default().push(index);
        } else if let Some(account_id) = &token.account_id {
            by_sharer.entry(account_id.clone()).or_default().push(index);
        }
    }

    fn enqueue(
        indices: Option<&Vec<usize>>,
        all: &[SharingToken],
        stack: &mut Vec<usize>,
        stacked: &mut HashSet<TokenId>,
    ) {
        for &index in indices.into_iter().flatten() {
            if stacked.insert(all[index].id) {
                stack.push(index);
            }
        }
    }

    let mut stack: Vec<usize> = Vec::new();
    let mut stacked: HashSet<TokenId> = HashSet::new();
    match root {
        ShareRoot::Token { token_id, .. } => {
            enqueue(by_parent.get(token_id), &all, &mut stack, &mut stacked);
        }
        ShareRoot::Sharer { account_id, .. } => {
            enqueue(by_sharer.get(account_id), &all, &mut stack, &mut stacked);
        }
    }

    let mut result = Vec::new();
    while let Some(index) = stack.pop() {
        let token = &all[index];
        result.push(token.clone());
        enqueue(by_parent.get(&token.id), &all, &mut stack, &mut stacked);
        if let TokenOwner::Account { account_id, .. } = &token.owner {
            enqueue(by_sharer.get(account_id), &all, &mut stack, &mut stacked);
        }
    }

    Ok(result)
}

/// Who is creating a token: a logged-in account, or the bearer of an existing token creating a
/// child share.
#[derive(Clone, Debug)]
pub enum TokenProvider {
    Account(AccountId),
    ParentSecret(TokenSecret),
}

/// Owner descriptor accepted at token creation.
#[derive(Clone, Debug)]
pub enum NewTokenOwner {
    Webkey {
        for_sharing: bool,
        /// Delete the token if unredeemed for this long, milliseconds.
        expires_if_unused_after: Option<u64>,
    },
    Account {
        account_id: AccountId,
        title: String,
    },
    Grain {
        grain_id: GrainId,
        save_label: String,
    },
    ClientRequest {
        grain_id: GrainId,
        session_id: String,
    },
    Frontend,
}

/// Extra parameters for tokens which serve unauthenticated HTTP traffic.
#[derive(Clone, Debug, Default)]
pub struct ApiHostParams {
    pub dav_classes: Vec<String>,
}

/// Result of [`create_token`]. The secret authenticates the bearer and is returned exactly
/// once, here; only its digest is stored.
pub struct CreatedToken {
    pub id: TokenId,
    pub secret: TokenSecret,
    pub parent: Option<SharingToken>,
}

/// Create a new sharing token.
///
/// A parent-secret provider creates a child token: the parent is looked up by the digest of the
/// presented secret, must belong to the same grain, and contributes its re-sharing flag; the
/// child carries no issuing account of its own. The grain's title is denormalized into
/// account-owned tokens so lists of shares can render without joining against the grain table.
pub fn create_token<S: SharingStoreMut>(
    store: &S,
    provider: TokenProvider,
    grain_id: &GrainId,
    label: &str,
    role_assignment: RoleAssignment,
    owner: NewTokenOwner,
    api_host: Option<ApiHostParams>,
    now: u64,
) -> Result<CreatedToken, TokenError<S::Error>> {
    let grain = store
        .grains(std::slice::from_ref(grain_id))?
        .pop()
        .ok_or(TokenError::GrainNotFound)?;

    let secret = TokenSecret::generate();
    let id = TokenId::from_secret(&secret);

    let (account_id, parent, parent_token, parent_for_sharing) = match provider {
        TokenProvider::Account(account_id) => (Some(account_id), None, None, false),
        TokenProvider::ParentSecret(parent_secret) => {
            let parent_id = TokenId::from_secret(&parent_secret);
            let parent_token = store
                .token(&parent_id)?
                .filter(|token| token.grain_id == *grain_id)
                .ok_or(TokenError::ParentNotFound)?;
            let inherited_sharing = parent_token.for_sharing;
            // Child tokens carry no issuing account; their authority flows through the
            // parent chain.
            (None, Some(parent_id), Some(parent_token), inherited_sharing)
        }
    };

    let mut expires_if_unused = None;
    let mut for_sharing = false;
    let owner = match owner {
        NewTokenOwner::Webkey {
            for_sharing: webkey_for_sharing,
            expires_if_unused_after,
        } => {
            for_sharing = parent_for_sharing || webkey_for_sharing;
            expires_if_unused = expires_if_unused_after.map(|duration| now + duration);
            TokenOwner::Webkey
        }
        NewTokenOwner::Account { account_id, title } => {
            let upstream_title = (grain.title != title).then(|| grain.title.clone());
            TokenOwner::Account {
                account_id,
                title,
                upstream_title,
            }
        }
        NewTokenOwner::Grain {
            grain_id,
            save_label,
        } => TokenOwner::Grain {
            grain_id,
            save_label,
        },
        NewTokenOwner::ClientRequest {
            grain_id,
            session_id,
        } => TokenOwner::ClientRequest {
            grain_id,
            session_id,
        },
        NewTokenOwner::Frontend => TokenOwner::Frontend,
    };

    let token = SharingToken {
        id,
        grain_id: grain_id.clone(),
        parent,
        account_id,
        role_assignment,
        owner,
        requirements: Vec::new(),
        label: label.to_owned(),
        created: now,
        expires: None,
        expires_if_unused,
        for_sharing,
        has_api_host: api_host.is_some(),
        revoked: false,
        suspended: false,
        trashed: false,
    };

    if let Some(params) = api_host {
        store.insert_api_host(ApiHost::for_secret(&secret, &id, params.dav_classes))?;
    }
    store.insert_token(token)?;

    Ok(CreatedToken { id, secret, parent: parent_token })
}

/// Update a token's label, role assignment or revocation/suspension flags.
///
/// Only the issuing account may modify a token. Changes reach any live `grain_permissions`
/// watches through the store's change notifications.
pub fn update_token<S: SharingStoreMut>(
    store: &S,
    caller: &AccountId,
    token_id: &TokenId,
    update: TokenUpdate,
) -> Result<(), TokenError<S::Error>> {
    let token = store
        .token_record(token_id)?
        .ok_or(TokenError::TokenNotFound)?;
    if token.account_id.as_ref() != Some(caller) {
        return Err(TokenError::NotAuthorized);
    }
    if !store.update_token(token_id, update)? {
        return Err(TokenError::TokenNotFound);
    }
    Ok(())
}

/// Delete webkey tokens which passed their expires-if-unused deadline without ever being
/// redeemed. Intended to run periodically.
pub fn cleanup_expired_unused<S: SharingStoreMut>(store: &S, now: u64) -> Result<usize, S::Error> {
    store.remove_expired_unused(now)
}

/// Delete short-lived powerbox request/offer tokens older than the grace window. Intended to
/// run periodically.
pub fn cleanup_client_tokens<S: SharingStoreMut>(store: &S, now: u64) -> Result<usize, S::Error> {
    store.remove_stale_client_tokens(now.saturating_sub(CLIENT_TOKEN_GRACE_MS))
}
