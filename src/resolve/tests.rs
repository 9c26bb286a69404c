// SPDX-License-Identifier: MIT OR Apache-2.0

use std::collections::HashSet;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::grain::Grain;
use crate::permission::PermissionSet;
use crate::requirement::Requirement;
use crate::role::{RoleAssignment, RoleCatalog, RoleChoice, RoleDef};
use crate::store::{MemoryStore, SharingStore, SharingStoreMut, TokenUpdate};
use crate::token::{SharingToken, TokenId, TokenOwner, TokenSecret};
use crate::vertex::{Principal, Vertex};

use super::Resolution;

const EDITOR: usize = 0;
const VIEWER: usize = 1;

fn token_id(secret: &str) -> TokenId {
    TokenId::from_secret(&TokenSecret::from(secret))
}

fn account(id: &str) -> Vertex {
    Vertex::Account(id.into())
}

fn all() -> PermissionSet {
    PermissionSet::from(vec![true, true])
}

/// Catalog with two permissions (read, write) and two roles: editor grants both, viewer (the
/// default role) grants read only.
fn catalog() -> RoleCatalog {
    RoleCatalog {
        permission_count: 2,
        roles: vec![
            RoleDef {
                permissions: PermissionSet::from(vec![true, true]),
                default: false,
            },
            RoleDef {
                permissions: PermissionSet::from(vec![true, false]),
                default: true,
            },
        ],
    }
}

fn grain(id: &str, owner: &str) -> Grain {
    Grain {
        id: id.into(),
        owner_id: owner.into(),
        title: id.to_owned(),
        private: true,
        catalog: catalog(),
        trashed: false,
        suspended: false,
    }
}

fn base_token(secret: &str, grain: &str) -> SharingToken {
    SharingToken {
        id: token_id(secret),
        grain_id: grain.into(),
        parent: None,
        account_id: None,
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

/// A token issued by `issuer`, addressed to the account `recipient`.
fn account_share(
    secret: &str,
    grain: &str,
    issuer: &str,
    recipient: &str,
    role: RoleAssignment,
) -> SharingToken {
    SharingToken {
        account_id: Some(issuer.into()),
        role_assignment: role,
        owner: TokenOwner::Account {
            account_id: recipient.into(),
            title: grain.to_owned(),
            upstream_title: None,
        },
        ..base_token(secret, grain)
    }
}

/// An un-redeemed bearer token issued by `issuer`.
fn webkey_share(secret: &str, grain: &str, issuer: &str, role: RoleAssignment) -> SharingToken {
    SharingToken {
        account_id: Some(issuer.into()),
        role_assignment: role,
        for_sharing: true,
        ..base_token(secret, grain)
    }
}

/// A child token derived from `parent`, addressed to the account `recipient`.
fn child_share(
    secret: &str,
    grain: &str,
    parent: TokenId,
    recipient: &str,
    role: RoleAssignment,
) -> SharingToken {
    SharingToken {
        parent: Some(parent),
        role_assignment: role,
        owner: TokenOwner::Account {
            account_id: recipient.into(),
            title: grain.to_owned(),
            upstream_title: None,
        },
        ..base_token(secret, grain)
    }
}

fn resolve(store: &MemoryStore, grain: &str, vertex: &Vertex) -> Option<PermissionSet> {
    let mut resolution = Resolution::new();
    resolution
        .prove(&grain.into(), vertex, &all(), Some(store))
        .unwrap()
}

#[test]
fn owner_holds_everything() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));

    assert_eq!(
        resolve(&store, "g1", &account("alice")),
        Some(PermissionSet::from(vec![true, true]))
    );
    assert_eq!(resolve(&store, "g1", &account("bob")), None);
}

#[test]
fn direct_share_grants_the_assigned_role() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    store
        .insert_token(account_share(
            "t1",
            "g1",
            "alice",
            "bob",
            RoleAssignment::role(VIEWER),
        ))
        .unwrap();

    assert_eq!(
        resolve(&store, "g1", &account("bob")),
        Some(PermissionSet::from(vec![true, false]))
    );
}

#[test]
fn bearer_vertex_resolves_through_the_token_itself() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    let t1 = webkey_share("t1", "g1", "alice", RoleAssignment::role(EDITOR));
    store.insert_token(t1.clone()).unwrap();

    assert_eq!(
        resolve(&store, "g1", &Vertex::Token(t1.id)),
        Some(PermissionSet::from(vec![true, true]))
    );
}

#[test]
fn missing_grain_proves_nothing() {
    let store = MemoryStore::new();
    assert_eq!(resolve(&store, "nope", &account("alice")), None);
}

#[test]
fn chained_share_carries_the_weaker_role() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    let t1 = webkey_share("t1", "g1", "alice", RoleAssignment::role(EDITOR));
    let t2 = child_share("t2", "g1", t1.id, "bob", RoleAssignment::role(VIEWER));
    store.insert_token(t1.clone()).unwrap();
    store.insert_token(t2.clone()).unwrap();

    let mut resolution = Resolution::new();
    let proven = resolution
        .prove(&"g1".into(), &account("bob"), &all(), Some(&store))
        .unwrap();
    assert_eq!(proven, Some(PermissionSet::from(vec![true, false])));

    let responsible = resolution.responsible_tokens(&"g1".into(), &account("bob"));
    assert_eq!(responsible.token_ids, HashSet::from([t1.id, t2.id]));
    assert_eq!(responsible.grain_ids, HashSet::from(["g1".into()]));

    // Revoking the upstream token cuts the chain even though the child record is untouched.
    store
        .update_token(
            &t1.id,
            TokenUpdate {
                revoked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(resolve(&store, "g1", &account("bob")), None);
}

#[test]
fn responsible_tokens_are_sufficient_to_reprove() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    let t1 = webkey_share("t1", "g1", "alice", RoleAssignment::role(EDITOR));
    let t2 = child_share("t2", "g1", t1.id, "bob", RoleAssignment::role(VIEWER));
    // A distraction share to someone else, which must not be needed for bob's proof.
    let t3 = account_share("t3", "g1", "alice", "carol", RoleAssignment::role(EDITOR));
    store.insert_token(t1).unwrap();
    store.insert_token(t2).unwrap();
    store.insert_token(t3.clone()).unwrap();

    let mut resolution = Resolution::new();
    let proven = resolution
        .prove(&"g1".into(), &account("bob"), &all(), Some(&store))
        .unwrap()
        .unwrap();

    let responsible = resolution.responsible_tokens(&"g1".into(), &account("bob"));
    assert!(!responsible.token_ids.is_empty());
    assert!(!responsible.token_ids.contains(&t3.id));

    // Re-proving from exactly the responsible slice, with no store access, reproduces the
    // result.
    let needed: Vec<TokenId> = responsible.token_ids.into_iter().collect();
    let mut verify = Resolution::new();
    verify.add_grain(grain("g1", "alice"));
    verify.add_tokens(store.tokens_by_ids(&needed).unwrap());
    let reproven = verify
        .prove(&"g1".into(), &account("bob"), &proven, None::<&MemoryStore>)
        .unwrap();
    assert_eq!(reproven, Some(proven));
}

#[test]
fn dangling_parent_contributes_no_edge() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    store
        .insert_token(child_share(
            "t2",
            "g1",
            token_id("never-created"),
            "bob",
            RoleAssignment::role(VIEWER),
        ))
        .unwrap();

    assert_eq!(resolve(&store, "g1", &account("bob")), None);
}

#[test]
fn legacy_public_grain_grants_the_default_role() {
    let store = MemoryStore::new();
    store.insert_grain(Grain {
        private: false,
        ..grain("g1", "alice")
    });

    // Any non-owner account receives the default role with zero tokens present.
    assert_eq!(
        resolve(&store, "g1", &account("bob")),
        Some(PermissionSet::from(vec![true, false]))
    );
    // The owner still holds everything.
    assert_eq!(
        resolve(&store, "g1", &account("alice")),
        Some(PermissionSet::from(vec![true, true]))
    );

    // Going private revokes the implicit grant on the next fresh resolution.
    store.update_grain(&"g1".into(), |grain| grain.private = true);
    assert_eq!(resolve(&store, "g1", &account("bob")), None);
}

#[test]
fn permissions_held_requirement_gates_until_proven() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    store.insert_grain(grain("g2", "alice"));

    // The share of g2 only holds while bob can read g1.
    let gated = SharingToken {
        requirements: vec![Requirement::PermissionsHeld {
            grain_id: "g1".into(),
            holder: Principal::Account("bob".into()),
            permissions: PermissionSet::from(vec![true, false]),
        }],
        ..account_share("gated", "g2", "alice", "bob", RoleAssignment::role(EDITOR))
    };
    store.insert_token(gated).unwrap();

    // Nothing proves bob's access to g1 yet, so the requirement fails and the gated token
    // propagates nothing at all.
    assert_eq!(resolve(&store, "g2", &account("bob")), None);

    // A share on g1 satisfies the requirement; resolution crosses grains to find it.
    store
        .insert_token(account_share(
            "t1",
            "g1",
            "alice",
            "bob",
            RoleAssignment::role(VIEWER),
        ))
        .unwrap();
    assert_eq!(
        resolve(&store, "g2", &account("bob")),
        Some(PermissionSet::from(vec![true, true]))
    );
}

#[test]
fn token_valid_requirement_follows_the_referenced_token() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));

    let t3 = webkey_share("t3", "g1", "alice", RoleAssignment::all_access());
    let t4 = SharingToken {
        requirements: vec![Requirement::TokenValid { token_id: t3.id }],
        ..account_share("t4", "g1", "alice", "carol", RoleAssignment::role(VIEWER))
    };
    store.insert_token(t4).unwrap();

    // The requirement references a token that does not exist yet.
    assert_eq!(resolve(&store, "g1", &account("carol")), None);

    // Once the referenced token exists and is un-revoked, carol's grant holds without her own
    // token being reissued.
    store.insert_token(t3.clone()).unwrap();
    assert_eq!(
        resolve(&store, "g1", &account("carol")),
        Some(PermissionSet::from(vec![true, false]))
    );

    // Revoking the referenced token kills the grant again.
    store
        .update_token(
            &t3.id,
            TokenUpdate {
                revoked: Some(true),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(resolve(&store, "g1", &account("carol")), None);
}

#[test]
fn admin_requirement_resolves_against_the_admin_set() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    let token = SharingToken {
        requirements: vec![Requirement::IsAdmin {
            account_id: "bob".into(),
        }],
        ..account_share("t1", "g1", "alice", "bob", RoleAssignment::role(VIEWER))
    };
    store.insert_token(token).unwrap();

    assert_eq!(resolve(&store, "g1", &account("bob")), None);

    store.set_admin("bob".into(), true);
    assert_eq!(
        resolve(&store, "g1", &account("bob")),
        Some(PermissionSet::from(vec![true, false]))
    );
}

#[test]
fn fixpoint_is_independent_of_token_order() {
    // A moderately tangled graph: a webkey chain, an extra-bit grant, a re-share by a
    // recipient and a requirement-gated share.
    let t1 = webkey_share("t1", "g1", "alice", RoleAssignment::role(EDITOR));
    let t2 = child_share("t2", "g1", t1.id, "bob", RoleAssignment::role(VIEWER));
    let t3 = account_share(
        "t3",
        "g1",
        "alice",
        "bob",
        RoleAssignment {
            choice: RoleChoice::Role(VIEWER),
            add: PermissionSet::from(vec![false, true]),
            remove: PermissionSet::new(),
        },
    );
    let t4 = account_share("t4", "g1", "bob", "carol", RoleAssignment::role(EDITOR));
    let t5 = SharingToken {
        requirements: vec![Requirement::PermissionsHeld {
            grain_id: "g1".into(),
            holder: Principal::Account("bob".into()),
            permissions: PermissionSet::from(vec![true, true]),
        }],
        ..account_share("t5", "g1", "alice", "dave", RoleAssignment::role(VIEWER))
    };
    let tokens = vec![t1, t2, t3, t4, t5];

    fn resolve_order(order: &[SharingToken], vertex: &Vertex) -> Option<PermissionSet> {
        let mut resolution = Resolution::new();
        resolution.add_grain(grain("g1", "alice"));
        resolution.add_tokens(order.iter().cloned());
        resolution
            .prove(&"g1".into(), vertex, &all(), None::<&MemoryStore>)
            .unwrap()
    }

    let carol_baseline = resolve_order(&tokens, &account("carol"));
    let dave_baseline = resolve_order(&tokens, &account("dave"));
    assert_eq!(carol_baseline, Some(PermissionSet::from(vec![true, true])));
    assert_eq!(dave_baseline, Some(PermissionSet::from(vec![true, false])));

    let mut rng = StdRng::seed_from_u64(7);
    let mut shuffled = tokens.clone();
    for _ in 0..16 {
        shuffled.shuffle(&mut rng);
        assert_eq!(resolve_order(&shuffled, &account("carol")), carol_baseline);
        assert_eq!(resolve_order(&shuffled, &account("dave")), dave_baseline);
    }
}

#[test]
fn off_path_tokens_are_never_activated() {
    let store = MemoryStore::new();
    store.insert_grain(grain("g1", "alice"));
    store
        .insert_token(account_share(
            "t1",
            "g1",
            "alice",
            "bob",
            RoleAssignment::role(VIEWER),
        ))
        .unwrap();
    // A share hanging off carol leads nowhere near bob.
    store
        .insert_token(account_share(
            "t2",
            "g1",
            "carol",
            "dave",
            RoleAssignment::role(EDITOR),
        ))
        .unwrap();

    let mut resolution = Resolution::new();
    resolution
        .prove(&"g1".into(), &account("bob"), &all(), Some(&store))
        .unwrap();
    let responsible = resolution.responsible_tokens(&"g1".into(), &account("bob"));
    assert_eq!(responsible.token_ids, HashSet::from([token_id("t1")]));
}

#[test]
fn suspended_grain_contributes_nothing() {
    let store = MemoryStore::new();
    store.insert_grain(Grain {
        suspended: true,
        ..grain("g1", "alice")
    });
    assert_eq!(resolve(&store, "g1", &account("alice")), None);
}
