//! Relationship fix-up between tracked entities.
//!
//! When an entity becomes tracked, navigations that can be derived from
//! foreign keys of other tracked entities are wired up, in both directions:
//!
//! - its own unpopulated navigations are filled from tracked entities that
//!   match by key;
//! - tracked principals referenced by its foreign keys get it added to
//!   their collection (or set as their single reference).
//!
//! Every link made here is a back reference, so fix-up never creates a
//! reference cycle.

use crate::change_tracker::ChangeTracker;
use crate::identity_map::IdentityMap;
use entitymodel_core::{
    EntityDescriptor, EntityRef, EntityRegistry, Navigation, NavigationInfo, NavigationKind,
};

/// The navigation on `info`'s target that walks the same foreign key back
/// to `holder`, if declared.
pub fn inverse_of(
    registry: &EntityRegistry,
    holder: &EntityDescriptor,
    info: &NavigationInfo,
) -> Option<&'static NavigationInfo> {
    let target = registry.get(info.target)?;
    target.navigations.iter().find(|nav| {
        nav.target == holder.name
            && nav.foreign_key == info.foreign_key
            && nav.key_on_target() != info.key_on_target()
    })
}

/// Add `related` to a navigation slot of `holder` as a back reference,
/// without replacing what is already there. An unpopulated collection
/// becomes populated.
pub fn link(holder: &EntityRef, info: &NavigationInfo, related: &EntityRef) {
    holder
        .write()
        .link_back(info.name, info.is_many(), related);
}

/// Point `inverse` on `related` back at `holder`, which now refers to
/// `related` strongly. A strong link already there is turned into a back
/// reference.
pub fn link_inverse(related: &EntityRef, inverse: &NavigationInfo, holder: &EntityRef) {
    let mut entity = related.write();
    if !entity.weaken(inverse.name, holder) {
        entity.link_back(inverse.name, inverse.is_many(), holder);
    }
}

/// Wire `entity` into the graph of tracked entities.
#[tracing::instrument(level = "trace", skip_all, fields(entity = entity.descriptor().name))]
pub fn fix_up(
    registry: &EntityRegistry,
    identity: &IdentityMap,
    tracker: &ChangeTracker,
    entity: &EntityRef,
) {
    let descriptor = entity.descriptor();

    for info in descriptor.navigations {
        if entity.navigation(info.name).is_some() {
            continue;
        }
        let Some(target) = registry.get(info.target) else {
            continue;
        };
        match info.kind {
            NavigationKind::ManyToOne => {
                let Some(fk) = entity.get(info.foreign_key).filter(|v| !v.is_null()) else {
                    continue;
                };
                if let Some(principal) = identity.resolve(target, &fk) {
                    tracing::trace!(navigation = info.name, "Fixed up reference");
                    entity
                        .write()
                        .set_back_navigation(info.name, &Navigation::Single(Some(principal)));
                }
            }
            NavigationKind::OneToOne | NavigationKind::OneToMany => {
                let Some(key) = entity.key() else {
                    continue;
                };
                let found: Vec<EntityRef> = tracker
                    .entities_of(target.name)
                    .filter(|d| {
                        d.get(info.foreign_key)
                            .is_some_and(|v| v.key_eq(&key))
                    })
                    .cloned()
                    .collect();
                if found.is_empty() {
                    continue;
                }
                tracing::trace!(navigation = info.name, found = found.len(), "Fixed up dependents");
                let slot = if info.is_many() {
                    Navigation::Many(found)
                } else {
                    Navigation::Single(found.into_iter().next())
                };
                entity.write().set_back_navigation(info.name, &slot);
            }
        }
    }

    for fk in registry.foreign_keys_of(descriptor.name) {
        let Some(value) = entity.get(fk.field).filter(|v| !v.is_null()) else {
            continue;
        };
        let Some(principal_descriptor) = registry.get(fk.principal) else {
            continue;
        };
        let Some(principal) = identity.resolve(principal_descriptor, &value) else {
            continue;
        };
        for info in principal_descriptor.navigations.iter().filter(|nav| {
            nav.target == descriptor.name && nav.foreign_key == fk.field && nav.key_on_target()
        }) {
            link(&principal, info, entity);
        }
    }
}
