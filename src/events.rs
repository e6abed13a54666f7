//! State transitions driven by bus signals.
//!
//! The dispatch loop decodes the raw messages; the functions here apply them
//! to [`MapperState`] and hand back whatever bus-side association work fell
//! out. All of them are idempotent inserts and deletes, so a signal
//! interleaving with an in-flight introspection of the same service
//! converges.

use crate::{
    associations::{
        self, Association, EndpointsUpdate, ASSOCIATIONS_INTERFACE,
    },
    interface_map,
    state::MapperState,
};

/// Handles the disappearance of `well_known` (old owner `old_owner`).
///
/// Drops the owner-table entry, sweeps the service out of the interface map
/// with cascade pruning, and purges its association contributions wherever
/// it had the associations interface on a path.
pub fn process_name_change_delete(
    state: &mut MapperState,
    well_known: &str,
    old_owner: &str,
) -> Vec<EndpointsUpdate> {
    if old_owner.starts_with(':') {
        state.owners.forget(old_owner);
    }

    let assoc_sources: Vec<String> = state
        .interface_map
        .iter()
        .filter(|(_, connections)| {
            connections
                .get(well_known)
                .is_some_and(|interfaces| interfaces.contains(ASSOCIATIONS_INTERFACE))
        })
        .map(|(path, _)| path.clone())
        .collect();

    let mut updates = Vec::new();
    for source in assoc_sources {
        updates.extend(associations::purge_owner(
            &mut state.associations,
            &source,
            well_known,
        ));
    }
    associations::scrub_pending_for_owner(&mut state.associations, well_known);

    state.interface_map.retain(|_, connections| {
        connections.remove(well_known);
        !connections.is_empty()
    });

    updates
}

/// Applies an `InterfacesAdded` for `obj_path` sent by `owner`.
///
/// `associations` carries the payload of the `associations` property when
/// the signal announced the associations interface.
pub fn process_interfaces_added(
    state: &mut MapperState,
    obj_path: &str,
    owner: &str,
    interfaces: impl IntoIterator<Item = String>,
    associations: Option<Vec<Association>>,
) -> Vec<EndpointsUpdate> {
    let newly_seen =
        interface_map::insert_interfaces(&mut state.interface_map, obj_path, owner, interfaces);

    let mut updates = Vec::new();
    if newly_seen {
        updates.extend(associations::resolve_pending(
            &mut state.associations,
            obj_path,
        ));
    }

    if let Some(assocs) = associations {
        updates.extend(associations::association_changed(
            &mut state.associations,
            &state.interface_map,
            obj_path,
            owner,
            assocs,
        ));
    }

    updates
}

/// Applies an `InterfacesRemoved` for `obj_path` sent by `owner`, cascade
/// pruning empty entries.
pub fn process_interfaces_removed(
    state: &mut MapperState,
    obj_path: &str,
    owner: &str,
    interfaces: &[String],
) -> Vec<EndpointsUpdate> {
    let Some(connections) = state.interface_map.get_mut(obj_path) else {
        return Vec::new();
    };

    let mut purge = false;
    if let Some(names) = connections.get_mut(owner) {
        for interface in interfaces {
            names.remove(interface);
            purge |= interface == ASSOCIATIONS_INTERFACE;
        }
        if names.is_empty() {
            connections.remove(owner);
        }
    }
    if connections.is_empty() {
        state.interface_map.remove(obj_path);
    }

    if purge {
        return associations::purge_owner(&mut state.associations, obj_path, owner);
    }

    Vec::new()
}
