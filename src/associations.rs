//! The association engine.
//!
//! Services assert associations through the `associations` property on
//! `org.openbmc.Associations`: a list of `(forward, reverse, endpoint)`
//! triples on some source path. Each triple expands into two derived objects
//! owned by the mapper, `<source>/<forward>` pointing at the endpoint and
//! `<endpoint>/<reverse>` pointing back at the source, each exporting
//! `xyz.openbmc_project.Association` with an `endpoints` property.
//!
//! The functions here reconcile those maps and return the bus-side work
//! (publish or retire a derived object) as explicit values; the caller
//! applies them to the object server once the state lock is released. The
//! derived object always dies after its map entry, so queries never see a
//! path whose export is already gone.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use parking_lot::RwLock;
use zbus::{interface, zvariant::OwnedObjectPath};

use crate::interface_map::InterfaceMap;

/// The interface on which services publish their `associations` property.
pub const ASSOCIATIONS_INTERFACE: &str = "org.openbmc.Associations";

/// The interface the mapper's derived association objects export.
pub const ASSOCIATION_INTERFACE: &str = "xyz.openbmc_project.Association";

/// One raw `(forward, reverse, endpoint)` triple as asserted by a service.
pub type Association = (String, String, String);

/// Derived association path → the endpoints one owner asserts for it.
pub type AssociationPaths = BTreeMap<String, BTreeSet<String>>;

/// An association whose endpoint path has not appeared in the interface map
/// yet; parked until it does.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PendingAssociation {
    pub source: String,
    pub owner: String,
    pub forward: String,
    pub reverse: String,
}

/// Everything the engine maintains.
///
/// `owners` records who asserted what (source path → service → derived
/// layout), so a vanished or republishing owner subtracts exactly its own
/// contributions. `ifaces` is the authoritative, bus-visible view: derived
/// path → endpoint list, present iff the list is non-empty. `pending` is
/// keyed by the awaited endpoint path.
#[derive(Debug, Default)]
pub struct AssociationMaps {
    pub ifaces: BTreeMap<String, EndpointList>,
    pub owners: BTreeMap<String, BTreeMap<String, AssociationPaths>>,
    pub pending: BTreeMap<String, Vec<PendingAssociation>>,
}

/// The endpoint list behind one derived object.
///
/// One end is held in [`AssociationMaps::ifaces`], the other by the exported
/// interface, so the property getter always reads current data. Insertion
/// order is kept for stable property output; inserts de-duplicate.
#[derive(Clone, Debug, Default)]
pub struct EndpointList(Arc<RwLock<Vec<String>>>);

impl EndpointList {
    pub fn insert(&self, endpoint: &str) -> bool {
        let mut endpoints = self.0.write();
        if endpoints.iter().any(|e| e == endpoint) {
            return false;
        }
        endpoints.push(endpoint.to_string());
        true
    }

    pub fn remove(&self, endpoint: &str) -> bool {
        let mut endpoints = self.0.write();
        match endpoints.iter().position(|e| e == endpoint) {
            Some(index) => {
                endpoints.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.read().is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.read().len()
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.0.read().clone()
    }
}

impl<S: Into<String>> FromIterator<S> for EndpointList {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        Self(Arc::new(RwLock::new(
            iter.into_iter().map(Into::into).collect(),
        )))
    }
}

/// Bus-side work computed by a reconciliation step, keyed by derived path.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum EndpointsUpdate {
    /// Export the derived object if it is new, else re-emit its `endpoints`
    /// property.
    Publish(String),
    /// Tear the derived object down; its endpoint list went empty.
    Retire(String),
}

/// Applies a new value of the `associations` property asserted by `owner` on
/// `source_path`.
///
/// Triples with an empty forward type, reverse type, or endpoint are dropped
/// whole. Endpoints not yet present in `interface_map` are parked in
/// `pending` rather than materialized.
pub fn association_changed(
    maps: &mut AssociationMaps,
    interface_map: &InterfaceMap,
    source_path: &str,
    owner: &str,
    associations: Vec<Association>,
) -> Vec<EndpointsUpdate> {
    // A republish replaces any still-parked entries from this owner.
    scrub_pending(maps, source_path, owner);

    let mut layout = AssociationPaths::new();
    for (forward, reverse, endpoint) in associations {
        if forward.is_empty() || reverse.is_empty() || endpoint.is_empty() {
            continue;
        }

        if !interface_map.contains_key(endpoint.as_str()) {
            maps.pending
                .entry(endpoint)
                .or_default()
                .push(PendingAssociation {
                    source: source_path.to_string(),
                    owner: owner.to_string(),
                    forward,
                    reverse,
                });
            continue;
        }

        layout
            .entry(format!("{source_path}/{forward}"))
            .or_default()
            .insert(endpoint.clone());
        layout
            .entry(format!("{endpoint}/{reverse}"))
            .or_default()
            .insert(source_path.to_string());
    }

    let mut updates = check_endpoint_removes(maps, source_path, owner, &layout);

    for (assoc_path, endpoints) in &layout {
        updates.extend(add_endpoints(maps, assoc_path, endpoints.iter()));
    }

    if layout.is_empty() {
        remove_owner_entry(maps, source_path, owner);
    } else {
        maps.owners
            .entry(source_path.to_string())
            .or_default()
            .insert(owner.to_string(), layout);
    }

    updates
}

/// Removes every contribution `owner` made on `source_path`: endpoint
/// subtraction on each derived path it asserted, plus any parked entries.
///
/// Used when the owning service vanishes or drops its associations
/// interface.
pub fn purge_owner(
    maps: &mut AssociationMaps,
    source_path: &str,
    owner: &str,
) -> Vec<EndpointsUpdate> {
    scrub_pending(maps, source_path, owner);

    let Some(layout) = maps
        .owners
        .get(source_path)
        .and_then(|owners| owners.get(owner))
        .cloned()
    else {
        return Vec::new();
    };

    let mut updates = Vec::new();
    for (assoc_path, endpoints) in &layout {
        updates.extend(remove_endpoints(maps, assoc_path, endpoints.iter()));
    }

    remove_owner_entry(maps, source_path, owner);

    updates
}

/// Materializes associations that were waiting for `new_path` to appear.
///
/// Called whenever a path transitions from absent to present in the
/// interface map; closes the race with endpoints introspected later than the
/// association referencing them.
pub fn resolve_pending(maps: &mut AssociationMaps, new_path: &str) -> Vec<EndpointsUpdate> {
    let Some(waiting) = maps.pending.remove(new_path) else {
        return Vec::new();
    };

    let mut updates = Vec::new();
    for pending in waiting {
        let forward_path = format!("{}/{}", pending.source, pending.forward);
        let reverse_path = format!("{}/{}", new_path, pending.reverse);

        updates.extend(add_endpoints(maps, &forward_path, [new_path].into_iter()));
        updates.extend(add_endpoints(
            maps,
            &reverse_path,
            [pending.source.as_str()].into_iter(),
        ));

        let layout = maps
            .owners
            .entry(pending.source.clone())
            .or_default()
            .entry(pending.owner.clone())
            .or_default();
        layout
            .entry(forward_path)
            .or_default()
            .insert(new_path.to_string());
        layout.entry(reverse_path).or_default().insert(pending.source);
    }

    updates
}

/// Subtracts the endpoints `owner` previously asserted but `new_layout` no
/// longer contains.
fn check_endpoint_removes(
    maps: &mut AssociationMaps,
    source_path: &str,
    owner: &str,
    new_layout: &AssociationPaths,
) -> Vec<EndpointsUpdate> {
    let Some(old_layout) = maps
        .owners
        .get(source_path)
        .and_then(|owners| owners.get(owner))
        .cloned()
    else {
        return Vec::new();
    };

    let mut updates = Vec::new();
    for (assoc_path, old_endpoints) in &old_layout {
        match new_layout.get(assoc_path) {
            None => updates.extend(remove_endpoints(maps, assoc_path, old_endpoints.iter())),
            Some(new_endpoints) => {
                let stale = old_endpoints.difference(new_endpoints);
                updates.extend(remove_endpoints(maps, assoc_path, stale));
            }
        }
    }

    updates
}

fn add_endpoints<S: AsRef<str>>(
    maps: &mut AssociationMaps,
    assoc_path: &str,
    endpoints: impl Iterator<Item = S>,
) -> Option<EndpointsUpdate> {
    let list = maps.ifaces.entry(assoc_path.to_string()).or_default();

    let mut changed = false;
    for endpoint in endpoints {
        changed |= list.insert(endpoint.as_ref());
    }

    changed.then(|| EndpointsUpdate::Publish(assoc_path.to_string()))
}

fn remove_endpoints<'e>(
    maps: &mut AssociationMaps,
    assoc_path: &str,
    endpoints: impl Iterator<Item = &'e String>,
) -> Option<EndpointsUpdate> {
    let list = maps.ifaces.get(assoc_path)?;

    let mut changed = false;
    for endpoint in endpoints {
        changed |= list.remove(endpoint);
    }

    if list.is_empty() {
        maps.ifaces.remove(assoc_path);
        return Some(EndpointsUpdate::Retire(assoc_path.to_string()));
    }

    changed.then(|| EndpointsUpdate::Publish(assoc_path.to_string()))
}

fn remove_owner_entry(maps: &mut AssociationMaps, source_path: &str, owner: &str) {
    if let Some(owners) = maps.owners.get_mut(source_path) {
        owners.remove(owner);
        if owners.is_empty() {
            maps.owners.remove(source_path);
        }
    }
}

fn scrub_pending(maps: &mut AssociationMaps, source_path: &str, owner: &str) {
    maps.pending.retain(|_, waiting| {
        waiting.retain(|pending| pending.source != source_path || pending.owner != owner);
        !waiting.is_empty()
    });
}

/// Drops every parked association belonging to `owner`, regardless of source
/// path. Used on owner-lost.
pub fn scrub_pending_for_owner(maps: &mut AssociationMaps, owner: &str) {
    maps.pending.retain(|_, waiting| {
        waiting.retain(|pending| pending.owner != owner);
        !waiting.is_empty()
    });
}

/// The `xyz.openbmc_project.Association` interface exported at each derived
/// path; shares its endpoint list with the engine's map entry.
pub(crate) struct AssociationEndpoints {
    endpoints: EndpointList,
}

impl AssociationEndpoints {
    pub(crate) fn new(endpoints: EndpointList) -> Self {
        Self { endpoints }
    }
}

#[interface(name = "xyz.openbmc_project.Association")]
impl AssociationEndpoints {
    #[zbus(property)]
    fn endpoints(&self) -> Vec<OwnedObjectPath> {
        self.endpoints
            .snapshot()
            .into_iter()
            .filter_map(|endpoint| OwnedObjectPath::try_from(endpoint).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SOURCE_PATH: &str = "/logging/entry/1";
    const OWNER: &str = "xyz.openbmc_project.Test";
    const ENDPOINT: &str = "/system/cpu0";
    const FWD_PATH: &str = "/logging/entry/1/callout";
    const REV_PATH: &str = "/system/cpu0/fault";

    fn default_owner_maps() -> AssociationMaps {
        let mut maps = AssociationMaps::default();
        let mut layout = AssociationPaths::new();
        layout.insert(FWD_PATH.to_string(), [ENDPOINT.to_string()].into());
        layout.insert(REV_PATH.to_string(), [SOURCE_PATH.to_string()].into());
        maps.owners
            .entry(SOURCE_PATH.to_string())
            .or_default()
            .insert(OWNER.to_string(), layout);
        maps.ifaces
            .insert(FWD_PATH.to_string(), EndpointList::from_iter([ENDPOINT]));
        maps.ifaces
            .insert(REV_PATH.to_string(), EndpointList::from_iter([SOURCE_PATH]));
        maps
    }

    fn map_with(paths: &[&str]) -> InterfaceMap {
        let mut map = InterfaceMap::new();
        for path in paths {
            map.entry(path.to_string())
                .or_default()
                .entry("some.service".to_string())
                .or_default()
                .insert("some.interface".to_string());
        }
        map
    }

    #[test]
    fn endpoint_list_deduplicates() {
        let list = EndpointList::default();

        assert!(list.insert("/a"));
        assert!(!list.insert("/a"));
        assert!(list.insert("/b"));
        assert_eq!(list.snapshot(), vec!["/a".to_string(), "/b".to_string()]);

        assert!(list.remove("/a"));
        assert!(!list.remove("/a"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn purge_unknown_source_is_a_no_op() {
        let mut maps = AssociationMaps::default();

        let updates = purge_owner(&mut maps, "/no/association", OWNER);

        assert!(updates.is_empty());
    }

    #[test]
    fn purge_unknown_owner_is_a_no_op() {
        let mut maps = default_owner_maps();

        let updates = purge_owner(&mut maps, SOURCE_PATH, "xyz.openbmc_project.Other");

        assert!(updates.is_empty());
        assert_eq!(maps.owners.len(), 1);
    }

    #[test]
    fn purge_drains_both_directions() {
        let mut maps = default_owner_maps();

        let updates = purge_owner(&mut maps, SOURCE_PATH, OWNER);

        assert!(maps.owners.is_empty());
        assert!(maps.ifaces.is_empty());
        assert_eq!(
            updates,
            vec![
                EndpointsUpdate::Retire(FWD_PATH.to_string()),
                EndpointsUpdate::Retire(REV_PATH.to_string()),
            ]
        );
    }

    #[test]
    fn purge_keeps_endpoints_owned_by_others() {
        let mut maps = default_owner_maps();
        maps.ifaces[FWD_PATH].insert("/extra/endpoint");

        let updates = purge_owner(&mut maps, SOURCE_PATH, OWNER);

        assert!(maps.owners.is_empty());
        assert_eq!(maps.ifaces[FWD_PATH].snapshot(), vec!["/extra/endpoint"]);
        assert!(updates.contains(&EndpointsUpdate::Publish(FWD_PATH.to_string())));
        assert!(updates.contains(&EndpointsUpdate::Retire(REV_PATH.to_string())));
    }

    #[test]
    fn identical_layout_changes_nothing() {
        let mut maps = default_owner_maps();
        let mut layout = AssociationPaths::new();
        layout.insert(FWD_PATH.to_string(), [ENDPOINT.to_string()].into());
        layout.insert(REV_PATH.to_string(), [SOURCE_PATH.to_string()].into());

        let updates = check_endpoint_removes(&mut maps, SOURCE_PATH, OWNER, &layout);

        assert!(updates.is_empty());
        assert_eq!(maps.ifaces[FWD_PATH].len(), 1);
        assert_eq!(maps.ifaces[REV_PATH].len(), 1);
    }

    #[test]
    fn changed_assoc_path_drains_the_old_one() {
        let mut maps = default_owner_maps();
        let mut layout = AssociationPaths::new();
        layout.insert("/different/path".to_string(), [ENDPOINT.to_string()].into());

        let updates = check_endpoint_removes(&mut maps, SOURCE_PATH, OWNER, &layout);

        assert!(!maps.ifaces.contains_key(FWD_PATH));
        assert!(!maps.ifaces.contains_key(REV_PATH));
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn changed_endpoint_drains_the_old_one() {
        let mut maps = default_owner_maps();
        let mut layout = AssociationPaths::new();
        layout.insert(
            FWD_PATH.to_string(),
            [format!("{ENDPOINT}/different")].into(),
        );
        layout.insert(
            REV_PATH.to_string(),
            [format!("{SOURCE_PATH}/different")].into(),
        );

        check_endpoint_removes(&mut maps, SOURCE_PATH, OWNER, &layout);

        assert!(!maps.ifaces.contains_key(FWD_PATH));
        assert!(!maps.ifaces.contains_key(REV_PATH));
    }

    #[test]
    fn empty_endpoint_drops_the_whole_triple() {
        let mut maps = default_owner_maps();
        let interface_map = map_with(&[ENDPOINT]);
        let associations = vec![("inventory".to_string(), "error".to_string(), String::new())];

        let updates = association_changed(
            &mut maps,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            associations,
        );

        // Nothing valid was asserted, so both derived objects go away.
        assert!(!maps.ifaces.contains_key(FWD_PATH));
        assert!(!maps.ifaces.contains_key(REV_PATH));
        assert!(maps.owners.is_empty());
        assert!(maps.pending.is_empty());
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn empty_types_drop_the_whole_triple() {
        let mut maps = AssociationMaps::default();
        let interface_map = map_with(&[ENDPOINT]);

        association_changed(
            &mut maps,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            vec![
                (String::new(), "error".to_string(), ENDPOINT.to_string()),
                ("inventory".to_string(), String::new(), ENDPOINT.to_string()),
            ],
        );

        assert!(maps.ifaces.is_empty());
        assert!(maps.owners.is_empty());
    }

    #[test]
    fn new_association_materializes_both_directions() {
        let mut maps = AssociationMaps::default();
        let endpoint = "/xyz/openbmc_project/inventory/system/chassis";
        let interface_map = map_with(&[endpoint]);

        let updates = association_changed(
            &mut maps,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            vec![(
                "inventory".to_string(),
                "error".to_string(),
                endpoint.to_string(),
            )],
        );

        let forward = format!("{SOURCE_PATH}/inventory");
        let reverse = format!("{endpoint}/error");
        assert_eq!(maps.ifaces[&forward].snapshot(), vec![endpoint]);
        assert_eq!(maps.ifaces[&reverse].snapshot(), vec![SOURCE_PATH]);
        assert_eq!(maps.owners[SOURCE_PATH][OWNER].len(), 2);
        assert_eq!(
            updates,
            vec![
                EndpointsUpdate::Publish(forward),
                EndpointsUpdate::Publish(reverse),
            ]
        );
    }

    #[test]
    fn new_owner_contributes_alongside_the_old_one() {
        let mut maps = default_owner_maps();
        let new_owner = "xyz.openbmc_project.Test2";
        let endpoint = "/xyz/openbmc_project/inventory/system/chassis";
        let interface_map = map_with(&[endpoint]);

        association_changed(
            &mut maps,
            &interface_map,
            SOURCE_PATH,
            new_owner,
            vec![(
                "inventory".to_string(),
                "error".to_string(),
                endpoint.to_string(),
            )],
        );

        // Same source path, so the owner map gains a second service.
        assert_eq!(maps.owners.len(), 1);
        assert_eq!(maps.owners[SOURCE_PATH][new_owner].len(), 2);
        assert_eq!(maps.ifaces[FWD_PATH].len(), 1);
    }

    #[test]
    fn republish_replaces_the_old_layout() {
        let mut maps = default_owner_maps();
        let endpoint = "/xyz/openbmc_project/inventory/system/chassis";
        let interface_map = map_with(&[endpoint]);

        association_changed(
            &mut maps,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            vec![(
                "abc".to_string(),
                "error".to_string(),
                endpoint.to_string(),
            )],
        );

        // The old forward object is drained; the new one takes its place.
        assert!(!maps.ifaces.contains_key(FWD_PATH));
        let new_forward = format!("{SOURCE_PATH}/abc");
        assert_eq!(maps.ifaces[&new_forward].snapshot(), vec![endpoint]);
        assert_eq!(maps.owners[SOURCE_PATH][OWNER].len(), 2);
    }

    #[test]
    fn republishing_nothing_tears_everything_down() {
        let mut maps = default_owner_maps();
        let interface_map = map_with(&[ENDPOINT]);

        let updates =
            association_changed(&mut maps, &interface_map, SOURCE_PATH, OWNER, vec![]);

        assert!(maps.ifaces.is_empty());
        assert!(maps.owners.is_empty());
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn unknown_endpoint_is_parked_not_materialized() {
        let mut maps = AssociationMaps::default();
        let interface_map = InterfaceMap::new();

        let updates = association_changed(
            &mut maps,
            &interface_map,
            "/source",
            OWNER,
            vec![("fwd".to_string(), "rev".to_string(), "/late".to_string())],
        );

        assert!(updates.is_empty());
        assert!(maps.ifaces.is_empty());
        assert!(maps.owners.is_empty());
        assert_eq!(maps.pending["/late"].len(), 1);
    }

    #[test]
    fn resolve_pending_materializes_both_directions() {
        let mut maps = AssociationMaps::default();
        let interface_map = InterfaceMap::new();
        association_changed(
            &mut maps,
            &interface_map,
            "/source",
            OWNER,
            vec![("fwd".to_string(), "rev".to_string(), "/late".to_string())],
        );

        let updates = resolve_pending(&mut maps, "/late");

        assert_eq!(maps.ifaces["/source/fwd"].snapshot(), vec!["/late"]);
        assert_eq!(maps.ifaces["/late/rev"].snapshot(), vec!["/source"]);
        assert_eq!(maps.owners["/source"][OWNER].len(), 2);
        assert!(maps.pending.is_empty());
        assert_eq!(updates.len(), 2);
    }

    #[test]
    fn resolve_pending_on_unrelated_path_is_a_no_op() {
        let mut maps = AssociationMaps::default();

        assert!(resolve_pending(&mut maps, "/whatever").is_empty());
    }

    #[test]
    fn republish_scrubs_parked_entries() {
        let mut maps = AssociationMaps::default();
        let interface_map = InterfaceMap::new();
        association_changed(
            &mut maps,
            &interface_map,
            "/source",
            OWNER,
            vec![("fwd".to_string(), "rev".to_string(), "/late".to_string())],
        );

        association_changed(&mut maps, &interface_map, "/source", OWNER, vec![]);

        assert!(maps.pending.is_empty());
        assert!(resolve_pending(&mut maps, "/late").is_empty());
    }

    #[test]
    fn reconciliation_is_idempotent_after_purge() {
        let endpoint = "/xyz/openbmc_project/inventory/system/chassis";
        let interface_map = map_with(&[endpoint]);
        let associations = vec![(
            "inventory".to_string(),
            "error".to_string(),
            endpoint.to_string(),
        )];

        let mut direct = default_owner_maps();
        association_changed(
            &mut direct,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            associations.clone(),
        );

        let mut purged = default_owner_maps();
        purge_owner(&mut purged, SOURCE_PATH, OWNER);
        association_changed(
            &mut purged,
            &interface_map,
            SOURCE_PATH,
            OWNER,
            associations,
        );

        assert_eq!(direct.owners, purged.owners);
        assert_eq!(
            direct.ifaces.keys().collect::<Vec<_>>(),
            purged.ifaces.keys().collect::<Vec<_>>()
        );
        for (path, list) in &direct.ifaces {
            assert_eq!(list.snapshot(), purged.ifaces[path].snapshot());
        }
    }
}
