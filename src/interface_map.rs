use std::collections::{BTreeMap, BTreeSet};

/// Interfaces implemented by one object on one connection.
pub type InterfaceNames = BTreeSet<String>;

/// The services hosting one object path, with their interfaces.
pub type ConnectionNames = BTreeMap<String, InterfaceNames>;

/// The primary index: object path → service name → interface names.
///
/// The ordered outer map is load-bearing: ancestor and subtree queries walk
/// it in lexicographic path order.
pub type InterfaceMap = BTreeMap<String, ConnectionNames>;

/// Standard interfaces every object carries; indexing them would only bloat
/// the map.
pub const IGNORED_INTERFACES: [&str; 3] = [
    "org.freedesktop.DBus.Introspectable",
    "org.freedesktop.DBus.Peer",
    "org.freedesktop.DBus.Properties",
];

/// Records `interfaces` for `(path, service)`, skipping the ignored set.
///
/// Returns `true` when `path` was not in the map before the call, i.e. the
/// path just came into existence (pending associations key off of this).
pub fn insert_interfaces(
    map: &mut InterfaceMap,
    path: &str,
    service: &str,
    interfaces: impl IntoIterator<Item = String>,
) -> bool {
    let mut interfaces = interfaces
        .into_iter()
        .filter(|name| !IGNORED_INTERFACES.contains(&name.as_str()))
        .peekable();
    if interfaces.peek().is_none() {
        return false;
    }

    let newly_seen = !map.contains_key(path);
    map.entry(path.to_string())
        .or_default()
        .entry(service.to_string())
        .or_default()
        .extend(interfaces);

    newly_seen
}
