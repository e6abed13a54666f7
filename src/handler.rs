//! The query algorithms behind `xyz.openbmc_project.ObjectMapper`.
//!
//! Everything here is a pure function over the current maps. "Not found" is
//! an explicit result; the transport edge turns it into the bus error.

use std::collections::HashSet;

use thiserror::Error;

use crate::{
    associations::AssociationMaps,
    interface_map::{ConnectionNames, InterfaceMap, InterfaceNames},
};

/// The requested path is absent from the index (or nothing matches at it).
#[derive(Clone, Copy, Debug, Eq, Error, PartialEq)]
#[error("path or object not found")]
pub struct NotFound;

/// Query results: ordered (path, service → interfaces) pairs.
pub type ObjectMap = Vec<(String, ConnectionNames)>;

/// Returns the services hosting `path`, restricted to those implementing at
/// least one interface in `interfaces` (all of them, when the filter is
/// empty).
pub fn get_object(
    map: &InterfaceMap,
    path: &str,
    interfaces: Vec<String>,
) -> Result<ConnectionNames, NotFound> {
    let interfaces = sorted_filter(interfaces);
    let path = normalize_path(path);
    let connections = map.get(path).ok_or(NotFound)?;

    if interfaces.is_empty() {
        return Ok(connections.clone());
    }

    let results: ConnectionNames = connections
        .iter()
        .filter(|(_, names)| intersects(&interfaces, names))
        .map(|(connection, names)| (connection.clone(), names.clone()))
        .collect();

    if results.is_empty() {
        return Err(NotFound);
    }

    Ok(results)
}

/// Returns every stored strict ancestor of `req_path`, filtered by
/// `interfaces`.
///
/// The requested path itself must exist, except for the root/empty request.
pub fn get_ancestors(
    map: &InterfaceMap,
    req_path: &str,
    interfaces: Vec<String>,
) -> Result<ObjectMap, NotFound> {
    let interfaces = sorted_filter(interfaces);
    let req_path = strip_trailing_slash(req_path);

    if !req_path.is_empty() && !map.contains_key(req_path) {
        return Err(NotFound);
    }

    let mut results = ObjectMap::new();
    for (this_path, connections) in map {
        if this_path == req_path || !is_ancestor(this_path, req_path) {
            continue;
        }

        if interfaces.is_empty() {
            results.push((this_path.clone(), connections.clone()));
            continue;
        }

        for (connection, names) in connections {
            if intersects(&interfaces, names) {
                add_object_map_result(&mut results, this_path, connection, names);
            }
        }
    }

    Ok(results)
}

/// Returns every stored path at relative depth 1..=`depth` under `req_path`,
/// with the services matching `interfaces`. A depth of zero or less means
/// unbounded.
pub fn get_sub_tree(
    map: &InterfaceMap,
    req_path: &str,
    depth: i32,
    interfaces: Vec<String>,
) -> Result<ObjectMap, NotFound> {
    let interfaces = sorted_filter(interfaces);

    let mut results = ObjectMap::new();
    for_each_subtree_path(map, req_path, depth, |this_path, connections| {
        for (connection, names) in connections {
            if interfaces.is_empty() || intersects(&interfaces, names) {
                add_object_map_result(&mut results, this_path, connection, names);
            }
        }
    })?;

    Ok(results)
}

/// `get_sub_tree`, but returning only the matching paths.
pub fn get_sub_tree_paths(
    map: &InterfaceMap,
    req_path: &str,
    depth: i32,
    interfaces: Vec<String>,
) -> Result<Vec<String>, NotFound> {
    let interfaces = sorted_filter(interfaces);

    let mut results = Vec::new();
    for_each_subtree_path(map, req_path, depth, |this_path, connections| {
        let add = interfaces.is_empty()
            || connections
                .values()
                .any(|names| intersects(&interfaces, names));
        if add {
            results.push(this_path.to_string());
        }
    })?;

    Ok(results)
}

/// `get_sub_tree` restricted to the endpoints of the association object at
/// `association_path`.
///
/// An unknown association path yields an empty endpoint set (and thus an
/// empty result), not an error.
pub fn get_associated_sub_tree(
    map: &InterfaceMap,
    associations: &AssociationMaps,
    association_path: &str,
    req_path: &str,
    depth: i32,
    interfaces: Vec<String>,
) -> Result<ObjectMap, NotFound> {
    let endpoints = association_endpoints(associations, association_path);
    let mut subtree = get_sub_tree(map, req_path, depth, interfaces)?;
    subtree.retain(|(path, _)| endpoints.contains(path.as_str()));

    Ok(subtree)
}

/// `get_sub_tree_paths` restricted to the endpoints of the association object
/// at `association_path`.
pub fn get_associated_sub_tree_paths(
    map: &InterfaceMap,
    associations: &AssociationMaps,
    association_path: &str,
    req_path: &str,
    depth: i32,
    interfaces: Vec<String>,
) -> Result<Vec<String>, NotFound> {
    let endpoints = association_endpoints(associations, association_path);
    let mut paths = get_sub_tree_paths(map, req_path, depth, interfaces)?;
    paths.retain(|path| endpoints.contains(path.as_str()));

    Ok(paths)
}

/// Adds a (path, service, interfaces) triple to query results, merging into
/// an existing entry for the path if one is already present. A service
/// already recorded under the path keeps its first interface set.
fn add_object_map_result(
    results: &mut ObjectMap,
    path: &str,
    connection: &str,
    interfaces: &InterfaceNames,
) {
    match results.iter_mut().find(|(existing, _)| existing == path) {
        Some((_, connections)) => {
            connections
                .entry(connection.to_string())
                .or_insert_with(|| interfaces.clone());
        }
        None => {
            let mut connections = ConnectionNames::new();
            connections.insert(connection.to_string(), interfaces.clone());
            results.push((path.to_string(), connections));
        }
    }
}

/// Walks every stored path within `depth` levels under `req_path` in
/// lexicographic order.
fn for_each_subtree_path(
    map: &InterfaceMap,
    req_path: &str,
    depth: i32,
    mut visit: impl FnMut(&str, &ConnectionNames),
) -> Result<(), NotFound> {
    let depth = if depth <= 0 { i32::MAX } else { depth };

    // `stripped` has no trailing slash, `with_slash` always has one; prefix
    // matching on the latter keeps comparisons on segment boundaries.
    let stripped = strip_trailing_slash(req_path);
    let with_slash = format!("{stripped}/");

    if !stripped.is_empty() && !map.contains_key(stripped) {
        return Err(NotFound);
    }

    for (this_path, connections) in map {
        // The requested object is not part of its own subtree.
        if this_path == stripped || this_path == "/" {
            continue;
        }

        if !this_path.starts_with(&with_slash) {
            continue;
        }

        let this_depth = this_path[stripped.len()..]
            .bytes()
            .filter(|b| *b == b'/')
            .count() as i32;
        if this_depth <= depth {
            visit(this_path, connections);
        }
    }

    Ok(())
}

fn association_endpoints<'a>(
    associations: &'a AssociationMaps,
    association_path: &str,
) -> HashSet<String> {
    associations
        .ifaces
        .get(normalize_path(association_path))
        .map(|endpoints| endpoints.snapshot().into_iter().collect())
        .unwrap_or_default()
}

/// True when `ancestor` is a strict prefix of `path` on a segment boundary.
fn is_ancestor(ancestor: &str, path: &str) -> bool {
    if ancestor == "/" {
        return path.len() > 1;
    }

    path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/')
}

/// Drops a trailing slash; the root request maps to the empty string, which
/// the ancestor/subtree walks treat as "match everything".
fn strip_trailing_slash(path: &str) -> &str {
    path.strip_suffix('/').unwrap_or(path)
}

/// Trailing-slash normalization for exact-key lookups; leaves the root path
/// alone.
fn normalize_path(path: &str) -> &str {
    match path.strip_suffix('/') {
        Some(stripped) if !stripped.is_empty() => stripped,
        _ => path,
    }
}

/// The filter list must be sorted for the merge intersection.
fn sorted_filter(mut interfaces: Vec<String>) -> Vec<String> {
    interfaces.sort();
    interfaces
}

/// Sorted merge intersection test between the query filter and one object's
/// interface set.
fn intersects(sorted: &[String], names: &InterfaceNames) -> bool {
    let mut filter = sorted.iter();
    let mut names = names.iter();
    let (mut f, mut n) = (filter.next(), names.next());

    while let (Some(a), Some(b)) = (f, n) {
        match a.cmp(b) {
            std::cmp::Ordering::Less => f = filter.next(),
            std::cmp::Ordering::Greater => n = names.next(),
            std::cmp::Ordering::Equal => return true,
        }
    }

    false
}
