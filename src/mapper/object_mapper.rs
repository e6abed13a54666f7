use std::collections::HashMap;

use zbus::{interface, zvariant::OwnedObjectPath, DBusError};

use crate::{
    handler,
    interface_map::ConnectionNames,
    state::SharedState,
};

/// Errors surfaced to bus callers.
#[derive(DBusError, Debug)]
#[zbus(prefix = "xyz.openbmc_project.Common.Error")]
pub enum Error {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// The requested path is absent (or nothing at it matches the filter).
    ResourceNotFound(String),
}

impl From<handler::NotFound> for Error {
    fn from(err: handler::NotFound) -> Self {
        Self::ResourceNotFound(err.to_string())
    }
}

/// Service → interfaces, as it goes out on the wire.
type ConnectionMap = HashMap<String, Vec<String>>;

/// One (path, services) result entry.
type ObjectEntry = (OwnedObjectPath, ConnectionMap);

/// The `xyz.openbmc_project.ObjectMapper` interface: structural queries over
/// the current snapshot of the maps.
pub struct ObjectMapper {
    state: SharedState,
}

impl ObjectMapper {
    pub fn new(state: SharedState) -> Self {
        Self { state }
    }
}

#[interface(name = "xyz.openbmc_project.ObjectMapper")]
impl ObjectMapper {
    /// Returns the services hosting `path`, each with the interfaces it
    /// implements there.
    async fn get_object(
        &self,
        path: String,
        interfaces: Vec<String>,
    ) -> Result<ConnectionMap, Error> {
        let state = self.state.read();
        let connections = handler::get_object(&state.interface_map, &path, interfaces)?;

        Ok(to_wire_connections(connections))
    }

    /// Returns every ancestor of `path`, restricted to services matching the
    /// interface filter.
    async fn get_ancestors(
        &self,
        path: String,
        interfaces: Vec<String>,
    ) -> Result<Vec<ObjectEntry>, Error> {
        let state = self.state.read();
        let ancestors = handler::get_ancestors(&state.interface_map, &path, interfaces)?;

        Ok(to_wire_object_map(ancestors))
    }

    /// Returns the objects below `subtree`, `depth` levels deep (0 means
    /// unbounded), restricted to services matching the interface filter.
    async fn get_sub_tree(
        &self,
        subtree: String,
        depth: i32,
        interfaces: Vec<String>,
    ) -> Result<Vec<ObjectEntry>, Error> {
        let state = self.state.read();
        let objects = handler::get_sub_tree(&state.interface_map, &subtree, depth, interfaces)?;

        Ok(to_wire_object_map(objects))
    }

    /// Like `GetSubTree`, but returns only the object paths.
    async fn get_sub_tree_paths(
        &self,
        subtree: String,
        depth: i32,
        interfaces: Vec<String>,
    ) -> Result<Vec<OwnedObjectPath>, Error> {
        let state = self.state.read();
        let paths =
            handler::get_sub_tree_paths(&state.interface_map, &subtree, depth, interfaces)?;

        Ok(to_wire_paths(paths))
    }

    /// `GetSubTree` restricted to the endpoints of the association object at
    /// `association_path`.
    async fn get_associated_sub_tree(
        &self,
        association_path: String,
        subtree: String,
        depth: i32,
        interfaces: Vec<String>,
    ) -> Result<Vec<ObjectEntry>, Error> {
        let state = self.state.read();
        let objects = handler::get_associated_sub_tree(
            &state.interface_map,
            &state.associations,
            &association_path,
            &subtree,
            depth,
            interfaces,
        )?;

        Ok(to_wire_object_map(objects))
    }

    /// `GetSubTreePaths` restricted to the endpoints of the association
    /// object at `association_path`.
    async fn get_associated_sub_tree_paths(
        &self,
        association_path: String,
        subtree: String,
        depth: i32,
        interfaces: Vec<String>,
    ) -> Result<Vec<OwnedObjectPath>, Error> {
        let state = self.state.read();
        let paths = handler::get_associated_sub_tree_paths(
            &state.interface_map,
            &state.associations,
            &association_path,
            &subtree,
            depth,
            interfaces,
        )?;

        Ok(to_wire_paths(paths))
    }
}

fn to_wire_connections(connections: ConnectionNames) -> ConnectionMap {
    connections
        .into_iter()
        .map(|(connection, names)| (connection, names.into_iter().collect()))
        .collect()
}

fn to_wire_object_map(entries: handler::ObjectMap) -> Vec<ObjectEntry> {
    entries
        .into_iter()
        .filter_map(|(path, connections)| {
            let path = OwnedObjectPath::try_from(path).ok()?;
            Some((path, to_wire_connections(connections)))
        })
        .collect()
}

fn to_wire_paths(paths: Vec<String>) -> Vec<OwnedObjectPath> {
    paths
        .into_iter()
        .filter_map(|path| OwnedObjectPath::try_from(path).ok())
        .collect()
}
