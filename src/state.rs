use std::sync::Arc;

use parking_lot::RwLock;

use crate::{associations::AssociationMaps, interface_map::InterfaceMap, owners::OwnerTable};

/// Everything the mapper knows, as one composite value.
///
/// Initialized empty, rebuilt from scratch on every startup. Writers are the
/// dispatch loop and introspection replies; readers are the query handlers.
/// Critical sections never hold the lock across an await.
#[derive(Debug, Default)]
pub struct MapperState {
    pub interface_map: InterfaceMap,
    pub owners: OwnerTable,
    pub associations: AssociationMaps,
}

pub type SharedState = Arc<RwLock<MapperState>>;

pub fn shared() -> SharedState {
    Arc::new(RwLock::new(MapperState::default()))
}
