//! The introspection engine.
//!
//! For every newly seen service the engine walks its object tree from `/`,
//! one `Introspect` call per path, records the interfaces of each object and
//! recurses into the children. Any error along a branch (bus error, bad XML)
//! abandons that branch only.
//!
//! Outstanding work is tracked with reference-counted scan tokens: the last
//! branch of a service dropping its token logs the per-service duration and
//! emits the private `IntrospectionComplete` signal; during the initial scan
//! every service token additionally holds the global stopwatch alive, so its
//! drop marks the end of the whole scan.

use std::{sync::Arc, time::Instant};

use serde::Deserialize;
use tracing::{debug, info, warn};
use zbus::{fdo::IntrospectableProxy, proxy, Connection};

use crate::{
    associations::{self, Association, ASSOCIATIONS_INTERFACE},
    interface_map, mapper,
    state::SharedState,
};

#[proxy(interface = "org.openbmc.Associations", assume_defaults = false)]
trait Associations {
    #[zbus(property, name = "associations")]
    fn associations(&self) -> zbus::Result<Vec<Association>>;
}

/// The subset of the introspection document the mapper cares about: the
/// interfaces of this object and the names of its children. Everything else
/// is ignored.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct IntrospectNode {
    #[serde(rename = "interface", default)]
    interfaces: Vec<InterfaceElement>,
    #[serde(rename = "node", default)]
    children: Vec<ChildNode>,
}

#[derive(Debug, Deserialize)]
struct InterfaceElement {
    #[serde(rename = "@name")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChildNode {
    #[serde(rename = "@name")]
    name: Option<String>,
}

impl IntrospectNode {
    fn parse(xml: &str) -> Result<Self, quick_xml::DeError> {
        quick_xml::de::from_str(xml)
    }

    fn interface_names(&self) -> impl Iterator<Item = &str> {
        self.interfaces
            .iter()
            .filter_map(|interface| interface.name.as_deref())
    }

    fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children
            .iter()
            .filter_map(|child| child.name.as_deref())
    }
}

/// Times the initial scan across all services; dropped by the last service
/// token.
#[derive(Debug)]
pub(crate) struct ScanStopwatch {
    started: Instant,
}

impl ScanStopwatch {
    pub(crate) fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Drop for ScanStopwatch {
    fn drop(&mut self) {
        info!("initial scan finished in {:?}", self.started.elapsed());
    }
}

/// Tracks the outstanding branches of one service's tree walk.
struct ServiceScan {
    conn: Connection,
    service: String,
    started: Instant,
    // Keeps the global stopwatch alive until the last initial-scan service
    // finishes. `None` for incremental scans.
    _global: Option<Arc<ScanStopwatch>>,
}

impl Drop for ServiceScan {
    fn drop(&mut self) {
        info!(
            service = %self.service,
            "introspection finished in {:?}",
            self.started.elapsed(),
        );

        let conn = self.conn.clone();
        let service = std::mem::take(&mut self.service);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = conn
                    .emit_signal(
                        None::<zbus::names::BusName<'_>>,
                        crate::MAPPER_PATH,
                        mapper::PRIVATE_INTERFACE,
                        "IntrospectionComplete",
                        &service,
                    )
                    .await
                {
                    warn!("failed to emit `IntrospectionComplete`: {e}");
                }
            });
        }
    }
}

/// Kicks off a full tree walk of `service`, starting at the root.
pub(crate) fn start(
    conn: &Connection,
    state: SharedState,
    service: String,
    global: Option<Arc<ScanStopwatch>>,
) {
    debug!(service = %service, "starting introspection");

    let scan = Arc::new(ServiceScan {
        conn: conn.clone(),
        service,
        started: Instant::now(),
        _global: global,
    });

    spawn_walk(conn.clone(), state, scan, "/".to_string());
}

// Indirection so the recursion happens through a plain fn; `walk` awaiting
// its own future would make the future type self-referential.
fn spawn_walk(conn: Connection, state: SharedState, scan: Arc<ServiceScan>, path: String) {
    tokio::spawn(walk(conn, state, scan, path));
}

async fn walk(conn: Connection, state: SharedState, scan: Arc<ServiceScan>, path: String) {
    let xml = match introspect(&conn, &scan.service, &path).await {
        Ok(xml) => xml,
        Err(e) => {
            warn!(
                service = %scan.service,
                path = %path,
                "introspect call failed: {e}",
            );
            return;
        }
    };

    let node = match IntrospectNode::parse(&xml) {
        Ok(node) => node,
        Err(e) => {
            warn!(service = %scan.service, path = %path, "bad introspection XML: {e}");
            return;
        }
    };

    let has_associations = node
        .interface_names()
        .any(|name| name == ASSOCIATIONS_INTERFACE);

    let updates = {
        let mut st = state.write();
        // The service may have vanished while the call was in flight.
        if !st.owners.is_tracked(&scan.service) {
            debug!(service = %scan.service, "dropping stale introspection reply");
            return;
        }

        let newly_seen = interface_map::insert_interfaces(
            &mut st.interface_map,
            &path,
            &scan.service,
            node.interface_names().map(ToString::to_string),
        );

        if newly_seen {
            associations::resolve_pending(&mut st.associations, &path)
        } else {
            Vec::new()
        }
    };
    mapper::apply_endpoint_updates(&conn, &state, updates).await;

    if has_associations {
        fetch_associations(&conn, &state, &scan.service, &path).await;
    }

    for child in node.child_names() {
        let child_path = if path == "/" {
            format!("/{child}")
        } else {
            format!("{path}/{child}")
        };
        spawn_walk(conn.clone(), state.clone(), scan.clone(), child_path);
    }
}

async fn introspect(conn: &Connection, service: &str, path: &str) -> zbus::Result<String> {
    IntrospectableProxy::builder(conn)
        .destination(service.to_string())?
        .path(path.to_string())?
        .build()
        .await?
        .introspect()
        .await
        .map_err(Into::into)
}

/// Reads the `associations` property of `(service, path)` and feeds it to
/// the association engine, as if it had arrived by signal.
async fn fetch_associations(conn: &Connection, state: &SharedState, service: &str, path: &str) {
    let associations = async {
        AssociationsProxy::builder(conn)
            .destination(service.to_string())?
            .path(path.to_string())?
            .cache_properties(zbus::proxy::CacheProperties::No)
            .build()
            .await?
            .associations()
            .await
    }
    .await;

    let associations = match associations {
        Ok(associations) => associations,
        Err(e) => {
            warn!(service = %service, path = %path, "reading `associations` failed: {e}");
            return;
        }
    };

    let updates = {
        let mut st = state.write();
        if !st.owners.is_tracked(service) {
            return;
        }
        let crate::state::MapperState {
            interface_map,
            associations: assoc_maps,
            ..
        } = &mut *st;
        associations::association_changed(assoc_maps, interface_map, path, service, associations)
    };
    mapper::apply_endpoint_updates(conn, state, updates).await;
}
