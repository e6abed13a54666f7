//! The bus-facing mapper service.
//!
//! Owns the connection, serves the query interface, and runs the dispatch
//! loop: one task `select!`ing over the signal streams, applying each event
//! to the shared state in a non-awaiting critical section and carrying out
//! the resulting object-server work afterwards.

mod object_mapper;

pub use object_mapper::ObjectMapper;

use std::{collections::HashMap, sync::Arc};

use anyhow::Result;
use futures_util::stream::StreamExt;
use tokio::select;
use tracing::{debug, info, warn};
use zbus::{
    fdo::{DBusProxy, NameOwnerChanged},
    names::BusName,
    proxy::CacheProperties,
    zvariant::{Array, OwnedObjectPath, OwnedValue, Structure, Value},
    Connection, MatchRule, Message, MessageStream,
};

use crate::{
    associations::{
        Association, AssociationEndpoints, EndpointsUpdate, ASSOCIATIONS_INTERFACE,
    },
    events, introspect,
    name_filter::NameFilter,
    state::{self, SharedState},
};

/// Interface of the `IntrospectionComplete` signal.
pub const PRIVATE_INTERFACE: &str = "xyz.openbmc_project.ObjectMapper.Private";

/// Per-stream signal queue depth; slow moments must not drop signals.
const SIGNAL_QUEUE_DEPTH: usize = 64;

/// The mapper service.
#[derive(Debug)]
pub struct Mapper {
    conn: Connection,
    state: SharedState,
    filter: NameFilter,
}

impl Mapper {
    /// Connects to the bus, claims the mapper name, and serves the query
    /// interface.
    pub async fn new(session: bool, filter: NameFilter) -> Result<Self> {
        let state = state::shared();

        let builder = if session {
            zbus::connection::Builder::session()?
        } else {
            zbus::connection::Builder::system()?
        };
        let conn = builder
            .serve_at(crate::MAPPER_PATH, ObjectMapper::new(state.clone()))?
            .name(crate::WELL_KNOWN_NAME)?
            .build()
            .await?;
        info!("Claimed `{}` on the bus.", crate::WELL_KNOWN_NAME);

        Ok(Self {
            conn,
            state,
            filter,
        })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Subscribes the signal streams, seeds the index with an initial scan
    /// of every existing service, and dispatches events until the
    /// connection goes away.
    pub async fn run(&mut self) -> Result<()> {
        let dbus_proxy = DBusProxy::builder(&self.conn)
            .cache_properties(CacheProperties::No)
            .build()
            .await?;

        let mut name_owner_changed = dbus_proxy.receive_name_owner_changed().await?;
        let mut interfaces_added = self
            .signal_stream("org.freedesktop.DBus.ObjectManager", "InterfacesAdded", None)
            .await?;
        let mut interfaces_removed = self
            .signal_stream(
                "org.freedesktop.DBus.ObjectManager",
                "InterfacesRemoved",
                None,
            )
            .await?;
        // Associations asserted after a service was introspected arrive as
        // plain property changes.
        let mut associations_changed = self
            .signal_stream(
                "org.freedesktop.DBus.Properties",
                "PropertiesChanged",
                Some(ASSOCIATIONS_INTERFACE),
            )
            .await?;

        self.initial_scan(&dbus_proxy).await?;

        loop {
            select! {
                Some(signal) = name_owner_changed.next() => {
                    self.on_name_owner_changed(signal).await;
                }
                Some(msg) = interfaces_added.next() => match msg {
                    Ok(msg) => self.on_interfaces_added(&msg).await,
                    Err(e) => warn!("error on `InterfacesAdded` stream: {e}"),
                },
                Some(msg) = interfaces_removed.next() => match msg {
                    Ok(msg) => self.on_interfaces_removed(&msg).await,
                    Err(e) => warn!("error on `InterfacesRemoved` stream: {e}"),
                },
                Some(msg) = associations_changed.next() => match msg {
                    Ok(msg) => self.on_associations_changed(&msg).await,
                    Err(e) => warn!("error on `PropertiesChanged` stream: {e}"),
                },
                else => break,
            }
        }

        Ok(())
    }

    async fn signal_stream(
        &self,
        interface: &str,
        member: &str,
        arg0: Option<&str>,
    ) -> Result<MessageStream> {
        let mut builder = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(interface)?
            .member(member)?;
        if let Some(arg0) = arg0 {
            builder = builder.arg(0, arg0)?;
        }

        MessageStream::for_match_rule(builder.build(), &self.conn, Some(SIGNAL_QUEUE_DEPTH))
            .await
            .map_err(Into::into)
    }

    /// Lists every name on the bus and walks each service that passes the
    /// filter. Sorted for a consistent startup order.
    async fn initial_scan(&self, dbus_proxy: &DBusProxy<'static>) -> Result<()> {
        let mut names: Vec<String> = dbus_proxy
            .list_names()
            .await?
            .into_iter()
            .map(|name| name.to_string())
            .collect();
        names.sort();
        info!("`ListNames` returned {} entries.", names.len());

        let stopwatch = Arc::new(introspect::ScanStopwatch::new());
        for name in names {
            if !self.filter.should_index(&name) {
                continue;
            }

            let Ok(bus_name) = BusName::try_from(name.clone()) else {
                continue;
            };
            let proxy = dbus_proxy.clone();
            let conn = self.conn.clone();
            let state = self.state.clone();
            let stopwatch = stopwatch.clone();
            tokio::spawn(async move {
                // Resolve the owner before walking so in-flight replies can
                // tell whether the service is still around.
                match proxy.get_name_owner(bus_name).await {
                    Ok(owner) => {
                        state.write().owners.remember(owner.as_str(), name.as_str());
                        introspect::start(&conn, state, name, Some(stopwatch));
                    }
                    Err(e) => warn!(service = %name, "`GetNameOwner` failed: {e}"),
                }
            });
        }

        Ok(())
    }

    async fn on_name_owner_changed(&self, signal: NameOwnerChanged) {
        let args = match signal.args() {
            Ok(args) => args,
            Err(e) => {
                warn!("bad `NameOwnerChanged` signal: {e}");
                return;
            }
        };
        let name = args.name().to_string();
        let old_owner = args.old_owner().as_ref().map(ToString::to_string);
        let new_owner = args.new_owner().as_ref().map(ToString::to_string);

        if let Some(old_owner) = old_owner {
            debug!(service = %name, owner = %old_owner, "connection removed");
            let updates = {
                let mut st = self.state.write();
                events::process_name_change_delete(&mut st, &name, &old_owner)
            };
            apply_endpoint_updates(&self.conn, &self.state, updates).await;
        }

        if let Some(new_owner) = new_owner {
            if self.filter.should_index(&name) {
                self.state.write().owners.remember(new_owner, name.as_str());
                introspect::start(&self.conn, self.state.clone(), name, None);
            }
        }
    }

    async fn on_interfaces_added(&self, msg: &Message) {
        let header = msg.header();
        let Some(sender) = header.sender() else {
            return;
        };
        let (path, payload): (OwnedObjectPath, HashMap<String, HashMap<String, OwnedValue>>) =
            match msg.body().deserialize() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("bad `InterfacesAdded` payload: {e}");
                    return;
                }
            };

        let Some(well_known) = self.resolve_sender(sender.as_str()) else {
            return;
        };
        if !self.filter.should_index(&well_known) {
            return;
        }

        let associations = payload
            .get(ASSOCIATIONS_INTERFACE)
            .and_then(|properties| properties.get("associations"))
            .and_then(parse_associations);

        let updates = {
            let mut st = self.state.write();
            events::process_interfaces_added(
                &mut st,
                path.as_str(),
                &well_known,
                payload.keys().cloned(),
                associations,
            )
        };
        apply_endpoint_updates(&self.conn, &self.state, updates).await;
    }

    async fn on_interfaces_removed(&self, msg: &Message) {
        let header = msg.header();
        let Some(sender) = header.sender() else {
            return;
        };
        let (path, interfaces): (OwnedObjectPath, Vec<String>) = match msg.body().deserialize() {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("bad `InterfacesRemoved` payload: {e}");
                return;
            }
        };

        let Some(well_known) = self.resolve_sender(sender.as_str()) else {
            return;
        };

        let updates = {
            let mut st = self.state.write();
            events::process_interfaces_removed(&mut st, path.as_str(), &well_known, &interfaces)
        };
        apply_endpoint_updates(&self.conn, &self.state, updates).await;
    }

    async fn on_associations_changed(&self, msg: &Message) {
        let header = msg.header();
        let Some(sender) = header.sender() else {
            return;
        };
        let Some(source_path) = header.path().map(ToString::to_string) else {
            return;
        };
        let (interface, changed, _invalidated): (String, HashMap<String, OwnedValue>, Vec<String>) =
            match msg.body().deserialize() {
                Ok(decoded) => decoded,
                Err(e) => {
                    warn!("bad `PropertiesChanged` payload: {e}");
                    return;
                }
            };
        if interface != ASSOCIATIONS_INTERFACE {
            return;
        }

        let Some(well_known) = self.resolve_sender(sender.as_str()) else {
            return;
        };
        if !self.filter.should_index(&well_known) {
            return;
        }

        let Some(associations) = changed.get("associations").and_then(parse_associations) else {
            return;
        };

        let updates = {
            let mut st = self.state.write();
            let state::MapperState {
                interface_map,
                associations: assoc_maps,
                ..
            } = &mut *st;
            crate::associations::association_changed(
                assoc_maps,
                interface_map,
                &source_path,
                &well_known,
                associations,
            )
        };
        apply_endpoint_updates(&self.conn, &self.state, updates).await;
    }

    /// Resolves a signal's sender to a well-known name; untracked senders
    /// cause the signal to be dropped.
    fn resolve_sender(&self, sender: &str) -> Option<String> {
        self.state
            .read()
            .owners
            .well_known(sender)
            .map(ToString::to_string)
    }
}

/// Decodes an `a(sss)` associations property value.
fn parse_associations(value: &OwnedValue) -> Option<Vec<Association>> {
    let array: &Array = value.downcast_ref().ok()?;

    let mut associations = Vec::with_capacity(array.len());
    for entry in array.iter() {
        let entry: &Structure = entry.downcast_ref().ok()?;
        match entry.fields() {
            [Value::Str(forward), Value::Str(reverse), Value::Str(endpoint)] => associations
                .push((forward.to_string(), reverse.to_string(), endpoint.to_string())),
            _ => return None,
        }
    }

    Some(associations)
}

/// Carries out the object-server side of association reconciliation:
/// exporting, re-publishing, or retiring derived endpoint objects.
///
/// Runs after the state lock is dropped; the map entry is the source of
/// truth, so a failure here only delays the bus-visible view.
pub(crate) async fn apply_endpoint_updates(
    conn: &Connection,
    state: &SharedState,
    updates: Vec<EndpointsUpdate>,
) {
    let server = conn.object_server();

    for update in updates {
        match update {
            EndpointsUpdate::Publish(path) => {
                let Some(endpoints) = state.read().associations.ifaces.get(&path).cloned() else {
                    continue;
                };

                match server
                    .interface::<_, AssociationEndpoints>(path.as_str())
                    .await
                {
                    Ok(iface_ref) => {
                        let res = iface_ref
                            .get()
                            .await
                            .endpoints_changed(iface_ref.signal_emitter())
                            .await;
                        if let Err(e) = res {
                            warn!(path = %path, "failed to publish `endpoints`: {e}");
                        }
                    }
                    Err(_) => {
                        let endpoints = AssociationEndpoints::new(endpoints);
                        if let Err(e) = server.at(path.as_str(), endpoints).await {
                            warn!(path = %path, "failed to export association object: {e}");
                        }
                    }
                }
            }
            EndpointsUpdate::Retire(path) => {
                if let Err(e) = server
                    .remove::<AssociationEndpoints, _>(path.as_str())
                    .await
                {
                    warn!(path = %path, "failed to retire association object: {e}");
                }
            }
        }
    }
}
