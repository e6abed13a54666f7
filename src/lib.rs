//! A D-Bus object path mapper.
//!
//! `mapperd` maintains a live index of every allowlisted bus service's object
//! tree (object path → service → interfaces), mirrors the services'
//! `associations` properties into bus-visible association endpoint objects,
//! and answers structural queries (`GetObject`, `GetAncestors`, `GetSubTree`,
//! ...) on `xyz.openbmc_project.ObjectMapper`.

pub mod associations;
pub mod events;
pub mod handler;
pub mod interface_map;
pub mod introspect;
pub mod mapper;
pub mod name_filter;
pub mod owners;
pub mod state;
pub mod tracing_subscriber;

/// The well-known name the mapper claims on the bus.
pub const WELL_KNOWN_NAME: &str = "xyz.openbmc_project.ObjectMapper";

/// The object path the query interface is served at.
pub const MAPPER_PATH: &str = "/xyz/openbmc_project/object_mapper";
