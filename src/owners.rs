use std::collections::BTreeMap;

/// Tracks which well-known name each unique connection name stands for.
///
/// Signals identify their sender by unique name (`:1.42`); the interface map
/// is keyed by well-known name. Entries are added when a service is first
/// seen and dropped when its old owner vanishes.
#[derive(Clone, Debug, Default)]
pub struct OwnerTable(BTreeMap<String, String>);

impl OwnerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remember(&mut self, unique_name: impl Into<String>, well_known: impl Into<String>) {
        self.0.insert(unique_name.into(), well_known.into());
    }

    pub fn forget(&mut self, unique_name: &str) -> Option<String> {
        self.0.remove(unique_name)
    }

    /// Resolves `request` to a well-known name.
    ///
    /// A name that is already well-known resolves to itself; an untracked
    /// unique name resolves to nothing (its signals are dropped).
    pub fn well_known<'a>(&'a self, request: &'a str) -> Option<&'a str> {
        if !request.starts_with(':') {
            return Some(request);
        }

        self.0.get(request).map(String::as_str)
    }

    /// Whether `well_known` currently has a tracked owner.
    ///
    /// Introspection replies check this before touching the interface map so
    /// that an owner-lost cancels any in-flight scan for the service.
    pub fn is_tracked(&self, well_known: &str) -> bool {
        self.0.values().any(|name| name == well_known)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
