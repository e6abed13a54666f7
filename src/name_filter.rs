use std::collections::HashSet;

/// Decides which bus connections get indexed.
///
/// A service is indexed iff some allowlist entry is a prefix of its name and
/// the full name is not on the denylist. The mapper's own name is always
/// denied. This is consulted on every signal, so both checks are cheap.
#[derive(Clone, Debug)]
pub struct NameFilter {
    allowed_prefixes: Vec<String>,
    denied_names: HashSet<String>,
}

impl NameFilter {
    /// Service namespaces indexed when none are given on the command line.
    pub const DEFAULT_PREFIXES: [&'static str; 3] =
        ["xyz.openbmc_project.", "org.openbmc.", "com.intel."];

    pub fn new(
        prefixes: impl IntoIterator<Item = String>,
        denied: impl IntoIterator<Item = String>,
    ) -> Self {
        let mut denied_names: HashSet<String> = denied.into_iter().collect();
        denied_names.insert(crate::WELL_KNOWN_NAME.to_string());

        Self {
            allowed_prefixes: prefixes.into_iter().collect(),
            denied_names,
        }
    }

    /// Whether `name` belongs to a service whose object tree we track.
    pub fn should_index(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with(':') || self.denied_names.contains(name) {
            return false;
        }

        self.allowed_prefixes
            .iter()
            .any(|prefix| name.starts_with(prefix.as_str()))
    }
}

impl Default for NameFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_PREFIXES.map(String::from), [])
    }
}
