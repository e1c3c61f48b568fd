//! Configuration for the channel dispatcher.

use serde::Deserialize;
use switchboard_bus::{InvalidNameError, ObjectPath, WellKnownName};

/// The reserved well-known-name prefix shared by all clients.
const DEFAULT_CLIENT_PREFIX: &str = "org.switchboard.Client.";

/// Where dispatch operations are exported on the bus, by default.
const DEFAULT_OPERATION_BASE: &str = "/org/switchboard/dispatcher/operation";

/// Dispatcher configuration.
///
/// This type is immutable once constructed; deserialize it from the daemon
/// configuration, or use [`DispatchConfig::default`].
#[derive(Debug, Clone, Eq, PartialEq, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct DispatchConfig {
    /// The reserved namespace prefix for client well-known names.
    ///
    /// Handler names passed to `HandleWith` must carry this prefix; the
    /// dispatcher strips it before recording the choice.
    pub(crate) client_prefix: String,

    /// The object path under which dispatch operations are exported.
    pub(crate) operation_base: ObjectPath,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        DispatchConfig {
            client_prefix: DEFAULT_CLIENT_PREFIX.to_owned(),
            operation_base: ObjectPath::new(DEFAULT_OPERATION_BASE)
                .expect("default operation base invalid"),
        }
    }
}

impl DispatchConfig {
    /// Return the reserved client name prefix.
    pub fn client_prefix(&self) -> &str {
        &self.client_prefix
    }

    /// Return the object path under which operations are exported.
    pub fn operation_base(&self) -> &ObjectPath {
        &self.operation_base
    }

    /// Expand a prefix-stripped client name back into a well-known name.
    pub(crate) fn client_name(&self, short: &str) -> Result<WellKnownName, InvalidNameError> {
        WellKnownName::new(format!("{}{}", self.client_prefix, short))
    }

    /// Strip the client prefix from `name`, if it carries one.
    pub(crate) fn strip_client_prefix<'a>(&self, name: &'a str) -> Option<&'a str> {
        name.strip_prefix(&self.client_prefix)
    }
}
