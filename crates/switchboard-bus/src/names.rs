//! Validated identifier newtypes for the message bus.
//!
//! Three kinds of identifier appear on the bus: *object paths* (slash
//! separated, like `/org/switchboard/dispatcher/operation/do7`), *well-known
//! names* (reverse-domain, like `org.switchboard.Client.Logger`), and
//! *unique names* (colon-prefixed, assigned by the bus itself, like
//! `:1.42`).  All three are validated at construction so that the rest of
//! the code can pass them around without re-checking.

use std::fmt;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

/// The longest bus name we will accept, in bytes.
///
/// This matches the limit conventionally enforced by bus implementations.
const MAX_NAME_LEN: usize = 255;

/// An error from trying to construct one of the bus identifier types.
#[derive(Debug, Clone, Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum InvalidNameError {
    /// An object path did not begin with `/`.
    #[error("object path does not begin with '/': {0:?}")]
    NoLeadingSlash(String),
    /// An object path had an empty element, a trailing slash, or an element
    /// with a forbidden character.
    #[error("object path has an empty or malformed element: {0:?}")]
    BadPathElement(String),
    /// A bus name was empty or longer than the permitted maximum.
    #[error("bus name is empty or too long")]
    BadLength,
    /// A well-known name had fewer than two dot-separated elements.
    #[error("well-known bus name needs at least two elements: {0:?}")]
    TooFewElements(String),
    /// A bus name had an empty element, or an element with a forbidden
    /// character, or an element starting with a digit.
    #[error("bus name has an empty or malformed element: {0:?}")]
    BadNameElement(String),
    /// A unique name did not begin with `:`.
    #[error("unique bus name does not begin with ':': {0:?}")]
    NoLeadingColon(String),
}

/// The path at which an object is exported on the bus.
///
/// Paths are `/`-rooted sequences of elements made of ASCII alphanumerics
/// and `_`.  The root path `"/"` is valid, and is used throughout the bus
/// surface as the conventional "no such object" value: see
/// [`ObjectPath::root`].
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct ObjectPath(String);

impl ObjectPath {
    /// Validate `path` and wrap it as an `ObjectPath`.
    pub fn new(path: impl Into<String>) -> Result<Self, InvalidNameError> {
        let path = path.into();
        let Some(rest) = path.strip_prefix('/') else {
            return Err(InvalidNameError::NoLeadingSlash(path));
        };
        if !rest.is_empty() {
            let ok = rest.split('/').all(|elt| {
                !elt.is_empty() && elt.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
            });
            if !ok {
                return Err(InvalidNameError::BadPathElement(path));
            }
        }
        Ok(ObjectPath(path))
    }

    /// Return the root path, `"/"`.
    ///
    /// By convention this stands in for an absent object reference: a
    /// dispatch operation with no known account reports its account path
    /// as the root path.
    pub fn root() -> Self {
        ObjectPath("/".to_owned())
    }

    /// Return true if this is the root path.
    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Return this path as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the path formed by appending the element `element` to this
    /// path.
    pub fn child(&self, element: &str) -> Result<Self, InvalidNameError> {
        if self.is_root() {
            ObjectPath::new(format!("/{}", element))
        } else {
            ObjectPath::new(format!("{}/{}", self.0, element))
        }
    }

    /// Return the final element of this path, or `""` for the root path.
    pub fn last_element(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or("")
    }
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectPath {
    type Err = InvalidNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ObjectPath::new(s)
    }
}

impl AsRef<str> for ObjectPath {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Check one element of a dotted bus name.
///
/// `digit_ok` controls whether the element may begin with an ASCII digit:
/// permitted in unique names, forbidden in well-known names.
fn name_element_ok(elt: &str, digit_ok: bool) -> bool {
    let mut bytes = elt.bytes();
    let Some(first) = bytes.next() else {
        return false;
    };
    let first_ok = first.is_ascii_alphabetic()
        || first == b'_'
        || first == b'-'
        || (digit_ok && first.is_ascii_digit());
    first_ok
        && elt
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// A well-known (reverse-domain) name on the bus.
///
/// Clients own well-known names like `org.switchboard.Client.Logger`; the
/// dispatcher addresses observers, approvers, and handlers by these.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct WellKnownName(String);

impl WellKnownName {
    /// Validate `name` and wrap it as a `WellKnownName`.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(InvalidNameError::BadLength);
        }
        if name.starts_with(':') {
            return Err(InvalidNameError::BadNameElement(name));
        }
        if name.split('.').count() < 2 {
            return Err(InvalidNameError::TooFewElements(name));
        }
        if !name.split('.').all(|elt| name_element_ok(elt, false)) {
            return Err(InvalidNameError::BadNameElement(name));
        }
        Ok(WellKnownName(name))
    }

    /// Return this name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WellKnownName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for WellKnownName {
    type Err = InvalidNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        WellKnownName::new(s)
    }
}

impl AsRef<str> for WellKnownName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// A unique connection name assigned by the bus, like `:1.42`.
///
/// Unlike well-known names these are never reused within one bus lifetime,
/// which is what makes them suitable for recording which live endpoint is
/// handling a channel.
#[derive(
    Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, DeserializeFromStr, SerializeDisplay,
)]
pub struct UniqueName(String);

impl UniqueName {
    /// Validate `name` and wrap it as a `UniqueName`.
    pub fn new(name: impl Into<String>) -> Result<Self, InvalidNameError> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(InvalidNameError::BadLength);
        }
        let Some(rest) = name.strip_prefix(':') else {
            return Err(InvalidNameError::NoLeadingColon(name));
        };
        if rest.split('.').count() < 2 {
            return Err(InvalidNameError::TooFewElements(name));
        }
        if !rest.split('.').all(|elt| name_element_ok(elt, true)) {
            return Err(InvalidNameError::BadNameElement(name));
        }
        Ok(UniqueName(name))
    }

    /// Return this name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UniqueName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for UniqueName {
    type Err = InvalidNameError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        UniqueName::new(s)
    }
}

impl AsRef<str> for UniqueName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}
