//! The variant value type used in property maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ObjectPath;

/// A map from property name to [`Value`].
///
/// Channel immutable properties and client `info` dictionaries are all
/// property maps.  `BTreeMap` keeps iteration deterministic, which the
/// tests (and log output) rely on.
pub type PropertyMap = BTreeMap<String, Value>;

/// One variant value, as found in a property map.
///
/// This is the subset of bus variant types that channel properties and
/// client filters actually use; anything more exotic stays with the wire
/// layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, derive_more::From)]
#[non_exhaustive]
#[serde(untagged)]
pub enum Value {
    /// A boolean.
    Bool(bool),
    /// A signed integer.
    Int(i64),
    /// An unsigned integer.
    UInt(u64),
    /// A string.
    Str(String),
    /// An object path.
    Path(ObjectPath),
    /// A list of strings.
    StrList(Vec<String>),
}

impl Value {
    /// Return true if `self` matches `other` for filtering purposes.
    ///
    /// Filters compare for equality, except that signed and unsigned
    /// integers match across representations when they denote the same
    /// number.  All other cross-type comparisons fail.
    pub fn matches(&self, other: &Value) -> bool {
        use Value::*;
        match (self, other) {
            (Int(a), UInt(b)) | (UInt(b), Int(a)) => {
                matches!(u64::try_from(*a), Ok(a) if a == *b)
            }
            (a, b) => a == b,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::Str(s.to_owned())
    }
}
