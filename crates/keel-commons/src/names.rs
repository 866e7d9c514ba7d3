//! Type-safe wrappers for logical names.
//!
//! Database and table names are case-insensitive and normalized to lowercase,
//! so `DatabaseName::new("Sales")` equals `DatabaseName::new("sales")`.
//! Attribute names are case-preserving.
//!
//! Table names must not contain `/` — the catalog key format reserves it as the
//! `<table>/<attribute>` separator (see `catalog_key`). `new` strips it.

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! name_common {
    ($ty:ident) => {
        impl $ty {
            /// Returns the name as a string slice.
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the wrapper and returns the inner String.
            #[inline]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $ty {
            fn from(s: String) -> Self {
                Self::new(s)
            }
        }

        impl From<&str> for $ty {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

/// Type-safe wrapper for database names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct DatabaseName(String);

impl DatabaseName {
    /// Creates a new DatabaseName, normalized to lowercase.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(normalize(name.into()))
    }
}

name_common!(DatabaseName);

/// Type-safe wrapper for table names.
///
/// Ensures table names cannot be accidentally used where database names or
/// attribute names are expected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct TableName(String);

impl TableName {
    /// Creates a new TableName, normalized to lowercase.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        Self(normalize(name.into()))
    }
}

name_common!(TableName);

/// Type-safe wrapper for attribute names. Case-preserving.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Encode, Decode)]
pub struct AttributeName(String);

impl AttributeName {
    /// Creates a new AttributeName. The `/` separator is stripped.
    #[inline]
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self(name.replace('/', ""))
    }
}

name_common!(AttributeName);

fn normalize(name: String) -> String {
    name.to_lowercase().replace('/', "")
}
