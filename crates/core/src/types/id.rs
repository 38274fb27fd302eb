//! Newtype IDs for type-safe cart references.
//!
//! Use the `define_id!` macro to create type-safe ID wrappers that prevent
//! accidentally mixing line IDs with product IDs.

use serde::{Deserialize, Deserializer};

/// An identifier as the cart service may send it: string or integer.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawId {
    Text(String),
    Signed(i64),
    Unsigned(u64),
}

impl From<RawId> for String {
    fn from(raw: RawId) -> Self {
        match raw {
            RawId::Text(s) => s,
            RawId::Signed(n) => n.to_string(),
            RawId::Unsigned(n) => n.to_string(),
        }
    }
}

#[doc(hidden)]
pub fn deserialize_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    RawId::deserialize(deserializer).map(String::from)
}

/// Macro to define a type-safe ID wrapper.
///
/// Creates a newtype wrapper around `String` with:
/// - `Serialize` as a plain string
/// - `Deserialize` from either a JSON string or a JSON integer
/// - `Debug`, `Clone`, `PartialEq`, `Eq`, `Hash`, `Display`
/// - `From<&str>`, `From<String>` and `From<i64>` implementations
///
/// # Example
///
/// ```rust
/// # use cartsync_core::define_id;
/// define_id!(LineId);
/// define_id!(ProductId);
///
/// let line = LineId::from(1);
/// let product = ProductId::from(1);
///
/// // These are different types, so this won't compile:
/// // let _: LineId = product;
/// assert_eq!(line.as_str(), product.as_str());
/// ```
#[macro_export]
macro_rules! define_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, ::serde::Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new ID from any string-like value.
            #[must_use]
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Get the underlying string value.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl<'de> ::serde::Deserialize<'de> for $name {
            fn deserialize<D: ::serde::Deserializer<'de>>(
                deserializer: D,
            ) -> ::core::result::Result<Self, D::Error> {
                $crate::types::id::deserialize_id(deserializer).map(Self)
            }
        }

        impl ::core::fmt::Display for $name {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_id!(LineId);
define_id!(ProductId);

/// Prefix for line IDs synthesized by optimistic local mutations.
pub const LOCAL_LINE_PREFIX: &str = "local-";

impl LineId {
    /// Synthesize an ID for a line that exists only locally.
    #[must_use]
    pub fn local() -> Self {
        Self(format!("{LOCAL_LINE_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Whether this line was synthesized locally and never confirmed by the server.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.0.starts_with(LOCAL_LINE_PREFIX)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_id_from_json_number_and_string() {
        let a: LineId = serde_json::from_str("42").unwrap();
        let b: LineId = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "42");
    }

    #[test]
    fn test_id_serializes_as_string() {
        let id = ProductId::from(9);
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"9\"");
    }

    #[test]
    fn test_id_rejects_objects() {
        let result: Result<LineId, _> = serde_json::from_str("{\"id\": 1}");
        assert!(result.is_err());
    }

    #[test]
    fn test_local_line_ids_are_unique_and_marked() {
        let a = LineId::local();
        let b = LineId::local();
        assert_ne!(a, b);
        assert!(a.is_local());
        assert!(!LineId::from("gid://cart/line/1").is_local());
    }
}
