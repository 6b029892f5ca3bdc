//! Prefixed string identifiers. New ids are `<prefix>_<uuid v7>`, so they
//! sort by creation time and show their kind in logs.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! prefixed_id {
    ($(#[$meta:meta])* $name:ident => $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub const PREFIX: &'static str = $prefix;

            pub fn new() -> Self {
                Self(format!(concat!($prefix, "_{}"), Uuid::now_v7()))
            }

            /// Wrap an id received from a client or a header, unchecked.
            pub fn from_raw(raw: impl Into<String>) -> Self {
                Self(raw.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

prefixed_id!(
    /// One SSE or WebSocket connection.
    SubscriberId => "sub"
);
prefixed_id!(
    /// One logical webhook notification, shared by all of its attempts.
    DeliveryId => "dlv"
);
prefixed_id!(
    /// A registered webhook endpoint.
    EndpointId => "whk"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscriber_id_has_prefix() {
        let id = SubscriberId::new();
        assert!(id.as_str().starts_with("sub_"), "got: {id}");
    }

    #[test]
    fn delivery_id_has_prefix() {
        let id = DeliveryId::new();
        assert!(id.as_str().starts_with("dlv_"), "got: {id}");
    }

    #[test]
    fn endpoint_id_has_prefix() {
        let id = EndpointId::new();
        assert!(id.as_str().starts_with("whk_"), "got: {id}");
    }

    #[test]
    fn ids_are_unique() {
        let a = SubscriberId::new();
        let b = SubscriberId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn raw_ids_are_kept_verbatim() {
        let id = EndpointId::from_raw("whk_custom");
        assert_eq!(id.as_str(), "whk_custom");
        assert_eq!(id.to_string(), "whk_custom");
        assert_eq!(EndpointId::PREFIX, "whk");
    }

    #[test]
    fn serializes_as_plain_string() {
        let id = DeliveryId::from_raw("dlv_1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"dlv_1\"");
    }
}
