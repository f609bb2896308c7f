use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
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

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Device ids are chosen by the devices themselves and stay plain strings.
branded_id!(ObserverId, "obs");
branded_id!(LinkId, "link");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_carry_prefix() {
        assert!(ObserverId::new().as_str().starts_with("obs_"));
        assert!(LinkId::new().as_str().starts_with("link_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = LinkId::new();
        let b = LinkId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn from_raw_keeps_value() {
        let id = ObserverId::from_raw("obs_fixed");
        assert_eq!(id.as_str(), "obs_fixed");
        assert_eq!(id.to_string(), "obs_fixed");
    }

    #[test]
    fn serializes_transparently() {
        let id = LinkId::from_raw("link_1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"link_1\"");
        let back: LinkId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
