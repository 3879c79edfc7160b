use std::{cmp::Ordering, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize};

/// A 20-byte identifier, used for torrent info hashes and peer ids.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Id20(pub [u8; 20]);

impl Id20 {
    pub const fn new(from: [u8; 20]) -> Id20 {
        Id20(from)
    }

    pub fn as_string(&self) -> String {
        hex::encode(self.0)
    }

    /// First 8 hex characters, handy for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl std::fmt::Debug for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x?}")?;
        }
        Ok(())
    }
}

impl std::fmt::Display for Id20 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

impl FromStr for Id20 {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 20];
        if s.len() != 40 {
            anyhow::bail!("expected a hex string of length 40, got {}", s.len())
        };
        hex::decode_to_slice(s, &mut out)?;
        Ok(Id20(out))
    }
}

// Serialized as hex: the only formats we persist ids in are JSON manifests and events.
impl Serialize for Id20 {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> Deserialize<'de> for Id20 {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct IdVisitor;

        impl<'de> serde::de::Visitor<'de> for IdVisitor {
            type Value = Id20;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter.write_str("a 40 character hex string or 20 raw bytes")
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 40 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut out = [0u8; 20];
                match hex::decode_to_slice(v, &mut out) {
                    Ok(_) => Ok(Id20(out)),
                    Err(e) => Err(E::custom(e)),
                }
            }

            fn visit_bytes<E>(self, v: &[u8]) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v.len() != 20 {
                    return Err(E::invalid_length(v.len(), &self));
                }
                let mut buf = [0u8; 20];
                buf.copy_from_slice(v);
                Ok(Id20(buf))
            }
        }

        deserializer.deserialize_any(IdVisitor)
    }
}

impl PartialOrd<Id20> for Id20 {
    fn partial_cmp(&self, other: &Id20) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Id20 {
    fn cmp(&self, other: &Id20) -> Ordering {
        self.0.cmp(&other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_str_and_back() {
        let s = "775459190aa65566591634203f8d9f17d341f969";
        let id = Id20::from_str(s).unwrap();
        assert_eq!(id.as_string(), s);
        assert_eq!(id.short(), "77545919");
    }

    #[test]
    fn test_from_str_bad_length() {
        assert!(Id20::from_str("abcd").is_err());
    }

    #[test]
    fn test_json_hex() {
        let id = Id20::new([0xab; 20]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "ab".repeat(20)));
        let back: Id20 = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
