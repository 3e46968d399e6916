use std::str::FromStr;

use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};

/// Content-addressed identifier of a message body: the BLAKE3 hash of its
/// raw bytes. Two identical bodies share one `BlobId` and therefore one
/// stored blob, wherever that blob currently lives (staging, cache, object
/// store).
///
/// Rendered as 64 lowercase hex characters; that string is the object-store
/// key and, split as `<hh>/<HH>/<hex>`, the cache path.
#[derive(Clone, Copy, PartialOrd, Ord, PartialEq, Eq, Hash, Debug)]
pub struct BlobId(pub [u8; 32]);

impl BlobId {
    pub fn of(body: &[u8]) -> Self {
        Self(*blake3::hash(body).as_bytes())
    }

    /// The two fan-out path components: first two and next two hex chars.
    pub fn shard(&self) -> (String, String) {
        let h = self.to_string();
        (h[0..2].to_string(), h[2..4].to_string())
    }
}

impl std::fmt::Display for BlobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for BlobId {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<BlobId, &'static str> {
        let bytes = hex::decode(s).map_err(|_| "invalid hex")?;

        if bytes.len() != 32 {
            return Err("bad length");
        }

        let mut tmp = [0u8; 32];
        tmp[..].copy_from_slice(&bytes);
        Ok(BlobId(tmp))
    }
}

impl<'de> Deserialize<'de> for BlobId {
    fn deserialize<D>(d: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let v = String::deserialize(d)?;
        BlobId::from_str(&v).map_err(D::Error::custom)
    }
}

impl Serialize for BlobId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_id() {
        assert_eq!(BlobId::of(b"hello"), BlobId::of(b"hello"));
        assert_ne!(BlobId::of(b"hello"), BlobId::of(b"hello "));
    }

    #[test]
    fn hex_roundtrip() {
        let id = BlobId::of(b"Subject: hi\r\n\r\nbody");
        let s = id.to_string();
        assert_eq!(s.len(), 64);
        assert_eq!(BlobId::from_str(&s).unwrap(), id);
    }

    #[test]
    fn shard_is_prefix() {
        let id = BlobId::of(b"x");
        let (hh, hh2) = id.shard();
        let s = id.to_string();
        assert_eq!(format!("{}{}", hh, hh2), s[0..4]);
    }

    #[test]
    fn rejects_garbage() {
        assert!(BlobId::from_str("zz").is_err());
        assert!(BlobId::from_str(&"ab".repeat(16)).is_ok());
        assert!(BlobId::from_str(&"ab".repeat(15)).is_err());
    }
}
