//! On-disk caching of discovered service structure, keyed by peer identity
//! and service start handle (§4.8).
//!
//! The engine is generic over [`CacheStore`] so tests run against an
//! in-memory double instead of touching the filesystem.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use crate::{model::Characteristic, Address, Error, ErrorKind, Result};

/// Abstracts the external storage backend. An `async fn` trait expressed as
/// boxed futures, matching how this crate treats other external
/// collaborators it doesn't own (the D-Bus connection, the L2CAP socket).
pub trait CacheStore: Send + Sync {
    /// Persists the serialised characteristic list for one Primary.
    fn write_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// Reads back a previously-written characteristic list, if any.
    fn read_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>>;

    /// Persists one descriptor attribute (`<uuid>#<hex-bytes>`) under its
    /// handle.
    fn write_device_attribute<'a>(
        &'a self, local: Address, peer: Address, handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// Serialises a Primary's characteristic list to the §4.8 grammar:
/// `<value_handle:04X>#<properties:02X>#<end_handle:04X>#<uuid>`, records
/// space-separated in ascending `value_handle` order.
pub fn serialize_characteristics(chars: &[Characteristic]) -> String {
    chars
        .iter()
        .map(|c| format!("{:04X}#{:02X}#{:04X}#{}", c.value_handle, c.properties, c.end_handle, c.uuid))
        .collect::<Vec<_>>()
        .join(" ")
}

/// One characteristic record recovered from a cached string.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct CachedCharacteristic {
    /// Characteristic value handle.
    pub value_handle: u16,
    /// ATT characteristic properties bitfield.
    pub properties: u8,
    /// Inclusive last descriptor handle.
    pub end_handle: u16,
    /// Characteristic UUID string, as originally discovered.
    pub uuid: String,
}

/// Parses a string written by [`serialize_characteristics`]. Any record
/// with fewer than four `#`-separated fields, or a non-hex numeric field,
/// is a parse failure — and per §4.8 a parse failure means "no cached
/// entry", not a partial load: the whole string is rejected rather than
/// returning the records that did parse.
pub fn parse_characteristics(s: &str) -> Result<Vec<CachedCharacteristic>> {
    let malformed = || Error::new(ErrorKind::MalformedPdu);
    s.split(' ')
        .filter(|rec| !rec.is_empty())
        .map(|rec| {
            let mut fields = rec.splitn(4, '#');
            let value_handle = u16::from_str_radix(fields.next().ok_or_else(malformed)?, 16).map_err(|_| malformed())?;
            let properties = u8::from_str_radix(fields.next().ok_or_else(malformed)?, 16).map_err(|_| malformed())?;
            let end_handle = u16::from_str_radix(fields.next().ok_or_else(malformed)?, 16).map_err(|_| malformed())?;
            let uuid = fields.next().ok_or_else(malformed)?.to_string();
            if fields.next().is_some() {
                return Err(malformed());
            }
            Ok(CachedCharacteristic { value_handle, properties, end_handle, uuid })
        })
        .collect()
}

/// Serialises one descriptor attribute as `<uuid>#<hex-bytes>`, lowercase
/// hex with no separator (the `hex` crate's default encoding).
pub fn serialize_attribute(uuid: &str, value: &[u8]) -> String {
    format!("{uuid}#{}", hex::encode(value))
}

/// Parses a descriptor attribute record written by [`serialize_attribute`].
pub fn parse_attribute(s: &str) -> Result<(String, Vec<u8>)> {
    let malformed = || Error::new(ErrorKind::MalformedPdu);
    let (uuid, hex_bytes) = s.split_once('#').ok_or_else(malformed)?;
    let value = hex::decode(hex_bytes).map_err(|_| malformed())?;
    Ok((uuid.to_string(), value))
}

/// Filesystem-backed [`CacheStore`]: one line-oriented file per
/// `(local, peer)` pair under `root`, matching the grammar in §4.8.
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Creates a store rooted at `root`, which is created lazily on first
    /// write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, local: Address, peer: Address) -> PathBuf {
        self.root.join(format!("{local}-{peer}").replace(':', ""))
    }

    async fn read_lines(path: &Path) -> Result<HashMap<String, String>> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(contents
                .lines()
                .filter_map(|line| line.split_once(' ').map(|(k, v)| (k.to_string(), v.to_string())))
                .collect()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_lines(path: &Path, lines: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = lines.iter().map(|(k, v)| format!("{k} {v}")).collect::<Vec<_>>().join("\n");
        tokio::fs::write(path, body).await?;
        Ok(())
    }
}

impl CacheStore for FsCacheStore {
    fn write_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(local, peer);
            let mut lines = Self::read_lines(&path).await?;
            lines.insert(format!("chars:{start_handle:04X}"), payload);
            Self::write_lines(&path, &lines).await
        })
    }

    fn read_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(local, peer);
            let lines = Self::read_lines(&path).await?;
            Ok(lines.get(&format!("chars:{start_handle:04X}")).cloned())
        })
    }

    fn write_device_attribute<'a>(
        &'a self, local: Address, peer: Address, handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.path_for(local, peer);
            let mut lines = Self::read_lines(&path).await?;
            lines.insert(format!("attr:{handle:04X}"), payload);
            Self::write_lines(&path, &lines).await
        })
    }
}

/// In-memory [`CacheStore`] test double.
#[derive(Default)]
pub struct MemoryCacheStore {
    entries: Mutex<HashMap<(Address, Address, String), String>>,
}

impl CacheStore for MemoryCacheStore {
    fn write_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.lock().unwrap().insert((local, peer, format!("chars:{start_handle:04X}")), payload);
            Ok(())
        })
    }

    fn read_device_characteristics<'a>(
        &'a self, local: Address, peer: Address, start_handle: u16,
    ) -> Pin<Box<dyn Future<Output = Result<Option<String>>> + Send + 'a>> {
        Box::pin(async move { Ok(self.entries.lock().unwrap().get(&(local, peer, format!("chars:{start_handle:04X}"))).cloned()) })
    }

    fn write_device_attribute<'a>(
        &'a self, local: Address, peer: Address, handle: u16, payload: String,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.entries.lock().unwrap().insert((local, peer, format!("attr:{handle:04X}")), payload);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ch(value_handle: u16, properties: u8, end_handle: u16, uuid: &str) -> Characteristic {
        Characteristic {
            value_handle,
            end_handle,
            properties,
            uuid: uuid.to_string(),
            value: None,
            descriptors: Default::default(),
        }
    }

    #[test]
    fn characteristics_round_trip() {
        let chars = vec![ch(0x0012, 0x0A, 0x0015, "2A00"), ch(0x0016, 0x02, 0x0018, "2A19")];
        let serialized = serialize_characteristics(&chars);
        assert_eq!(serialized, "0012#0A#0015#2A00 0016#02#0018#2A19");
        let parsed = parse_characteristics(&serialized).unwrap();
        assert_eq!(parsed, vec![
            CachedCharacteristic { value_handle: 0x0012, properties: 0x0A, end_handle: 0x0015, uuid: "2A00".into() },
            CachedCharacteristic { value_handle: 0x0016, properties: 0x02, end_handle: 0x0018, uuid: "2A19".into() },
        ]);
    }

    #[test]
    fn malformed_characteristic_string_is_rejected_wholesale() {
        assert!(parse_characteristics("0012#0A#0015").is_err());
        assert!(parse_characteristics("ZZZZ#0A#0015#2A00").is_err());
        // one bad record among good ones still rejects the whole string
        assert!(parse_characteristics("0012#0A#0015#2A00 garbage").is_err());
    }

    #[test]
    fn attribute_round_trips() {
        let serialized = serialize_attribute("2901", &[0x4E, 0x61, 0x6D, 0x65]);
        assert_eq!(serialized, "2901#4e616d65");
        let (uuid, value) = parse_attribute(&serialized).unwrap();
        assert_eq!(uuid, "2901");
        assert_eq!(value, vec![0x4E, 0x61, 0x6D, 0x65]);
    }

    #[test]
    fn malformed_attribute_string_is_rejected() {
        assert!(parse_attribute("2901").is_err());
        assert!(parse_attribute("2901#zz").is_err());
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryCacheStore::default();
        let local = Address::new([1, 2, 3, 4, 5, 6]);
        let peer = Address::new([6, 5, 4, 3, 2, 1]);
        assert!(store.read_device_characteristics(local, peer, 0x10).await.unwrap().is_none());
        store.write_device_characteristics(local, peer, 0x10, "0012#0A#0015#2A00".into()).await.unwrap();
        assert_eq!(
            store.read_device_characteristics(local, peer, 0x10).await.unwrap().as_deref(),
            Some("0012#0A#0015#2A00")
        );
    }
}
