use std::collections::BTreeMap;

use thiserror::Error;

/// Magic header bytes: `F0 0F C7 C8`.
pub const MAGIC: u32 = 0xC8C7_0FF0;
pub const VERSION: u32 = 0;

const TYPE_DATA: u8 = 0;
const TYPE_OBJECT: u8 = 1;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("state truncated at offset {0}")]
    Truncated(usize),
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u32),
    #[error("expected object tag, found {0:#04x}")]
    ExpectedObject(u8),
    #[error("key {0:?} is not valid UTF-8")]
    BadKey(Vec<u8>),
    #[error("duplicate key {0:?}")]
    DuplicateKey(String),
    #[error("field {0:?} has length {1}, expected {2}")]
    FieldSize(String, usize, usize),
    #[error("restored state is inconsistent: {0}")]
    Inconsistent(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEntry {
    Data(Vec<u8>),
    Object(StateObject),
}

/// One named bag of state. Keys are unique; iteration order is the
/// insertion order so serialized states are deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StateObject {
    keys: Vec<String>,
    entries: BTreeMap<String, StateEntry>,
}

impl StateObject {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn insert(&mut self, key: &str, entry: StateEntry) {
        if self.entries.insert(key.to_owned(), entry).is_none() {
            self.keys.push(key.to_owned());
        }
    }

    pub fn put_object(&mut self, key: &str, obj: StateObject) {
        self.insert(key, StateEntry::Object(obj));
    }

    pub fn put_bytes(&mut self, key: &str, data: &[u8]) {
        self.insert(key, StateEntry::Data(data.to_vec()));
    }

    pub fn put_u8(&mut self, key: &str, v: u8) {
        self.put_bytes(key, &[v]);
    }

    pub fn put_u16(&mut self, key: &str, v: u16) {
        self.put_bytes(key, &v.to_le_bytes());
    }

    pub fn put_u32(&mut self, key: &str, v: u32) {
        self.put_bytes(key, &v.to_le_bytes());
    }

    pub fn put_u64(&mut self, key: &str, v: u64) {
        self.put_bytes(key, &v.to_le_bytes());
    }

    pub fn put_bool(&mut self, key: &str, v: bool) {
        self.put_u8(key, v as u8);
    }

    pub fn put_u16_slice(&mut self, key: &str, vs: &[u16]) {
        let mut bytes = Vec::with_capacity(vs.len() * 2);
        for v in vs {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.put_bytes(key, &bytes);
    }

    pub fn put_u32_slice(&mut self, key: &str, vs: &[u32]) {
        let mut bytes = Vec::with_capacity(vs.len() * 4);
        for v in vs {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.put_bytes(key, &bytes);
    }

    pub fn object(&self, key: &str) -> Option<&StateObject> {
        match self.entries.get(key) {
            Some(StateEntry::Object(o)) => Some(o),
            _ => None,
        }
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(StateEntry::Data(d)) => Some(d),
            _ => None,
        }
    }

    /// Missing or short fields read back as zero, like a fresh power-on.
    pub fn get_u8(&self, key: &str) -> u8 {
        self.bytes(key).and_then(|b| b.first().copied()).unwrap_or(0)
    }

    pub fn get_u16(&self, key: &str) -> u16 {
        let mut buf = [0u8; 2];
        self.copy_into(key, &mut buf);
        u16::from_le_bytes(buf)
    }

    pub fn get_u32(&self, key: &str) -> u32 {
        let mut buf = [0u8; 4];
        self.copy_into(key, &mut buf);
        u32::from_le_bytes(buf)
    }

    pub fn get_u64(&self, key: &str) -> u64 {
        let mut buf = [0u8; 8];
        self.copy_into(key, &mut buf);
        u64::from_le_bytes(buf)
    }

    pub fn get_bool(&self, key: &str) -> bool {
        self.get_u8(key) != 0
    }

    /// Copies as many bytes as the stored field provides, zero-filling the
    /// remainder.
    pub fn copy_into(&self, key: &str, out: &mut [u8]) {
        out.fill(0);
        if let Some(data) = self.bytes(key) {
            let n = data.len().min(out.len());
            out[..n].copy_from_slice(&data[..n]);
        }
    }

    pub fn get_u16_array<const N: usize>(&self, key: &str) -> [u16; N] {
        let mut out = [0u16; N];
        if let Some(data) = self.bytes(key) {
            for (i, chunk) in data.chunks_exact(2).take(N).enumerate() {
                out[i] = u16::from_le_bytes([chunk[0], chunk[1]]);
            }
        }
        out
    }

    pub fn get_u32_array<const N: usize>(&self, key: &str) -> [u32; N] {
        let mut out = [0u32; N];
        if let Some(data) = self.bytes(key) {
            for (i, chunk) in data.chunks_exact(4).take(N).enumerate() {
                out[i] = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        out
    }

    /// Serializes `self` as a standalone container (magic + version + tree).
    pub fn to_container_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4096);
        out.extend_from_slice(&MAGIC.to_le_bytes());
        out.extend_from_slice(&VERSION.to_le_bytes());
        self.encode(&mut out);
        out
    }

    pub fn from_container_bytes(data: &[u8]) -> Result<StateObject, SnapshotError> {
        let mut r = Reader { data, pos: 0 };
        let magic = r.read_u32()?;
        if magic != MAGIC {
            return Err(SnapshotError::BadMagic(magic));
        }
        let version = r.read_u32()?;
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }
        Self::decode(&mut r)
    }

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(TYPE_OBJECT);
        debug_assert!(self.keys.len() <= 255, "state object too wide");
        out.push(self.keys.len() as u8);
        for key in &self.keys {
            out.extend_from_slice(key.as_bytes());
            out.push(0);
            match &self.entries[key] {
                StateEntry::Object(o) => o.encode(out),
                StateEntry::Data(d) => {
                    out.push(TYPE_DATA);
                    out.extend_from_slice(&(d.len() as u32).to_le_bytes());
                    out.extend_from_slice(d);
                }
            }
        }
    }

    fn decode(r: &mut Reader<'_>) -> Result<StateObject, SnapshotError> {
        let tag = r.read_u8()?;
        if tag != TYPE_OBJECT {
            return Err(SnapshotError::ExpectedObject(tag));
        }
        let count = r.read_u8()?;
        let mut obj = StateObject::new();
        for _ in 0..count {
            let key = r.read_cstring()?;
            if obj.entries.contains_key(&key) {
                return Err(SnapshotError::DuplicateKey(key));
            }
            let entry = match r.peek_u8()? {
                TYPE_OBJECT => StateEntry::Object(Self::decode(r)?),
                _ => {
                    let tag = r.read_u8()?;
                    if tag != TYPE_DATA {
                        return Err(SnapshotError::ExpectedObject(tag));
                    }
                    let len = r.read_u32()? as usize;
                    StateEntry::Data(r.read_bytes(len)?.to_vec())
                }
            };
            obj.insert(&key, entry);
        }
        Ok(obj)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn read_u8(&mut self) -> Result<u8, SnapshotError> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or(SnapshotError::Truncated(self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn peek_u8(&self) -> Result<u8, SnapshotError> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or(SnapshotError::Truncated(self.pos))
    }

    fn read_u32(&mut self) -> Result<u32, SnapshotError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], SnapshotError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or(SnapshotError::Truncated(self.pos))?;
        if end > self.data.len() {
            return Err(SnapshotError::Truncated(self.pos));
        }
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn read_cstring(&mut self) -> Result<String, SnapshotError> {
        let start = self.pos;
        while self.peek_u8()? != 0 {
            self.pos += 1;
        }
        let raw = self.data[start..self.pos].to_vec();
        self.pos += 1; // NUL
        String::from_utf8(raw.clone()).map_err(|_| SnapshotError::BadKey(raw))
    }
}

/// Implemented by every device whose registers belong in a savestate.
pub trait IoSnapshot {
    /// Stable key naming this device inside the machine state.
    const NAME: &'static str;

    fn save_state(&self) -> StateObject;
    fn load_state(&mut self, state: &StateObject) -> Result<(), SnapshotError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_roundtrip() {
        let mut inner = StateObject::new();
        inner.put_u32("counter", 0xDEAD_BEEF);
        inner.put_bytes("ram", &[1, 2, 3, 4, 5]);

        let mut root = StateObject::new();
        root.put_u8("mode", 3);
        root.put_object("timer", inner.clone());

        let bytes = root.to_container_bytes();
        assert_eq!(&bytes[..4], &[0xF0, 0x0F, 0xC7, 0xC8]);

        let decoded = StateObject::from_container_bytes(&bytes).unwrap();
        assert_eq!(decoded.get_u8("mode"), 3);
        let timer = decoded.object("timer").unwrap();
        assert_eq!(timer.get_u32("counter"), 0xDEAD_BEEF);
        assert_eq!(timer.bytes("ram").unwrap(), &[1, 2, 3, 4, 5]);
    }

    #[test]
    fn missing_fields_read_as_zero() {
        let obj = StateObject::new();
        assert_eq!(obj.get_u32("nope"), 0);
        assert_eq!(obj.get_u64("nope"), 0);
        assert!(!obj.get_bool("nope"));
        let arr: [u32; 4] = obj.get_u32_array("nope");
        assert_eq!(arr, [0; 4]);
    }

    #[test]
    fn short_field_zero_fills() {
        let mut obj = StateObject::new();
        obj.put_bytes("w", &[0x34]);
        assert_eq!(obj.get_u16("w"), 0x0034);
    }

    #[test]
    fn truncated_container_is_an_error() {
        let mut root = StateObject::new();
        root.put_bytes("blob", &[0u8; 32]);
        let mut bytes = root.to_container_bytes();
        bytes.truncate(bytes.len() - 8);
        assert!(matches!(
            StateObject::from_container_bytes(&bytes),
            Err(SnapshotError::Truncated(_))
        ));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0u8; 16];
        assert!(matches!(
            StateObject::from_container_bytes(&bytes),
            Err(SnapshotError::BadMagic(0))
        ));
    }
}
