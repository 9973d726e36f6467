//! Full-machine snapshot container: the recursive state-object encoding
//! from `corten-io-snapshot` plus LZ4-framed blobs for the large flat
//! buffers (guest RAM, VRAM).

use corten_io_snapshot::{SnapshotError, StateObject};
use thiserror::Error;

pub use corten_io_snapshot::{IoSnapshot, StateEntry};

/// Container version for the machine-level layout (device sections plus
/// compressed memory blobs). The inner object encoding carries its own
/// magic and version.
pub const MACHINE_SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum MachineSnapshotError {
    #[error(transparent)]
    State(#[from] SnapshotError),
    #[error("blob failed to decompress: {0}")]
    Blob(String),
    #[error("snapshot RAM size {found} does not match machine RAM size {expected}")]
    RamSize { expected: u32, found: u32 },
    #[error("snapshot layout version {0} unsupported")]
    Version(u32),
    #[error("missing section {0:?}")]
    MissingSection(&'static str),
}

/// LZ4 with the uncompressed length prepended, so restore can
/// preallocate and validate.
pub fn compress_blob(data: &[u8]) -> Vec<u8> {
    lz4_flex::compress_prepend_size(data)
}

pub fn decompress_blob(data: &[u8]) -> Result<Vec<u8>, MachineSnapshotError> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| MachineSnapshotError::Blob(e.to_string()))
}

/// Writes a blob field into `obj` under `key`.
pub fn put_blob(obj: &mut StateObject, key: &str, data: &[u8]) {
    obj.put_bytes(key, &compress_blob(data));
}

pub fn get_blob(
    obj: &StateObject,
    key: &'static str,
) -> Result<Vec<u8>, MachineSnapshotError> {
    let raw = obj
        .bytes(key)
        .ok_or(MachineSnapshotError::MissingSection(key))?;
    decompress_blob(raw)
}

/// Wraps a machine-layout root object into container bytes.
pub fn seal(mut root: StateObject) -> Vec<u8> {
    root.put_u32("layout_version", MACHINE_SNAPSHOT_VERSION);
    root.to_container_bytes()
}

/// Unwraps container bytes and checks the machine layout version.
pub fn unseal(bytes: &[u8]) -> Result<StateObject, MachineSnapshotError> {
    let root = StateObject::from_container_bytes(bytes)?;
    let version = root.get_u32("layout_version");
    if version != MACHINE_SNAPSHOT_VERSION {
        return Err(MachineSnapshotError::Version(version));
    }
    Ok(root)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn blob_roundtrip() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i * 7) as u8).collect();
        let packed = compress_blob(&data);
        assert!(packed.len() < data.len());
        assert_eq!(decompress_blob(&packed).unwrap(), data);
    }

    #[test]
    fn seal_checks_layout_version() {
        let mut root = StateObject::new();
        root.put_u32("x", 1);
        let bytes = seal(root);
        let back = unseal(&bytes).unwrap();
        assert_eq!(back.get_u32("x"), 1);

        let mut bad = StateObject::new();
        bad.put_u32("layout_version", 99);
        let bytes = bad.to_container_bytes();
        assert!(matches!(
            unseal(&bytes),
            Err(MachineSnapshotError::Version(99))
        ));
    }

    proptest! {
        #[test]
        fn blob_roundtrip_arbitrary(data in proptest::collection::vec(any::<u8>(), 0..4096)) {
            let packed = compress_blob(&data);
            prop_assert_eq!(decompress_blob(&packed).unwrap(), data);
        }

        #[test]
        fn container_roundtrip_arbitrary(
            key in "k[a-z]{1,10}",
            data in proptest::collection::vec(any::<u8>(), 0..512),
            value in any::<u64>(),
        ) {
            let mut root = StateObject::new();
            root.put_bytes(&key, &data);
            root.put_u64("value", value);
            let bytes = seal(root);
            let back = unseal(&bytes).unwrap();
            prop_assert_eq!(back.bytes(&key).unwrap(), &data[..]);
            prop_assert_eq!(back.get_u64("value"), value);
        }
    }
}
