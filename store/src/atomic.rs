//! Atomic JSON sidecar writes: write-to-temp, fsync, read-back validate,
//! rename, re-parse target as a last line of defense.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::{Result, StoreError};

/// Write `value` to `path` atomically. A failed read-back deletes the temp
/// file and raises a State/Persistence error rather than leaving a
/// partially-written sidecar in place.
pub fn write_json_atomic<T: serde::Serialize>(path: impl AsRef<Path>, value: &T) -> Result<()> {
    let path = path.as_ref();
    let tmp = path.with_extension(format!("tmp.{}", uuid::Uuid::now_v7()));

    let serialized = serde_json::to_vec_pretty(value)?;

    let mut file = File::create(&tmp)?;
    file.write_all(&serialized)?;
    file.sync_all()?;
    drop(file);

    let read_back = fs::read(&tmp)?;
    if serde_json::from_slice::<serde_json::Value>(&read_back).is_err() {
        let _ = fs::remove_file(&tmp);
        return Err(StoreError::AtomicWriteFailed {
            path: path.display().to_string(),
            reason: "read-back did not parse as JSON".to_string(),
        });
    }

    fs::rename(&tmp, path)?;

    let final_bytes = fs::read(path)?;
    if serde_json::from_slice::<serde_json::Value>(&final_bytes).is_err() {
        return Err(StoreError::AtomicWriteFailed {
            path: path.display().to_string(),
            reason: "post-rename re-parse failed".to_string(),
        });
    }

    Ok(())
}

/// Reads and deserializes a sidecar, returning `None` if it doesn't exist
/// yet (first run).
pub fn read_json<T: for<'de> serde::Deserialize<'de>>(path: impl AsRef<Path>) -> Result<Option<T>> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(None);
    }
    let bytes = fs::read(path)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sidecar {
        count: u64,
    }

    #[test]
    fn round_trips_through_atomic_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_json_atomic(&path, &Sidecar { count: 3 }).unwrap();
        let read: Option<Sidecar> = read_json(&path).unwrap();
        assert_eq!(read, Some(Sidecar { count: 3 }));

        write_json_atomic(&path, &Sidecar { count: 4 }).unwrap();
        let read: Option<Sidecar> = read_json(&path).unwrap();
        assert_eq!(read, Some(Sidecar { count: 4 }));
    }

    #[test]
    fn missing_sidecar_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let read: Option<Sidecar> = read_json(&path).unwrap();
        assert_eq!(read, None);
    }

    #[test]
    fn no_leftover_temp_file_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_json_atomic(&path, &Sidecar { count: 1 }).unwrap();
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
