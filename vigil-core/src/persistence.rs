//! Atomic JSON persistence for incident snapshots.
//!
//! Every document is written to a `.tmp` sibling and renamed into place, so a
//! crash mid-write never leaves a truncated incident behind.

use std::io;
use std::path::{Path, PathBuf};

/// Serialize `data` as pretty JSON and atomically replace `path` with it.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: serde::Serialize>(path: &Path, data: &T) -> io::Result<()> {
    let json = serde_json::to_string_pretty(data).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json.as_bytes())?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load and deserialize JSON from a file.
///
/// Returns `Ok(None)` if the file doesn't exist.
pub fn load_json<T: serde::de::DeserializeOwned>(path: &Path) -> io::Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    let value =
        serde_json::from_str(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    Ok(Some(value))
}

/// All `*.json` documents directly inside `dir`, sorted by file name.
/// A missing directory yields an empty list.
pub fn json_documents(dir: &Path) -> io::Result<Vec<PathBuf>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Snapshot {
        entity: String,
        observations: u32,
    }

    #[test]
    fn test_write_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("incidents").join("a.json");
        let snap = Snapshot {
            entity: "10.0.0.1".into(),
            observations: 3,
        };

        atomic_write_json(&path, &snap).unwrap();
        let loaded: Option<Snapshot> = load_json(&path).unwrap();
        assert_eq!(loaded, Some(snap));
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        let loaded: Option<Snapshot> = load_json(&dir.path().join("nope.json")).unwrap();
        assert!(loaded.is_none());
    }

    #[test]
    fn test_load_garbage_is_invalid_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = load_json::<Snapshot>(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_json_documents_filters_and_sorts() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("b.json"), "{}").unwrap();
        std::fs::write(dir.path().join("a.json"), "{}").unwrap();
        std::fs::write(dir.path().join("c.json.tmp"), "{}").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "").unwrap();

        let docs = json_documents(dir.path()).unwrap();
        let names: Vec<_> = docs
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["a.json", "b.json"]);

        assert!(json_documents(&dir.path().join("missing")).unwrap().is_empty());
    }
}
