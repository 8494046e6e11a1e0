//! On-disk persistence shared by the contract registry and the vector index.
//!
//! Every write lands in a temporary sibling first and is renamed over the target,
//! so readers see either the old file or the new one, never a torn write.

use crate::error::StoreError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}.tmp", name, uuid::Uuid::new_v4()))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    }
}

/// Flushes directory entries so a completed rename survives power loss.
#[cfg(unix)]
pub(crate) async fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).await?.sync_all().await
}

/// Directories cannot be opened for syncing here; the rename is left to the filesystem.
#[cfg(not(unix))]
pub(crate) async fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

pub async fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let parent = parent_dir(path);
    fs::create_dir_all(parent).await?;

    let temp = temp_sibling(path);
    let written = async {
        let mut file = fs::File::create(&temp).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        fs::rename(&temp, path).await?;
        sync_dir(parent).await
    }
    .await;

    if let Err(error) = written {
        let _ = fs::remove_file(&temp).await;
        return Err(error.into());
    }
    Ok(())
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &bytes).await
}

/// Reads a JSON document; a file that exists but does not parse is reported as corrupted.
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, StoreError> {
    let bytes = fs::read(path).await?;
    serde_json::from_slice(&bytes).map_err(|error| StoreError::Corrupted {
        path: path.display().to_string(),
        details: error.to_string(),
    })
}

pub async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    if fs::try_exists(path).await? {
        read_json(path).await.map(Some)
    } else {
        Ok(None)
    }
}

/// Drops temp files left behind by a process that died mid-write.
pub async fn sweep_temp_files(dir: &Path) -> Result<usize, StoreError> {
    let mut removed = 0;
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(".tmp") {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        pages: u32,
    }

    #[tokio::test]
    async fn atomic_write_replaces_content_and_leaves_no_temp_files(
    ) -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("nested").join("meta.json");

        write_json_atomic(&path, &Sample { name: "a".to_string(), pages: 1 }).await?;
        write_json_atomic(&path, &Sample { name: "b".to_string(), pages: 2 }).await?;

        let loaded: Sample = read_json(&path).await?;
        assert_eq!(loaded, Sample { name: "b".to_string(), pages: 2 });
        assert_eq!(sweep_temp_files(path.parent().unwrap()).await?, 0);
        Ok(())
    }

    #[tokio::test]
    async fn rename_is_flushed_through_the_parent_directory() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("contracts").join("source.pdf");

        write_bytes_atomic(&path, b"%PDF-1.5").await?;
        sync_dir(parent_dir(&path)).await?;

        assert_eq!(parent_dir(&path), dir.path().join("contracts").as_path());
        assert_eq!(parent_dir(Path::new("meta.json")), Path::new("."));
        assert_eq!(std::fs::read(&path)?, b"%PDF-1.5");
        Ok(())
    }

    #[tokio::test]
    async fn unparseable_file_is_corrupted_not_empty() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let path = dir.path().join("meta.json");
        std::fs::write(&path, b"{ not json")?;

        let result = read_json::<Sample>(&path).await;
        assert!(matches!(result, Err(StoreError::Corrupted { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn missing_file_reads_as_none() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        let loaded = read_json_if_exists::<Sample>(&dir.path().join("absent.json")).await?;
        assert!(loaded.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn sweep_removes_orphaned_temp_files() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempdir()?;
        std::fs::write(dir.path().join(".meta.json.1234.tmp"), b"partial")?;
        std::fs::write(dir.path().join("meta.json"), b"{}")?;

        assert_eq!(sweep_temp_files(dir.path()).await?, 1);
        assert!(dir.path().join("meta.json").exists());
        Ok(())
    }
}
