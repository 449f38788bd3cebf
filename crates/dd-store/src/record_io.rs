//! Record file I/O for the queue partitions
//!
//! Async read and write of single task records as pretty-printed JSON.
//! Records are validated on both sides of the disk boundary so a corrupt or
//! hand-edited file never flows further into the system than this module.

use dd_core::{Result, TaskRecord};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Read and parse a single record file.
pub async fn read_record(path: &Path) -> Result<TaskRecord> {
    debug!("Reading record file: {}", path.display());

    let data = fs::read(path).await?;
    let record: TaskRecord = serde_json::from_slice(&data)?;
    record.validate()?;

    Ok(record)
}

/// Write a record into `partition_dir` as `{task_id}.json`.
///
/// Creates the partition directory if it does not exist. Returns the path
/// written. serde_json emits struct fields in declaration order, so every
/// agent writing the same logical record produces the same bytes.
pub async fn write_record(partition_dir: &Path, record: &TaskRecord) -> Result<PathBuf> {
    record.validate()?;

    fs::create_dir_all(partition_dir).await?;

    let data = serde_json::to_vec_pretty(record)?;
    let path = partition_dir.join(record.file_name());
    debug!("Writing record file: {}", path.display());
    fs::write(&path, data).await?;

    Ok(path)
}

/// Remove a record file. Missing files are not an error; the caller decides
/// what a vanished record means.
pub async fn remove_record(path: &Path) -> Result<()> {
    debug!("Removing record file: {}", path.display());

    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// List the record file paths in a partition directory, sorted by file name.
///
/// A missing directory reads as empty. Non-JSON entries are ignored.
pub async fn list_record_paths(partition_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match fs::read_dir(partition_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        paths.push(path);
    }

    paths.sort();
    Ok(paths)
}

/// Read every record in a partition directory.
///
/// Unparseable or invalid files are skipped with a warning so one bad file
/// cannot block a listing of the rest.
pub async fn read_all_records(partition_dir: &Path) -> Result<Vec<TaskRecord>> {
    let mut records = Vec::new();

    for path in list_record_paths(partition_dir).await? {
        match read_record(&path).await {
            Ok(record) => records.push(record),
            Err(e) => {
                warn!(
                    "Skipping invalid record file {}: {}",
                    path.file_name().unwrap_or_default().to_string_lossy(),
                    e
                );
            }
        }
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dd_core::ValidationError;
    use tempfile::TempDir;

    fn sample_record() -> TaskRecord {
        TaskRecord::new("collect benchmarks", "agent-b", "agent-a").unwrap()
    }

    #[tokio::test]
    async fn test_write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let record = sample_record();

        let path = write_record(dir.path(), &record).await.unwrap();
        assert_eq!(path, dir.path().join(record.file_name()));

        let read_back = read_record(&path).await.unwrap();
        assert_eq!(read_back, record);
    }

    #[tokio::test]
    async fn test_read_rejects_invalid_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.json");

        // Parses, but fails validation: empty prompt
        let json = r#"{
            "task_id": "0c7b38a2-54d4-4f9e-9f59-9ad2ae9d7a3e",
            "status": "pending",
            "assigned_to": "agent-b",
            "assigned_by": "agent-a",
            "created_at": "2026-01-05T12:00:00Z",
            "prompt": "",
            "deliverables": []
        }"#;
        fs::write(&path, json).await.unwrap();

        let err = read_record(&path).await.unwrap_err();
        assert!(matches!(
            err,
            dd_core::QueueError::Validation(ValidationError::PromptRequired)
        ));
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let paths = list_record_paths(&dir.path().join("absent")).await.unwrap();
        assert!(paths.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_skips_unparseable_files() {
        let dir = TempDir::new().unwrap();
        write_record(dir.path(), &sample_record()).await.unwrap();
        fs::write(dir.path().join("junk.json"), "not json")
            .await
            .unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored")
            .await
            .unwrap();

        let records = read_all_records(dir.path()).await.unwrap();
        assert_eq!(records.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_is_tolerant_of_missing_file() {
        let dir = TempDir::new().unwrap();
        remove_record(&dir.path().join("gone.json")).await.unwrap();
    }
}
