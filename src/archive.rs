//! Archive intake: persist an uploaded UFDR bundle and unpack it into an
//! isolated workspace.
//!
//! Failures here are the only caller-visible failures of an ingestion run;
//! everything downstream is isolated per source or per record.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::config::StorageConfig;

/// Archive-level failure, raised before any ledger write happens.
#[derive(Debug)]
pub enum ArchiveError {
    /// The bundle is not a readable zip archive.
    Format(String),
    /// The archive could not be written to the uploads directory.
    Persistence(String),
    /// The uploads volume is out of space.
    StorageFull(String),
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Format(e) => write!(f, "archive is corrupt or not a valid ZIP: {}", e),
            ArchiveError::Persistence(e) => write!(f, "failed to persist archive: {}", e),
            ArchiveError::StorageFull(e) => write!(f, "uploads storage is full: {}", e),
        }
    }
}

impl std::error::Error for ArchiveError {}

/// Save archive bytes under a unique name and create a matching, freshly
/// emptied extraction directory. Returns `(archive_path, extraction_dir)`.
pub fn persist_archive(
    storage: &StorageConfig,
    bytes: &[u8],
    original_name: &str,
) -> Result<(PathBuf, PathBuf), ArchiveError> {
    std::fs::create_dir_all(&storage.uploads_dir)
        .map_err(|e| ArchiveError::Persistence(e.to_string()))?;
    std::fs::create_dir_all(&storage.extracted_dir)
        .map_err(|e| ArchiveError::Persistence(e.to_string()))?;

    let unique_id = Uuid::new_v4().simple().to_string();
    let file_name = if original_name.is_empty() {
        format!("{unique_id}.ufdr")
    } else {
        format!("{unique_id}_{original_name}")
    };
    let archive_path = storage.uploads_dir.join(file_name);
    let extraction_dir = storage.extracted_dir.join(&unique_id);

    if let Err(e) = File::create(&archive_path).and_then(|mut f| f.write_all(bytes)) {
        let _ = std::fs::remove_file(&archive_path);
        return Err(if is_storage_full(&e) {
            ArchiveError::StorageFull(e.to_string())
        } else {
            ArchiveError::Persistence(e.to_string())
        });
    }

    if extraction_dir.exists() {
        std::fs::remove_dir_all(&extraction_dir)
            .map_err(|e| ArchiveError::Persistence(e.to_string()))?;
    }
    std::fs::create_dir_all(&extraction_dir)
        .map_err(|e| ArchiveError::Persistence(e.to_string()))?;

    Ok((archive_path, extraction_dir))
}

fn is_storage_full(err: &std::io::Error) -> bool {
    // ENOSPC; io::ErrorKind::StorageFull is still unstable on some toolchains.
    err.raw_os_error() == Some(28)
}

/// Unpack the archive into the extraction directory. A corrupt zip is
/// rejected here, before any classification or ledger write.
pub fn extract_archive(archive_path: &Path, extraction_dir: &Path) -> Result<(), ArchiveError> {
    let file = File::open(archive_path).map_err(|e| ArchiveError::Persistence(e.to_string()))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| ArchiveError::Format(e.to_string()))?;
    archive
        .extract(extraction_dir)
        .map_err(|e| ArchiveError::Format(e.to_string()))?;
    Ok(())
}
