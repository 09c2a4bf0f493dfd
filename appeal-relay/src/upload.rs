use std::path::Path;

use crate::error::FileError;
use crate::reader::FileFormat;

/// Default upload ceiling, 100 MiB.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 100 * 1024 * 1024;

/// Rejects a file before any parsing: the extension must be a supported format and
/// the size must be within `max_bytes`.
pub async fn admit(path: &Path, max_bytes: u64) -> Result<FileFormat, FileError> {
    let format = FileFormat::from_path(path)?;

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|source| FileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    if !metadata.is_file() {
        return Err(FileError::read(path, "not a regular file"));
    }
    if metadata.len() > max_bytes {
        return Err(FileError::TooLarge {
            path: path.to_path_buf(),
            size: metadata.len(),
            limit: max_bytes,
        });
    }

    Ok(format)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_admits_supported_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("appeals.CSV");
        std::fs::write(&path, "text,user_id,external_id,timestamp\n").unwrap();
        assert_eq!(
            admit(&path, DEFAULT_MAX_UPLOAD_BYTES).await.unwrap(),
            FileFormat::Csv
        );
    }

    #[tokio::test]
    async fn test_rejects_unknown_extension_without_reading() {
        // The file does not exist, so reaching the size check would be an Io error
        let err = admit(Path::new("/nonexistent/appeals.txt"), 10)
            .await
            .unwrap_err();
        assert!(matches!(err, FileError::UnsupportedFormat { .. }));
    }

    #[tokio::test]
    async fn test_rejects_oversized_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.json");
        std::fs::write(&path, vec![b' '; 64]).unwrap();

        match admit(&path, 63).await {
            Err(FileError::TooLarge { size, limit, .. }) => {
                assert_eq!(size, 64);
                assert_eq!(limit, 63);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(admit(&path, 64).await.is_ok());
    }
}
