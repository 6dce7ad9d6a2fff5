//! File utility functions for download tasks.

use std::path::Path;

use crate::{Error, Result};

/// Ensure the output directory exists, creating it and any missing parents.
///
/// # Returns
/// * `Ok(())` - If the directory exists or was created successfully
/// * `Err(Error::Directory)` - If the directory could not be created
pub async fn ensure_output_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::directory(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_ensure_output_dir_creates_nested_directories() {
        let temp = TempDir::new().unwrap();
        let nested_dir = temp.path().join("level1").join("level2");

        assert!(!nested_dir.exists());
        ensure_output_dir(&nested_dir).await.unwrap();
        assert!(nested_dir.is_dir());
    }

    #[tokio::test]
    async fn test_ensure_output_dir_succeeds_for_existing_directory() {
        let temp = TempDir::new().unwrap();
        assert!(ensure_output_dir(temp.path()).await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_output_dir_fails_under_a_file() {
        let temp = TempDir::new().unwrap();
        let file = temp.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();

        let err = ensure_output_dir(&file.join("child")).await.unwrap_err();
        assert!(matches!(err, Error::Directory { .. }));
    }
}
