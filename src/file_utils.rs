use std::path::Path;

use anyhow::Result;
use log::warn;
use tokio::fs::{self, File};
use tokio::io::AsyncReadExt;

use crate::error::DownloadError;

/// Hardlink src to dst, falling back to a full copy when linking is not
/// possible (cross-device, or a filesystem without link support).
pub async fn link_or_copy(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::hard_link(src, dst).await.is_ok() {
        return Ok(());
    }
    warn!("link {:?} -> {:?} failed, copying instead", src, dst);
    fs::copy(src, dst).await?;
    Ok(())
}

/// Move src to dst. Rename first; on failure (typically EXDEV) copy and
/// remove the original.
pub async fn move_file(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).await?;
    }
    if fs::rename(src, dst).await.is_ok() {
        return Ok(());
    }
    fs::copy(src, dst)
        .await
        .map_err(|e| DownloadError::Move(format!("{:?} -> {:?}: {}", src, dst, e)))?;
    fs::remove_file(src).await.ok();
    Ok(())
}

/// Verify the md5 of a file against the expected lowercase hex digest.
pub async fn verify_md5(path: &Path, expected: &str) -> Result<()> {
    let mut file = File::open(path).await?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    let actual = format!("{:x}", context.compute());
    if actual != expected.to_lowercase() {
        return Err(DownloadError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    async fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, content).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_link_or_copy_same_fs() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "src.bin", b"payload").await;
        let dst = dir.path().join("dst.bin");

        link_or_copy(&src, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_move_file_renames() {
        let dir = tempfile::tempdir().unwrap();
        let src = write_file(dir.path(), "src.bin", b"payload").await;
        let dst = dir.path().join("nested").join("dst.bin");

        move_file(&src, &dst).await.unwrap();
        assert_eq!(fs::read(&dst).await.unwrap(), b"payload");
        assert!(fs::metadata(&src).await.is_err(), "source removed");
    }

    #[tokio::test]
    async fn test_verify_md5_accepts_and_rejects() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f.bin", b"12345678").await;
        let good = format!("{:x}", md5::compute(b"12345678"));

        verify_md5(&path, &good).await.unwrap();
        verify_md5(&path, &good.to_uppercase()).await.unwrap();
        assert!(
            verify_md5(&path, "00000000000000000000000000000000")
                .await
                .is_err()
        );
    }
}
