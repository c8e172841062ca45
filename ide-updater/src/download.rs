use crate::error::UpdaterError;
use async_trait::async_trait;
use reqwest::Url;
use std::path::Path;

#[async_trait]
pub trait FileDownloader: Send + Sync {
    /// Download `url` into the file at `destination`, replacing it.
    async fn download_file(&self, url: &Url, destination: &Path) -> Result<(), UpdaterError>;
}

/// Last path segment of `url` if it is a usable file name.
pub fn file_name_from_url(url: &Url, fallback: &str) -> String {
    url.path_segments()
        .and_then(|mut segments| segments.next_back())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .map(ToOwned::to_owned)
        .unwrap_or_else(|| fallback.to_owned())
}

/// Move `source` to `destination`, overwriting an existing file.
///
/// Returns whether a file was replaced.
pub async fn move_replacing(source: &Path, destination: &Path) -> Result<bool, UpdaterError> {
    if let Some(parent) = destination.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let replaced = tokio::fs::try_exists(destination).await?;
    if replaced {
        tokio::fs::remove_file(destination).await?;
    }

    if let Err(err) = tokio::fs::rename(source, destination).await {
        // Renaming fails across file systems, fall back to copying.
        tracing::debug!("Rename failed ({}), copying {} instead", err, source.display());
        tokio::fs::copy(source, destination).await?;
        tokio::fs::remove_file(source).await?;
    }

    Ok(replaced)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_taken_from_last_segment() {
        let url = Url::parse("https://example.com/files/plugin-1.2.zip").unwrap();
        assert_eq!(file_name_from_url(&url, "fallback.zip"), "plugin-1.2.zip");

        let url = Url::parse("https://example.com/files/").unwrap();
        assert_eq!(file_name_from_url(&url, "fallback.zip"), "fallback.zip");
    }

    #[tokio::test]
    async fn moving_replaces_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("download.tmp");
        let destination = dir.path().join("staged").join("plugin.zip");

        tokio::fs::write(&source, b"first").await.unwrap();
        assert!(!move_replacing(&source, &destination).await.unwrap());

        tokio::fs::write(&source, b"second").await.unwrap();
        assert!(move_replacing(&source, &destination).await.unwrap());

        assert_eq!(tokio::fs::read(&destination).await.unwrap(), b"second");
        assert!(!source.exists());
    }
}
