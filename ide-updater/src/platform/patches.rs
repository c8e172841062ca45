use crate::download::FileDownloader;
use crate::error::UpdaterError;
use crate::platform::build_number::BuildNumber;
use crate::platform::model::TargetOs;
use crate::platform::resolver::UpdateChain;
use reqwest::Url;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

/// Entries every patch archive has to contain.
pub const REQUIRED_PATCH_ENTRIES: &[&str] = &["META-INF/MANIFEST.MF", "patch-file.zip"];

#[derive(Debug)]
pub struct PatchDownload {
    pub from: BuildNumber,
    pub to: BuildNumber,
    pub result: Result<PathBuf, UpdaterError>,
}

pub fn patch_file_name(product_code: &str, from: &BuildNumber, to: &BuildNumber, os: TargetOs) -> String {
    format!(
        "{}-{}-{}-patch-{}.jar",
        product_code,
        from.as_string_without_product_code(),
        to.as_string_without_product_code(),
        os.code()
    )
}

/// Download every patch of `chain` into `directory`.
///
/// A broken or missing patch only fails its own entry.
#[tracing::instrument(skip_all, fields(hops = chain.builds.len().saturating_sub(1)))]
pub async fn download_patch_chain(
    downloader: &dyn FileDownloader,
    base_url: &Url,
    product_code: &str,
    chain: &UpdateChain,
    os: TargetOs,
    directory: &Path,
    cancel: &CancellationToken,
) -> Result<Vec<PatchDownload>, UpdaterError> {
    tokio::fs::create_dir_all(directory).await?;

    let mut downloads = Vec::with_capacity(chain.builds.len().saturating_sub(1));

    for hop in chain.builds.windows(2) {
        if cancel.is_cancelled() {
            return Err(UpdaterError::Cancelled);
        }

        let (from, to) = (&hop[0], &hop[1]);
        let file_name = patch_file_name(product_code, from, to, os);
        let destination = directory.join(&file_name);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpdaterError::Cancelled),
            result = download_patch(downloader, base_url, &file_name, &destination) => result,
        };

        match &result {
            Ok(_) => tracing::info!("Downloaded patch {} -> {}", from, to),
            Err(err) => tracing::warn!("Failed to download patch {} -> {}: {}", from, to, err),
        }

        downloads.push(PatchDownload {
            from: from.clone(),
            to: to.clone(),
            result,
        });
    }

    Ok(downloads)
}

async fn download_patch(
    downloader: &dyn FileDownloader,
    base_url: &Url,
    file_name: &str,
    destination: &Path,
) -> Result<PathBuf, UpdaterError> {
    let url = base_url
        .join(file_name)
        .map_err(|e| UpdaterError::MalformedMetadata(format!("bad patch url: {}", e)))?;

    downloader.download_file(&url, destination).await?;

    let path = destination.to_owned();
    let checked = path.clone();
    tokio::task::spawn_blocking(move || verify_patch_archive(&checked)).await??;

    Ok(path)
}

/// Check that `path` is a readable archive with all required entries.
pub fn verify_patch_archive(path: &Path) -> Result<(), UpdaterError> {
    let file = std::fs::File::open(path)?;
    let mut archive = zip::ZipArchive::new(file)?;

    for entry in REQUIRED_PATCH_ENTRIES {
        if archive.by_name(entry).is_err() {
            return Err(UpdaterError::CorruptedPatch {
                file: path.display().to_string(),
                entry: (*entry).to_owned(),
            });
        }
    }

    Ok(())
}
