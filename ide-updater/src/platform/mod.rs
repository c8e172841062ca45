pub mod build_number;
pub mod cache;
pub mod model;
pub mod parser;
pub mod patches;
pub mod resolver;

use crate::platform::build_number::BuildNumber;
use crate::platform::cache::MetadataCache;
use crate::platform::resolver::{PlatformUpdateResult, UpdatePolicy};
use crate::settings::UpdateSettings;
use reqwest::Url;
use tokio_util::sync::CancellationToken;

/// Fetch (or reuse) the update metadata and resolve the platform update.
///
/// Fetch failures never escape: they are reported as
/// [`PlatformUpdateResult::ConnectionError`].
#[tracing::instrument(skip_all, fields(url = url.as_str(), current = %current))]
pub async fn check_platform_update(
    cache: &MetadataCache,
    url: &Url,
    product_code: &str,
    current: &BuildNumber,
    settings: &UpdateSettings,
    policy: &dyn UpdatePolicy,
    cancel: &CancellationToken,
) -> PlatformUpdateResult {
    let info = match cache.get(url, cancel).await {
        Ok(v) => v,
        Err(cause) => {
            if cause.is_cancellation() {
                tracing::debug!("Platform update check was cancelled");
            } else {
                tracing::warn!("Failed to load update metadata: {}", cause);
            }
            return PlatformUpdateResult::ConnectionError { cause };
        }
    };

    let product = info.product(product_code);
    match product {
        Some(product) => tracing::debug!(
            disable_machine_id = product.disable_machine_id,
            "Resolving updates of {}",
            product.name
        ),
        None => tracing::debug!("No product {} in update metadata", product_code),
    }

    resolver::resolve(current, product, settings, policy)
}
