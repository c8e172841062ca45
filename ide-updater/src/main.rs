mod api;
mod args;
mod download;
mod error;
mod platform;
mod plugins;
mod settings;

use crate::api::RepositoryApi;
use crate::args::{Command, UpdaterArgs};
use crate::error::UpdaterError;
use crate::platform::cache::MetadataCache;
use crate::platform::model::ChannelLicensing;
use crate::platform::patches::download_patch_chain;
use crate::platform::resolver::{DefaultUpdatePolicy, PlatformUpdateResult};
use crate::plugins::aggregator::{DefaultPluginUpdatePolicy, PluginRepositoryAggregator};
use crate::plugins::auto_update::{AUTO_UPDATE_DIR, AutoUpdateDownloadManager, AutoUpdateEvent};
use crate::plugins::installed::{INSTALLED_PLUGINS_FILE, InstalledPlugins};
use crate::plugins::session::{DownloadSessionRegistry, UpdateSessionService};
use crate::settings::{LineSetFile, UpdateSettings};
use clap::Parser as _;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

fn main() {
    let indicatif_layer = tracing_indicatif::IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_env("IDE_UPDATER_LOG"))
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(indicatif_layer)
        .init();

    let args = args::UpdaterArgs::parse();

    let result = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(v) => v.block_on(async_main(args)),
        Err(err) => {
            tracing::error!("Failed to create tokio runtime: {:?}", err);
            std::process::exit(1);
        }
    };

    if let Err(err) = result {
        tracing::error!("Error: {:?}", err);
        std::process::exit(1);
    }
}

/// Services shared by all subcommands.
struct Updater {
    args: UpdaterArgs,
    api: Arc<RepositoryApi>,
    installed: Arc<InstalledPlugins>,
    settings: UpdateSettings,
    cancel: CancellationToken,
}

async fn async_main(args: UpdaterArgs) -> Result<(), UpdaterError> {
    tracing::trace!("args = {:#?}", args);

    tokio::fs::create_dir_all(&args.config_dir).await?;

    let api = Arc::new(RepositoryApi::new(&args)?);
    let installed =
        Arc::new(InstalledPlugins::load(&args.config_dir.join(INSTALLED_PLUGINS_FILE)).await?);

    let settings = UpdateSettings {
        selected_channel: args.channel,
        ignored_builds: LineSetFile::ignored_builds(&args.config_dir)
            .load()
            .await?
            .into_iter()
            .collect(),
        ..UpdateSettings::default()
    };

    let updater = Updater {
        args,
        api,
        installed,
        settings,
        cancel: CancellationToken::new(),
    };

    match updater.args.command.clone() {
        Command::Check { target_build } => {
            updater.report_platform_update().await;

            let service = updater.session_service(updater.args.config_dir.join("downloads"));
            let model = service
                .check(target_build, &session_id(), &updater.cancel)
                .await?;

            println!("{}", serde_json::to_string_pretty(&model)?);
        }
        Command::Update { output_directory } => {
            let service = updater.session_service(output_directory);
            let session = session_id();

            let model = service.check(None, &session, &updater.cancel).await?;
            let selected = model
                .not_ignored_updates
                .iter()
                .map(|update| update.id.clone())
                .collect();

            let report = service.install(&session, &selected, &updater.cancel).await?;
            for (id, path) in &report.prepared {
                tracing::info!("{} -> {}", id, path.display());
            }
            for (id, err) in &report.failed {
                tracing::error!("Failed to download {}: {}", id, err);
            }

            tracing::info!(
                "Downloaded {} plugin updates, {} failed",
                report.prepared.len(),
                report.failed.len()
            );
        }
        Command::Ignore => {
            let service = updater.session_service(updater.args.config_dir.join("downloads"));
            let session = session_id();

            service.check(None, &session, &updater.cancel).await?;
            let ignored = service.ignore(&session).await?;

            tracing::info!("Ignoring {} plugin updates from now on", ignored);
        }
        Command::AutoUpdate => updater.auto_update().await?,
        Command::Patches {
            patches_url,
            output_directory,
        } => updater.download_patches(&patches_url, output_directory).await?,
    }

    tracing::info!("Done.");

    Ok(())
}

fn session_id() -> String {
    format!("cli-{}", std::process::id())
}

impl Updater {
    async fn platform_update(&self) -> PlatformUpdateResult {
        let cache = MetadataCache::new(
            self.api.clone(),
            Duration::from_secs(self.args.metadata_ttl_secs),
        );

        platform::check_platform_update(
            &cache,
            &self.args.metadata_url,
            &self.args.product_code,
            &self.args.current_build,
            &self.settings,
            &DefaultUpdatePolicy,
            &self.cancel,
        )
        .await
    }

    async fn report_platform_update(&self) {
        match self.platform_update().await {
            PlatformUpdateResult::Empty => tracing::info!("No platform update available"),
            PlatformUpdateResult::Loaded {
                new_build,
                channel,
                chain,
            } => {
                tracing::info!(
                    "Platform update {} ({}) available on channel {} ({})",
                    new_build.number,
                    new_build.version,
                    channel.id,
                    channel.status
                );

                if let Some(date) = new_build.release_date {
                    tracing::info!("Released on {}", date);
                }
                if channel.licensing == ChannelLicensing::Eap {
                    match channel.eval_days {
                        Some(days) => tracing::info!("EAP build, evaluation period of {} days", days),
                        None => tracing::info!("EAP build"),
                    }
                }
                if let Some(url) = &channel.url {
                    tracing::info!("Channel page: {}", url);
                }
                if let Some(message) = &new_build.message {
                    tracing::info!("{}", message.trim());
                }
                if let Some(blog) = new_build.blog_url() {
                    tracing::info!("Release notes: {}", blog);
                }

                match chain {
                    Some(chain) => tracing::info!(
                        "Patch chain {} (size {})",
                        chain
                            .builds
                            .iter()
                            .map(ToString::to_string)
                            .collect::<Vec<_>>()
                            .join(" -> "),
                        chain.size.as_deref().unwrap_or("unknown")
                    ),
                    None => tracing::info!("No patch available, a full download is required"),
                }

                if let Some(url) = new_build.download_url() {
                    tracing::info!("Download: {}", url);
                }
            }
            PlatformUpdateResult::ConnectionError { cause } => {
                tracing::warn!("Could not check for platform updates: {}", cause)
            }
        }
    }

    fn aggregator(&self) -> PluginRepositoryAggregator {
        PluginRepositoryAggregator::new(
            self.api.clone(),
            self.args.repositories.clone(),
            Arc::new(DefaultPluginUpdatePolicy),
        )
    }

    fn session_service(&self, install_dir: PathBuf) -> UpdateSessionService {
        let registry = DownloadSessionRegistry::new(
            self.args.session_ttl_secs.map(Duration::from_secs),
        );

        UpdateSessionService::new(
            self.aggregator(),
            self.api.clone(),
            self.installed.clone(),
            Arc::new(registry),
            LineSetFile::ignored_plugins(&self.args.config_dir),
            self.args.current_build.clone(),
            install_dir,
        )
    }

    async fn auto_update(&self) -> Result<(), UpdaterError> {
        let service = self.session_service(self.args.config_dir.join("downloads"));
        let session = session_id();

        service.check(None, &session, &self.cancel).await?;
        let batch = service.registry().get_all(&session).unwrap_or_default();
        service.registry().delete_session(&session);

        let manager = AutoUpdateDownloadManager::new(
            self.api.clone(),
            self.installed.clone(),
            self.args.config_dir.join(AUTO_UPDATE_DIR),
        )
        .await?;

        if batch.is_empty() {
            tracing::info!("No plugin updates to stage");
        } else {
            let mut events = manager.subscribe();
            if !manager.is_enabled() {
                manager.set_enabled(true).await;
            }
            manager.enqueue(batch);

            loop {
                match events.recv().await {
                    Ok(AutoUpdateEvent::Staged(plugins)) => {
                        for (id, version) in plugins {
                            tracing::info!("Staged {} {}", id, version);
                        }
                    }
                    Ok(AutoUpdateEvent::BatchFinished { .. }) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("Missed {} auto-update events", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }

            manager.shutdown().await;
        }

        println!("{}", serde_json::to_string_pretty(&manager.staged())?);

        Ok(())
    }

    async fn download_patches(
        &self,
        patches_url: &reqwest::Url,
        output_directory: PathBuf,
    ) -> Result<(), UpdaterError> {
        let (new_build, chain) = match self.platform_update().await {
            PlatformUpdateResult::Loaded {
                new_build,
                chain: Some(chain),
                ..
            } => (new_build, chain),
            PlatformUpdateResult::Loaded { new_build, .. } => {
                tracing::info!("No patch chain to {}, a full download is required", new_build.number);
                return Ok(());
            }
            PlatformUpdateResult::Empty => {
                tracing::info!("No platform update available");
                return Ok(());
            }
            PlatformUpdateResult::ConnectionError { cause } => return Err(cause),
        };

        tracing::info!("Downloading patches to {}", new_build.number);

        let downloads = download_patch_chain(
            self.api.as_ref(),
            patches_url,
            &self.args.product_code,
            &chain,
            self.settings.os,
            &output_directory,
            &self.cancel,
        )
        .await?;

        let mut failures = 0;
        for download in &downloads {
            match &download.result {
                Ok(path) => tracing::info!("{} -> {}: {}", download.from, download.to, path.display()),
                Err(err) => {
                    failures += 1;
                    tracing::error!("{} -> {}: {}", download.from, download.to, err);
                }
            }
        }

        if failures > 0 {
            tracing::warn!("{} of {} patches failed", failures, downloads.len());
        }

        Ok(())
    }
}
