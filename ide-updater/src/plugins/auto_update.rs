use crate::download::move_replacing;
use crate::error::UpdaterError;
use crate::plugins::downloader::PluginDownloader;
use crate::plugins::installed::{InstalledPluginSource, PluginId};
use crate::plugins::repository::PluginRepository;
use crate::plugins::version::compare_versions;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_indicatif::span_ext::IndicatifSpanExt as _;

pub const AUTO_UPDATE_DIR: &str = "auto-update";
pub const MANIFEST_FILE: &str = "manifest.json";

/// A downloaded plugin update waiting to be applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedUpdate {
    pub plugin_path: PathBuf,
    pub update_filename: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AutoUpdateEvent {
    /// Plugins staged by the batch that just completed.
    Staged(Vec<(PluginId, String)>),
    /// Sent after every completed batch, staged or not.
    BatchFinished { staged: usize },
}

type Batch = Vec<PluginDownloader>;

struct Consumer {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Shared {
    enabled: AtomicBool,
    repository: Arc<dyn PluginRepository>,
    installed: Arc<dyn InstalledPluginSource>,
    directory: PathBuf,
    staged: parking_lot::Mutex<BTreeMap<PluginId, StagedUpdate>>,
    events: broadcast::Sender<AutoUpdateEvent>,
}

/// Downloads plugin updates in the background while auto-update is enabled.
///
/// Batches are processed one at a time in the order they were enqueued, and
/// plugins within a batch one after another. Turning auto-update off cancels
/// the running batch and throws away everything still queued.
pub struct AutoUpdateDownloadManager {
    shared: Arc<Shared>,
    sender: mpsc::UnboundedSender<Batch>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Batch>>>,
    consumer: tokio::sync::Mutex<Option<Consumer>>,
}

impl AutoUpdateDownloadManager {
    /// Create a disabled manager staging into `directory`, picking up the
    /// manifest a previous run left there.
    pub async fn new(
        repository: Arc<dyn PluginRepository>,
        installed: Arc<dyn InstalledPluginSource>,
        directory: PathBuf,
    ) -> Result<Self, UpdaterError> {
        let staged = load_manifest(&directory.join(MANIFEST_FILE)).await?;
        let (sender, receiver) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(64);

        Ok(Self {
            shared: Arc::new(Shared {
                enabled: AtomicBool::new(false),
                repository,
                installed,
                directory,
                staged: parking_lot::Mutex::new(staged),
                events,
            }),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            consumer: tokio::sync::Mutex::new(None),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(AtomicOrdering::SeqCst)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AutoUpdateEvent> {
        self.shared.events.subscribe()
    }

    pub fn staged(&self) -> BTreeMap<PluginId, StagedUpdate> {
        self.shared.staged.lock().clone()
    }

    pub fn enqueue(&self, batch: Vec<PluginDownloader>) {
        if batch.is_empty() {
            return;
        }

        tracing::debug!("Queueing {} plugin updates", batch.len());
        if self.sender.send(batch).is_err() {
            tracing::warn!("Auto-update queue is closed, dropping batch");
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn set_enabled(&self, enabled: bool) {
        let mut consumer = self.consumer.lock().await;
        let was_enabled = self.shared.enabled.swap(enabled, AtomicOrdering::SeqCst);

        if enabled {
            if consumer.as_ref().is_some_and(|c| !c.handle.is_finished()) {
                return;
            }

            tracing::debug!("Starting auto-update consumer");
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(consume(
                self.shared.clone(),
                self.receiver.clone(),
                cancel.clone(),
            ));
            *consumer = Some(Consumer { cancel, handle });
            return;
        }

        if let Some(running) = consumer.take() {
            running.cancel.cancel();
            if let Err(err) = running.handle.await {
                tracing::error!("Auto-update consumer failed: {}", err);
            }
        }

        if was_enabled {
            let mut receiver = self.receiver.lock().await;
            let mut dropped = 0;
            while receiver.try_recv().is_ok() {
                dropped += 1;
            }

            if dropped > 0 {
                tracing::debug!("Dropped {} queued auto-update batches", dropped);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.set_enabled(false).await;
    }
}

async fn consume(
    shared: Arc<Shared>,
    receiver: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Batch>>>,
    cancel: CancellationToken,
) {
    let mut receiver = receiver.lock().await;

    loop {
        let batch = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            batch = receiver.recv() => match batch {
                Some(v) => v,
                None => break,
            },
        };

        match shared.process_batch(batch, &cancel).await {
            Ok(staged) => {
                let _ = shared.events.send(AutoUpdateEvent::BatchFinished { staged });
            }
            Err(err) if err.is_cancellation() => {
                tracing::debug!("Auto-update batch stopped: {}", err);
                break;
            }
            Err(err) => tracing::error!("Auto-update batch failed: {}", err),
        }
    }
}

impl Shared {
    fn ensure_enabled(&self, cancel: &CancellationToken) -> Result<(), UpdaterError> {
        if cancel.is_cancelled() || !self.enabled.load(AtomicOrdering::SeqCst) {
            return Err(UpdaterError::AutoUpdateDisabled);
        }
        Ok(())
    }

    /// Whether `downloader` is covered by an update staged earlier, in this
    /// batch or a previous one.
    fn is_already_staged(
        &self,
        downloader: &PluginDownloader,
        staged_now: &BTreeMap<PluginId, StagedUpdate>,
    ) -> bool {
        let covers = |staged: &StagedUpdate| {
            compare_versions(&staged.version, &downloader.version) != Ordering::Less
        };

        staged_now.get(&downloader.plugin_id).is_some_and(covers)
            || self.staged.lock().get(&downloader.plugin_id).is_some_and(covers)
    }

    /// Stage every plugin of the batch. The manifest only changes once the
    /// whole batch went through.
    #[tracing::instrument(skip_all, fields(size = batch.len()))]
    async fn process_batch(
        &self,
        batch: Batch,
        cancel: &CancellationToken,
    ) -> Result<usize, UpdaterError> {
        let download_dir = tempfile::tempdir()?;
        let mut staged_now = BTreeMap::new();

        let span = tracing::Span::current();
        span.pb_set_length(batch.len() as u64);

        for mut downloader in batch {
            span.pb_inc(1);

            if self.is_already_staged(&downloader, &staged_now) {
                tracing::debug!(
                    "{} {} is already staged",
                    downloader.plugin_id,
                    downloader.version
                );
                continue;
            }

            self.ensure_enabled(cancel)?;

            let Some(installed) = self.installed.find(&downloader.plugin_id) else {
                tracing::debug!("{} is no longer installed", downloader.plugin_id);
                continue;
            };

            let prepared = downloader
                .prepare_to_install(self.repository.as_ref(), download_dir.path(), cancel)
                .await;

            match prepared {
                Ok(()) => {}
                Err(err) if err.is_cancellation() => return Err(UpdaterError::AutoUpdateDisabled),
                Err(err) => {
                    tracing::warn!("Failed to download {}: {}", downloader.plugin_id, err);
                    continue;
                }
            }

            let Some(downloaded) = downloader.prepared_file().map(Path::to_path_buf) else {
                continue;
            };

            self.ensure_enabled(cancel)?;

            let file_name = downloader.file_name();
            let destination = self.directory.join(&file_name);
            match move_replacing(&downloaded, &destination).await {
                Ok(true) => tracing::warn!("Replaced stale update file {}", destination.display()),
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!("Failed to stage {}: {}", downloader.plugin_id, err);
                    continue;
                }
            }

            tracing::info!("Staged {} {}", downloader.plugin_id, downloader.version);
            staged_now.insert(
                downloader.plugin_id.clone(),
                StagedUpdate {
                    plugin_path: installed.path,
                    update_filename: file_name,
                    version: downloader.version.clone(),
                },
            );
        }

        if staged_now.is_empty() {
            return Ok(0);
        }

        let summary = staged_now
            .iter()
            .map(|(id, staged)| (id.clone(), staged.version.clone()))
            .collect::<Vec<_>>();

        let snapshot = {
            let mut staged = self.staged.lock();
            staged.extend(staged_now);
            staged.clone()
        };

        save_manifest(&self.directory.join(MANIFEST_FILE), &snapshot).await?;

        let count = summary.len();
        let _ = self.events.send(AutoUpdateEvent::Staged(summary));
        Ok(count)
    }
}

async fn load_manifest(path: &Path) -> Result<BTreeMap<PluginId, StagedUpdate>, UpdaterError> {
    let data = match tokio::fs::read(path).await {
        Ok(v) => v,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
        Err(err) => return Err(err.into()),
    };

    let staged: BTreeMap<PluginId, StagedUpdate> = serde_json::from_slice(&data)?;
    tracing::debug!("Loaded {} staged updates from {}", staged.len(), path.display());
    Ok(staged)
}

async fn save_manifest(
    path: &Path,
    staged: &BTreeMap<PluginId, StagedUpdate>,
) -> Result<(), UpdaterError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let data = serde_json::to_vec_pretty(staged)?;
    let temporary = path.with_extension("json.tmp");
    tokio::fs::write(&temporary, data).await?;
    tokio::fs::rename(&temporary, path).await?;
    Ok(())
}
