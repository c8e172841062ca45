use crate::platform::build_number::BuildNumber;
use crate::platform::cache::DEFAULT_METADATA_TTL;
use crate::platform::model::ChannelStatus;
use clap::{Parser, Subcommand};
use reqwest::Url;
use std::num::NonZeroUsize;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(version, about = "Check, download and stage IDE platform and plugin updates")]
pub struct UpdaterArgs {
    /// Directory holding ignore lists, installed plugins and staged updates.
    #[arg(short, long, default_value = "ide-updater", env = "IDE_UPDATER_CONFIG_DIR")]
    pub config_dir: PathBuf,

    #[arg(
        long,
        default_value = "https://www.jetbrains.com/updates/updates.xml",
        env = "IDE_UPDATER_METADATA_URL"
    )]
    pub metadata_url: Url,

    #[arg(long, default_value = "IU", env = "IDE_UPDATER_PRODUCT_CODE")]
    pub product_code: String,

    /// Build number of the running installation, e.g. `IU-241.15989.150`.
    #[arg(short = 'b', long, env = "IDE_UPDATER_CURRENT_BUILD")]
    pub current_build: BuildNumber,

    /// Least stable channel tier to consider.
    #[arg(long, default_value = "release")]
    pub channel: ChannelStatus,

    /// Custom plugin repository, may be given multiple times.
    #[arg(long = "repository")]
    pub repositories: Vec<Url>,

    #[arg(long, default_value = "https://plugins.jetbrains.com/")]
    pub marketplace_url: Url,

    #[arg(long, default_value = "16")]
    pub max_parallel_requests: NonZeroUsize,

    #[arg(long, default_value = "4")]
    pub max_parallel_downloads: NonZeroUsize,

    #[arg(long, default_value_t = DEFAULT_METADATA_TTL.as_secs())]
    pub metadata_ttl_secs: u64,

    /// Drop download sessions older than this. Sessions never expire if unset.
    #[arg(long)]
    pub session_ttl_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Print the available platform update and plugin updates.
    Check {
        /// Check plugin compatibility against this build instead of the current one.
        #[arg(long)]
        target_build: Option<BuildNumber>,
    },

    /// Download all plugin updates that are not ignored.
    Update {
        /// Directory the plugin archives are placed in.
        #[arg(short, long, default_value = "plugin-updates")]
        output_directory: PathBuf,
    },

    /// Ignore all currently offered plugin updates.
    Ignore,

    /// Stage plugin updates in the background download directory.
    AutoUpdate,

    /// Download the patch chain to the newest platform build.
    Patches {
        #[arg(long, default_value = "https://download.jetbrains.com/idea/")]
        patches_url: Url,

        #[arg(short, long, default_value = "patches")]
        output_directory: PathBuf,
    },
}
