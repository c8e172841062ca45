pub mod aggregator;
pub mod auto_update;
pub mod downloader;
pub mod installed;
pub mod repository;
pub mod session;
pub mod version;
