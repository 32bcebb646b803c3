pub mod engine;
#[cfg(feature = "file-watcher")]
pub mod file_watcher;
pub mod self_write;
pub mod types;
