pub mod config;
pub mod events;
pub mod history;
pub mod parser;
pub mod slug;
pub mod storage;
pub mod types;
pub mod watcher;
