pub mod config;
pub mod daemon;
pub mod storage;
pub mod sync;
