pub mod cache;
mod conflict;
pub mod engine;
pub mod filter;
pub mod local;
pub mod local_watcher;
mod merge;
mod ops;
pub mod paths;
pub mod scheduler;
pub mod task;
mod transfer;
pub mod worker;

#[cfg(test)]
pub(crate) mod test_support;
