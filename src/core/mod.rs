pub mod cache;
pub mod git_ops;
pub mod list;
pub mod list_store;
pub mod log;
pub mod post;
pub mod protocol;
pub mod ranges;
pub mod repo;
pub mod social;
pub mod storage;
pub mod transport;
pub mod workspace;
