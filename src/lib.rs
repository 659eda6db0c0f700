pub mod config;
pub mod core;
pub mod error;

pub use crate::config::types::SocialConfig;
pub use crate::core::list::List;
pub use crate::core::post::{Post, PostQuery, Scope};
pub use crate::core::transport::{Git2Transport, GitCliTransport, Transport};
pub use crate::core::workspace::Workspace;
pub use crate::error::{ErrorCode, Outcome, Result, SocialError};
