pub mod config;
pub mod domain;
pub mod error;
pub mod replay;
pub mod service;
pub mod storage;

pub use config::UsageConfig;
pub use error::{Result, UsageError};
pub use service::UsageService;
