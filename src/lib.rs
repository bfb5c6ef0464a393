// Allow dead code for items that are part of the public API but only used in tests
#![allow(dead_code)]

pub mod cancel;
pub mod config;
pub mod dialect;
pub mod entity;
pub mod error;
pub mod export;
pub mod logging;
pub mod resolver;
pub mod schema;
pub mod session;
pub mod traversal;

pub use cancel::CancellationToken;
pub use config::SubsetConfig;
pub use error::{Result, SubsetError};
