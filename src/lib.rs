//! HTTP gateway that hands uploaded images to external programs and returns
//! the result as a link or a download.

pub mod config;
pub mod delivery;
pub mod error;
pub mod job;
pub mod models;
pub mod processor;
pub mod routes;
pub mod storage;
pub mod upload;

pub use config::Config;
pub use error::AppError;
pub use routes::{router, AppState};
