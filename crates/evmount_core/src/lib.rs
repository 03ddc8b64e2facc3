pub mod config;
pub mod cow;
mod error;
pub mod ewf;
mod image;
pub mod stats;
mod traits;

pub use config::{CacheOptions, WriteCacheOptions};
pub use cow::{CowStore, ImageIdentity};
pub use error::{CoreError, Result};
pub use ewf::EwfImage;
pub use image::ImageAccess;
pub use stats::CacheStats;
pub use traits::BlockSource;
