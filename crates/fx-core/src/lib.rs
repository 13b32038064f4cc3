pub mod db;
pub mod error;
pub mod models;
pub mod store;

pub use error::FxCoreError;
pub use models::{Asset, Point};
