pub mod config;
pub mod types;

pub use config::WardenConfig;
pub use types::*;
