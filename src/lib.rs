pub mod bridge;
pub mod classifier;
pub mod completion;
pub mod config;
pub mod error;
pub mod gateway;
pub mod platform;
pub mod security;
pub mod stats;
pub mod tasks;
pub mod util;

pub use config::Config;
