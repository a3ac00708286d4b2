// OTA Relay Engine - Core module structure
pub mod config;
pub mod events;
pub mod logging;
pub mod cli;
pub mod updater;

pub use config::{Config, ConfigStore};
pub use events::{Reporter, StatusEvent};
