//! Configuration system for the Strata world server.
//!
//! Settings persist to disk as RON files, can be overridden from the command
//! line via clap, and support hot-reload detection. Unknown fields are
//! ignored and missing sections fall back to their defaults.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{
    CacheConfig, ChunkConfig, Config, DebugConfig, PreloadConfig, ServerConfig, WorkerConfig,
    default_config_dir,
};
pub use error::ConfigError;
