//! Command-line argument parsing for the Strata server.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// Strata server command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "strata-server", about = "Strata chunk server")]
pub struct CliArgs {
    /// Storage region.
    #[arg(long)]
    pub region: Option<String>,

    /// Layers to host (repeatable: `--layer 0 --layer 1`).
    #[arg(long = "layer")]
    pub layers: Vec<u32>,

    /// Preload radius in chunks.
    #[arg(long)]
    pub preload_radius: Option<u32>,

    /// Eviction cache capacity.
    #[arg(long)]
    pub cache_capacity: Option<usize>,

    /// Number of ticks to run the scripted observer walk.
    #[arg(long)]
    pub ticks: Option<u64>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Path to config directory (overrides default location).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Apply CLI overrides to a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(ref region) = args.region {
            self.server.region = region.clone();
        }
        if !args.layers.is_empty() {
            self.server.layers = args.layers.clone();
        }
        if let Some(radius) = args.preload_radius {
            self.preload.radius = radius;
        }
        if let Some(capacity) = args.cache_capacity {
            self.cache.capacity = capacity;
        }
        if let Some(ticks) = args.ticks {
            self.server.demo_ticks = ticks;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
