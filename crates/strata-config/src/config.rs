//! Configuration structs with sensible defaults and RON persistence.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// File name of the persisted configuration inside the config directory.
const CONFIG_FILE: &str = "config.ron";

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Chunk geometry and spatial index settings.
    pub chunk: ChunkConfig,
    /// Eviction cache bounds.
    pub cache: CacheConfig,
    /// Background load/save worker pools.
    pub workers: WorkerConfig,
    /// Preload zone around observers.
    pub preload: PreloadConfig,
    /// Server process settings.
    pub server: ServerConfig,
    /// Debug/development settings.
    pub debug: DebugConfig,
}

/// Chunk geometry configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChunkConfig {
    /// Tiles per chunk edge. A chunk holds `tile_grid_dim²` tile bytes.
    pub tile_grid_dim: u32,
    /// Edge length of one spatial index cell, in world units.
    pub cell_size: f64,
    /// World units covered by one tile edge.
    pub world_units_per_tile: f64,
}

/// Eviction (recency) cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of inactive chunks kept in memory before the oldest is evicted.
    pub capacity: usize,
    /// Seconds an inactive chunk may stay cached before it is saved and dropped.
    pub ttl_secs: u64,
    /// Milliseconds between TTL sweeps.
    pub sweep_interval_ms: u64,
}

/// Background worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of load worker threads.
    pub load_workers: usize,
    /// Number of save worker threads.
    pub save_workers: usize,
    /// Capacity of the load queue. Requests beyond it are dropped.
    pub load_queue_capacity: usize,
    /// Capacity of the save queue. Saves beyond it run on the caller.
    pub save_queue_capacity: usize,
    /// Per-call timeout for storage reads, in milliseconds.
    pub load_timeout_ms: u64,
    /// Per-call timeout for storage writes, in milliseconds.
    pub save_timeout_ms: u64,
}

/// Preload zone configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PreloadConfig {
    /// Chebyshev radius, in chunks, kept preloaded around each observer.
    pub radius: u32,
}

/// Server process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Storage region this server reads and writes.
    pub region: String,
    /// Layers hosted by this process, one chunk manager each.
    pub layers: Vec<u32>,
    /// Number of ticks the scripted observer walk runs for.
    pub demo_ticks: u64,
    /// Milliseconds between simulation ticks.
    pub tick_ms: u64,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log level override (e.g., "debug", "info", "warn").
    pub log_level: String,
    /// Directory for JSON log files (debug builds only).
    pub log_dir: Option<PathBuf>,
}

// --- Default implementations ---

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            tile_grid_dim: 32,
            cell_size: 8.0,
            world_units_per_tile: 1.0,
        }
    }
}

impl ChunkConfig {
    /// World-space edge length of one chunk.
    pub fn chunk_world_size(&self) -> f64 {
        self.tile_grid_dim as f64 * self.world_units_per_tile
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 256,
            ttl_secs: 60,
            sweep_interval_ms: 1000,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        // Leave headroom for the tick thread.
        let cpus = num_cpus::get().max(2);
        Self {
            load_workers: (cpus / 2).max(1),
            save_workers: (cpus / 4).max(1),
            load_queue_capacity: 256,
            save_queue_capacity: 256,
            load_timeout_ms: 2000,
            save_timeout_ms: 5000,
        }
    }
}

impl Default for PreloadConfig {
    fn default() -> Self {
        Self { radius: 2 }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            region: "local".to_string(),
            layers: vec![0],
            demo_ticks: 200,
            tick_ms: 50,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: None,
        }
    }
}

/// Platform config directory for Strata (e.g. `~/.config/strata`), falling
/// back to the working directory when the platform has none.
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("strata"))
        .unwrap_or_else(|| PathBuf::from("."))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
            let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let config_path = config_dir.join(CONFIG_FILE);
        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(3)
            .separate_tuple_members(true)
            .enumerate_arrays(false);

        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(&config_path, serialized).map_err(ConfigError::WriteError)?;
        Ok(())
    }

    /// Hot-reload: returns `Some(new_config)` if the file changed, `None` otherwise.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);
        let contents = std::fs::read_to_string(&config_path).map_err(ConfigError::ReadError)?;
        let new_config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Rejects values the chunk manager cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk.tile_grid_dim == 0 {
            return Err(invalid("chunk.tile_grid_dim", "must be at least 1"));
        }
        if !(self.chunk.cell_size > 0.0) {
            return Err(invalid("chunk.cell_size", "must be positive"));
        }
        if !(self.chunk.world_units_per_tile > 0.0) {
            return Err(invalid("chunk.world_units_per_tile", "must be positive"));
        }
        if self.workers.load_workers == 0 {
            return Err(invalid("workers.load_workers", "must be at least 1"));
        }
        if self.workers.save_workers == 0 {
            return Err(invalid("workers.save_workers", "must be at least 1"));
        }
        if self.workers.load_queue_capacity == 0 {
            return Err(invalid("workers.load_queue_capacity", "must be at least 1"));
        }
        if self.workers.save_queue_capacity == 0 {
            return Err(invalid("workers.save_queue_capacity", "must be at least 1"));
        }
        if self.server.layers.is_empty() {
            return Err(invalid("server.layers", "at least one layer is required"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}
