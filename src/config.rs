//! Runtime tuning for the file-access layer.
//!
//! Settings are layered with figment: built-in defaults, then an optional
//! TOML file, then `TORRENTFS_`-prefixed environment variables. Durations
//! are expressed as fractional seconds.

use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Lifetime of a torrent's cached status snapshot.
    pub info_cache_time: f64,
    /// Lifetime of the cached daemon capability snapshot.
    pub server_info_cache_time: f64,
    /// Delay between forced refreshes while reads wait for pieces.
    pub info_poll_interval: f64,
    /// Period of the backend's capability and settings poll.
    pub server_info_poll_interval: f64,
    /// How long to wait for the daemon to confirm a cache flush.
    pub cache_flush_timeout: f64,
    /// Default per-piece wait for reads; `None` waits indefinitely.
    pub piece_timeout: Option<f64>,
    /// Readahead window in pieces.
    pub readahead_pieces: usize,
    /// Readahead window in bytes.
    pub readahead_bytes: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            info_cache_time: 1.0,
            server_info_cache_time: 10.0,
            info_poll_interval: 0.5,
            server_info_poll_interval: 15.0,
            cache_flush_timeout: 10.0,
            piece_timeout: None,
            readahead_pieces: 4,
            readahead_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Loads settings from defaults, `path` (if it exists) and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment.merge(Env::prefixed("TORRENTFS_")).extract()
    }

    pub fn info_cache_time(&self) -> Duration {
        secs(self.info_cache_time)
    }

    pub fn server_info_cache_time(&self) -> Duration {
        secs(self.server_info_cache_time)
    }

    pub fn info_poll_interval(&self) -> Duration {
        secs(self.info_poll_interval)
    }

    pub fn server_info_poll_interval(&self) -> Duration {
        secs(self.server_info_poll_interval)
    }

    pub fn cache_flush_timeout(&self) -> Duration {
        secs(self.cache_flush_timeout)
    }

    pub fn piece_timeout(&self) -> Option<Duration> {
        self.piece_timeout.map(secs)
    }

    /// Number of pieces past the last read piece to request early.
    pub fn readahead_window(&self, piece_length: u64) -> usize {
        let by_bytes = if piece_length == 0 {
            0
        } else {
            (self.readahead_bytes / piece_length) as usize
        };
        self.readahead_pieces.max(by_bytes)
    }
}

// Negative or NaN values from user config collapse to zero.
fn secs(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or(Duration::ZERO)
}
