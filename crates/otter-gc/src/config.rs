//! Collector configuration.
//!
//! `GcConfig::default()` is usable as-is. Embedders can override entries
//! from the environment:
//!
//! ```text
//! OTTER_GC_PARAMS=nursery-size=4m,section-size=2m,workers=3,major=copying
//! OTTER_GC_DEBUG=check-at-minor-collections,check-at-major-collections
//! ```

use std::time::Duration;

use crate::backend::BackendKind;
use crate::error::{ConfigError, OomCallback};
use crate::pinned_chunk::MAX_SLOT_SIZE;

/// Environment variable holding `key=value` collector parameters.
pub const PARAMS_ENV: &str = "OTTER_GC_PARAMS";
/// Environment variable holding debug switches.
pub const DEBUG_ENV: &str = "OTTER_GC_DEBUG";

/// Smallest accepted nursery.
pub const MIN_NURSERY_SIZE: usize = 64 * 1024;
/// Smallest accepted major-heap section.
pub const MIN_SECTION_SIZE: usize = 64 * 1024;
/// Upper bound on collector worker threads.
pub const MAX_WORKERS: usize = 63;

/// How mutator threads are stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendMode {
    /// Asynchronous suspension with POSIX signals (Linux only).
    Signals,
    /// Mutators park themselves at poll points.
    Safepoints,
}

impl Default for SuspendMode {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            SuspendMode::Signals
        } else {
            SuspendMode::Safepoints
        }
    }
}

/// GC configuration
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Nursery size in bytes, a power of two (default: 1MB)
    pub nursery_size: usize,
    /// Major heap section size in bytes, a power of two (default: 1MB)
    pub section_size: usize,
    /// Objects above this size go to the large object space (default: 8KB)
    pub large_object_threshold: usize,
    /// log2 of the card size (default: 9, 512-byte cards)
    pub card_bits: u32,
    /// log2 of the number of cards in the table (default: 20)
    pub card_count_bits: u32,
    /// Collector threads in addition to the thread driving the cycle
    pub workers: usize,
    /// LOS growth that forces a major collection (default: 2 x nursery)
    pub los_collection_target: usize,
    /// Hard cap on committed heap memory
    pub max_heap_size: Option<usize>,
    /// Suspension attempts per thread before aborting
    pub suspend_attempts: u32,
    /// How long one suspension attempt waits for an acknowledgement
    pub suspend_timeout: Duration,
    /// Thread suspension mechanism
    pub suspend_mode: SuspendMode,
    /// Collector backend
    pub backend: BackendKind,
    /// Run the heap checker after every minor collection
    pub verify_at_minor: bool,
    /// Run the heap checker after every major collection
    pub verify_at_major: bool,
    /// Called before aborting on out-of-memory
    pub on_out_of_memory: Option<OomCallback>,
}

impl Default for GcConfig {
    fn default() -> Self {
        let nursery_size = 1024 * 512 * 2;
        Self {
            nursery_size,
            section_size: 1024 * 1024,
            large_object_threshold: MAX_SLOT_SIZE,
            card_bits: 9,
            card_count_bits: 20,
            workers: default_workers(),
            los_collection_target: nursery_size * 2,
            max_heap_size: None,
            suspend_attempts: 8,
            suspend_timeout: Duration::from_millis(250),
            suspend_mode: SuspendMode::default(),
            backend: BackendKind::CopyingMajor,
            verify_at_minor: false,
            verify_at_major: false,
            on_out_of_memory: None,
        }
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1))
        .unwrap_or(0)
        .min(7)
}

impl GcConfig {
    /// Defaults overridden by `OTTER_GC_PARAMS` and `OTTER_GC_DEBUG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(params) = std::env::var(PARAMS_ENV) {
            config.parse_params(&params)?;
        }
        if let Ok(debug) = std::env::var(DEBUG_ENV) {
            config.apply_debug(&debug)?;
        }
        config.validate()?;
        Ok(config)
    }

    /// Apply comma-separated `key=value` parameters.
    pub fn parse_params(&mut self, params: &str) -> Result<(), ConfigError> {
        for entry in params.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((key, value)) = entry.split_once('=') else {
                return Err(ConfigError::UnknownOption(entry.to_string()));
            };
            let (key, value) = (key.trim(), value.trim());
            match key {
                "nursery-size" => {
                    self.nursery_size = parse_size(key, value)?;
                    self.los_collection_target = self.nursery_size * 2;
                }
                "section-size" => self.section_size = parse_size(key, value)?,
                "los-threshold" => self.large_object_threshold = parse_size(key, value)?,
                "los-target" => self.los_collection_target = parse_size(key, value)?,
                "max-heap-size" => self.max_heap_size = Some(parse_size(key, value)?),
                "card-bits" => self.card_bits = parse_number(key, value)?,
                "workers" => self.workers = parse_number(key, value)?,
                "suspend-attempts" => self.suspend_attempts = parse_number(key, value)?,
                "suspend-timeout-ms" => {
                    self.suspend_timeout = Duration::from_millis(parse_number(key, value)?)
                }
                "suspend" => {
                    self.suspend_mode = match value {
                        "signals" => SuspendMode::Signals,
                        "safepoints" => SuspendMode::Safepoints,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "major" => {
                    self.backend = match value {
                        "copying" => BackendKind::CopyingMajor,
                        "null" | "none" => BackendKind::Null,
                        other => return Err(ConfigError::UnsupportedBackend(other.to_string())),
                    }
                }
                _ => return Err(ConfigError::UnknownOption(key.to_string())),
            }
        }
        Ok(())
    }

    /// Apply comma-separated debug switches.
    pub fn apply_debug(&mut self, options: &str) -> Result<(), ConfigError> {
        for option in options.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match option {
                "check-at-minor-collections" => self.verify_at_minor = true,
                "check-at-major-collections" => self.verify_at_major = true,
                "check-at-collections" => {
                    self.verify_at_minor = true;
                    self.verify_at_major = true;
                }
                _ => return Err(ConfigError::UnknownOption(option.to_string())),
            }
        }
        Ok(())
    }

    /// Check sizes and limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_power_of_two("nursery-size", self.nursery_size, MIN_NURSERY_SIZE)?;
        check_power_of_two("section-size", self.section_size, MIN_SECTION_SIZE)?;
        if self.large_object_threshold < 16 {
            return Err(ConfigError::TooSmall {
                name: "los-threshold",
                min: 16,
                value: self.large_object_threshold,
            });
        }
        if self.large_object_threshold > MAX_SLOT_SIZE {
            return Err(ConfigError::TooLarge {
                name: "los-threshold",
                max: MAX_SLOT_SIZE,
                value: self.large_object_threshold,
            });
        }
        if !(6..=16).contains(&self.card_bits) {
            return Err(invalid("card-bits", &self.card_bits.to_string()));
        }
        if !(8..=30).contains(&self.card_count_bits) {
            return Err(invalid("card-count-bits", &self.card_count_bits.to_string()));
        }
        if self.workers > MAX_WORKERS {
            return Err(ConfigError::TooLarge {
                name: "workers",
                max: MAX_WORKERS,
                value: self.workers,
            });
        }
        if self.suspend_attempts == 0 {
            return Err(ConfigError::TooSmall {
                name: "suspend-attempts",
                min: 1,
                value: 0,
            });
        }
        Ok(())
    }
}

fn check_power_of_two(name: &'static str, value: usize, min: usize) -> Result<(), ConfigError> {
    if !value.is_power_of_two() {
        return Err(ConfigError::NotPowerOfTwo { name, value });
    }
    if value < min {
        return Err(ConfigError::TooSmall { name, min, value });
    }
    Ok(())
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| invalid(key, value))
}

/// Parse a byte size with an optional `k`, `m` or `g` suffix.
pub fn parse_size(key: &str, value: &str) -> Result<usize, ConfigError> {
    let lower = value.to_ascii_lowercase();
    let (digits, shift) = match lower.as_bytes().last() {
        Some(b'k') => (&lower[..lower.len() - 1], 10),
        Some(b'm') => (&lower[..lower.len() - 1], 20),
        Some(b'g') => (&lower[..lower.len() - 1], 30),
        _ => (lower.as_str(), 0),
    };
    let base: usize = digits.parse().map_err(|_| invalid(key, value))?;
    base.checked_mul(1usize << shift)
        .ok_or_else(|| invalid(key, value))
}
