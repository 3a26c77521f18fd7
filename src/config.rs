//! Configuration management for boot64-emu.
//!
//! Configuration is loaded from multiple sources in priority order:
//! 1. Environment variables (BOOT64_EMU_MEMORY_BYTES, etc.)
//! 2. Project-local config file (`./boot64-emu.toml`)
//! 3. User config file (`~/.config/boot64-emu/config.toml`)
//! 4. Built-in defaults
//!
//! # Config File Format
//!
//! ```toml
//! # boot64-emu.toml
//!
//! # Physical memory size in bytes (default: 16 MiB)
//! memory_bytes = 16777216
//!
//! # Physical load/entry address for the boot image (default: 0x7C00)
//! boot_address = 0x7C00
//!
//! # Step limit, 0 = unlimited (default: 0)
//! max_steps = 0
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Global cached configuration.
static CONFIG: OnceLock<Config> = OnceLock::new();

/// Default physical memory size (16 MiB).
pub const DEFAULT_MEMORY_BYTES: u64 = 16 * 1024 * 1024;

/// Default boot load address.
pub const DEFAULT_BOOT_ADDRESS: u64 = 0x7C00;

/// boot64-emu configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Physical memory size in bytes.
    pub memory_bytes: Option<u64>,

    /// Physical address the boot image is loaded at (and RIP starts at).
    pub boot_address: Option<u64>,

    /// Step limit before the engine pauses; 0 means unlimited.
    pub max_steps: Option<u64>,
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Priority (highest to lowest):
    /// 1. Environment variables
    /// 2. Project-local `boot64-emu.toml`
    /// 3. User config `~/.config/boot64-emu/config.toml`
    /// 4. Defaults
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load user config first (lowest priority of file configs)
        if let Some(user_config) = Self::load_user_config() {
            config.merge(user_config);
        }

        // Load project-local config (higher priority)
        if let Some(local_config) = Self::load_local_config() {
            config.merge(local_config);
        }

        // Environment variables override everything
        config.apply_env_overrides();

        config
    }

    /// Get the cached global configuration.
    ///
    /// Loads configuration on first call and caches it.
    pub fn get() -> &'static Config {
        CONFIG.get_or_init(|| {
            let config = Self::load();
            log::debug!("Loaded configuration: {:?}", config);
            config
        })
    }

    /// Memory size with the default applied.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes.unwrap_or(DEFAULT_MEMORY_BYTES)
    }

    /// Boot address with the default applied.
    pub fn boot_address(&self) -> u64 {
        self.boot_address.unwrap_or(DEFAULT_BOOT_ADDRESS)
    }

    /// Step limit with the default applied (0 = unlimited).
    pub fn max_steps(&self) -> u64 {
        self.max_steps.unwrap_or(0)
    }

    /// Load user configuration from ~/.config/boot64-emu/config.toml
    fn load_user_config() -> Option<Self> {
        let config_dir = dirs::config_dir()?;
        let config_path = config_dir.join("boot64-emu").join("config.toml");
        Self::load_from_file(&config_path)
    }

    /// Load project-local configuration from ./boot64-emu.toml
    fn load_local_config() -> Option<Self> {
        // Try current directory
        let local_path = Path::new("boot64-emu.toml");
        if let Some(config) = Self::load_from_file(local_path) {
            return Some(config);
        }

        // Try to find project root by looking for Cargo.toml
        if let Ok(manifest_dir) = std::env::var("CARGO_MANIFEST_DIR") {
            let project_path = Path::new(&manifest_dir).join("boot64-emu.toml");
            if let Some(config) = Self::load_from_file(&project_path) {
                return Some(config);
            }
        }

        None
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => {
                    log::info!("Loaded config from {}", path.display());
                    Some(config)
                }
                Err(e) => {
                    log::warn!("Failed to parse {}: {}", path.display(), e);
                    None
                }
            },
            Err(e) => {
                log::warn!("Failed to read {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Merge another config into this one.
    /// Only overrides fields that are Some in the other config.
    fn merge(&mut self, other: Self) {
        if other.memory_bytes.is_some() {
            self.memory_bytes = other.memory_bytes;
        }
        if other.boot_address.is_some() {
            self.boot_address = other.boot_address;
        }
        if other.max_steps.is_some() {
            self.max_steps = other.max_steps;
        }
    }

    /// Apply environment variable overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(value) = env_number("BOOT64_EMU_MEMORY_BYTES") {
            self.memory_bytes = Some(value);
        }
        if let Some(value) = env_number("BOOT64_EMU_BOOT_ADDRESS") {
            self.boot_address = Some(value);
        }
        if let Some(value) = env_number("BOOT64_EMU_MAX_STEPS") {
            self.max_steps = Some(value);
        }
    }

    /// Get the path to the user config file (for display/creation).
    pub fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("boot64-emu").join("config.toml"))
    }
}

/// Parse a numeric environment variable, accepting a 0x prefix.
fn env_number(name: &str) -> Option<u64> {
    let raw = std::env::var(name).ok()?;
    match parse_number(&raw) {
        Some(value) => {
            log::info!("Using {} from environment: {}", name, raw);
            Some(value)
        }
        None => {
            log::warn!("Ignoring unparseable {}={:?}", name, raw);
            None
        }
    }
}

/// Parse a decimal or 0x-prefixed hexadecimal number.
pub fn parse_number(raw: &str) -> Option<u64> {
    let raw = raw.trim();
    if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else {
        raw.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.memory_bytes(), DEFAULT_MEMORY_BYTES);
        assert_eq!(config.boot_address(), 0x7C00);
        assert_eq!(config.max_steps(), 0);
    }

    #[test]
    fn test_merge_keeps_unset_fields() {
        let mut base = Config {
            memory_bytes: Some(1024),
            ..Config::default()
        };
        base.merge(Config {
            boot_address: Some(0x8000),
            ..Config::default()
        });
        assert_eq!(base.memory_bytes, Some(1024));
        assert_eq!(base.boot_address, Some(0x8000));
    }

    #[test]
    fn test_toml_round_trip() {
        let parsed: Config = toml::from_str("memory_bytes = 4096\nmax_steps = 10").unwrap();
        assert_eq!(parsed.memory_bytes, Some(4096));
        assert_eq!(parsed.max_steps, Some(10));
        assert_eq!(parsed.boot_address, None);
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("123"), Some(123));
        assert_eq!(parse_number("0x7C00"), Some(0x7C00));
        assert_eq!(parse_number(" 0X10 "), Some(0x10));
        assert_eq!(parse_number("zap"), None);
    }
}
