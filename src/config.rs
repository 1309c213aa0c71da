//! Configuration for the vault.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variable (CAPVAULT_ROOT)
//! 2. Config file (.capvault/config.yaml)
//! 3. Defaults (~/.capvault)
//!
//! Config file discovery:
//! - Searches current directory and parents for .capvault/config.yaml
//! - A relative `storage.root` is resolved against the directory holding `.capvault/`
//!
//! Configuration is loaded explicitly and handed to [`crate::Vault::open`];
//! there is no process-wide cached copy.

pub mod paths;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub use paths::StorageLayout;

/// Environment variable overriding the storage root
pub const ROOT_ENV: &str = "CAPVAULT_ROOT";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Deserialize)]
pub struct ConfigFile {
    pub version: String,
    #[serde(default)]
    pub storage: StorageSection,
    #[serde(default)]
    pub concurrency: Option<ConcurrencySection>,
    #[serde(default)]
    pub hashing: Option<HashingSection>,
    #[serde(default)]
    pub catalog: Option<CatalogSection>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageSection {
    /// Storage root (relative to the project root)
    pub root: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConcurrencySection {
    pub max_asset_fanout: Option<usize>,
    pub per_origin: Option<usize>,
    pub processing_workers: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HashingSection {
    pub shard_depth: Option<usize>,
    pub shard_width: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogSection {
    pub enabled: Option<bool>,
}

/// Concurrency limits for capture and processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencyLimits {
    /// Asset puts in flight across all captures of one vault
    pub max_asset_fanout: usize,
    /// Asset puts in flight per origin (scheme + host + port)
    pub per_origin: usize,
    /// Manifests processed in parallel
    pub processing_workers: usize,
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_asset_fanout: 16,
            per_origin: 4,
            processing_workers: 4,
        }
    }
}

/// Blob path sharding parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardSpec {
    /// Number of directory levels
    pub depth: usize,
    /// Hex characters per level
    pub width: usize,
}

impl Default for ShardSpec {
    fn default() -> Self {
        Self { depth: 2, width: 2 }
    }
}

/// Resolved configuration with an absolute storage root
#[derive(Debug, Clone)]
pub struct VaultConfig {
    /// Storage root holding raw/, derived/ and index/
    pub root: PathBuf,
    pub concurrency: ConcurrencyLimits,
    pub sharding: ShardSpec,
    /// Whether to maintain the SQLite catalog
    pub catalog_enabled: bool,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

impl VaultConfig {
    /// Defaults rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            concurrency: ConcurrencyLimits::default(),
            sharding: ShardSpec::default(),
            catalog_enabled: true,
            config_file: None,
        }
    }

    pub fn with_concurrency(mut self, concurrency: ConcurrencyLimits) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_sharding(mut self, sharding: ShardSpec) -> Self {
        self.sharding = sharding;
        self
    }

    pub fn with_catalog(mut self, enabled: bool) -> Self {
        self.catalog_enabled = enabled;
        self
    }

    /// On-disk layout derived from the root
    pub fn layout(&self) -> StorageLayout {
        StorageLayout::new(&self.root)
    }

    /// Reject limits that would deadlock or paths that cannot be sharded
    pub fn validate(&self) -> Result<()> {
        let c = &self.concurrency;
        if c.max_asset_fanout == 0 || c.per_origin == 0 || c.processing_workers == 0 {
            anyhow::bail!("Concurrency limits must be greater than zero: {:?}", c);
        }

        let s = &self.sharding;
        if s.width == 0 {
            anyhow::bail!("Shard width must be greater than zero");
        }
        if s.depth * s.width >= 64 {
            anyhow::bail!(
                "Shard prefix ({} levels x {} chars) must be shorter than a SHA-256 hex digest",
                s.depth,
                s.width
            );
        }

        Ok(())
    }

    /// Load configuration from env, config file and defaults
    pub fn load() -> Result<Self> {
        let config = load_config()?;
        config.validate()?;
        Ok(config)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".capvault").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the project root
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Apply a parsed config file on top of defaults
fn apply_config_file(config_path: &Path, file: ConfigFile, default_root: PathBuf) -> VaultConfig {
    // Project root is the parent of .capvault/
    let base_dir = config_path
        .parent()
        .and_then(|p| p.parent())
        .unwrap_or(Path::new("."));

    let root = match file.storage.root {
        Some(ref root) => resolve_path(base_dir, root),
        None => default_root,
    };

    let defaults = ConcurrencyLimits::default();
    let concurrency = match file.concurrency {
        Some(c) => ConcurrencyLimits {
            max_asset_fanout: c.max_asset_fanout.unwrap_or(defaults.max_asset_fanout),
            per_origin: c.per_origin.unwrap_or(defaults.per_origin),
            processing_workers: c.processing_workers.unwrap_or(defaults.processing_workers),
        },
        None => defaults,
    };

    let shard_defaults = ShardSpec::default();
    let sharding = match file.hashing {
        Some(h) => ShardSpec {
            depth: h.shard_depth.unwrap_or(shard_defaults.depth),
            width: h.shard_width.unwrap_or(shard_defaults.width),
        },
        None => shard_defaults,
    };

    VaultConfig {
        root,
        concurrency,
        sharding,
        catalog_enabled: file.catalog.and_then(|c| c.enabled).unwrap_or(true),
        config_file: Some(config_path.to_path_buf()),
    }
}

/// Load configuration from all sources
fn load_config() -> Result<VaultConfig> {
    let default_root = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".capvault");

    let mut config = match find_config_file() {
        Some(config_path) => {
            let file = load_config_file(&config_path)?;
            apply_config_file(&config_path, file, default_root)
        }
        None => VaultConfig::new(default_root),
    };

    if let Ok(env_root) = std::env::var(ROOT_ENV) {
        config.root = PathBuf::from(env_root);
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_config_file_parsing() {
        let temp = TempDir::new().unwrap();
        let capvault_dir = temp.path().join(".capvault");
        std::fs::create_dir_all(&capvault_dir).unwrap();

        let config_path = capvault_dir.join("config.yaml");
        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(
            file,
            r#"
version: "1.0"
storage:
  root: ./vault
concurrency:
  max_asset_fanout: 8
  per_origin: 2
hashing:
  shard_depth: 1
catalog:
  enabled: false
"#
        )
        .unwrap();

        let parsed = load_config_file(&config_path).unwrap();
        assert_eq!(parsed.version, "1.0");
        assert_eq!(parsed.storage.root, Some("./vault".to_string()));

        let config = apply_config_file(&config_path, parsed, PathBuf::from("/unused"));
        assert_eq!(config.concurrency.max_asset_fanout, 8);
        assert_eq!(config.concurrency.per_origin, 2);
        // Unset values fall back to defaults
        assert_eq!(config.concurrency.processing_workers, 4);
        assert_eq!(config.sharding, ShardSpec { depth: 1, width: 2 });
        assert!(!config.catalog_enabled);
        assert!(config.root.ends_with("vault"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let config = VaultConfig::new("/tmp/vault").with_concurrency(ConcurrencyLimits {
            per_origin: 0,
            ..Default::default()
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_shard_prefix() {
        let config = VaultConfig::new("/tmp/vault").with_sharding(ShardSpec { depth: 8, width: 8 });
        assert!(config.validate().is_err());

        let config = VaultConfig::new("/tmp/vault").with_sharding(ShardSpec { depth: 3, width: 0 });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_resolve_relative_path() {
        let base = PathBuf::from("/home/user/project");

        assert_eq!(
            resolve_path(&base, "./subdir"),
            PathBuf::from("/home/user/project/subdir")
        );
        assert_eq!(
            resolve_path(&base, "/absolute/path"),
            PathBuf::from("/absolute/path")
        );
    }
}
