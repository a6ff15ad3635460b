use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin the app is served from; also the base for boot-asset paths
  pub origin: String,
  pub shell: ShellConfig,
  /// Name of the unversioned runtime store
  pub runtime_cache: String,
  /// Extra hostnames eligible for stale-while-revalidate (case-insensitive).
  /// The origin's own host is always included.
  #[serde(deserialize_with = "deserialize_lowercase_set")]
  pub whitelist: BTreeSet<String>,
  /// Same-origin paths under this prefix are content-hashed and never cache-busted
  pub asset_prefix: String,
  pub network: NetworkConfig,
  pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShellConfig {
  /// Version-stamped store name; change it whenever `assets` change
  pub name: String,
  /// Document served when a navigation cannot reach the network
  pub entry_document: String,
  /// Root-relative paths fetched and sealed at install time
  pub assets: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
  /// Cache database location (default: $XDG_DATA_HOME/offline-shell/cache.db)
  pub path: Option<PathBuf>,
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: "http://localhost:8080".to_string(),
      shell: ShellConfig::default(),
      runtime_cache: "pwa-cache".to_string(),
      whitelist: [
        "fonts.googleapis.com",
        "fonts.gstatic.com",
        "cdn.jsdelivr.net",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
      asset_prefix: "/assets/".to_string(),
      network: NetworkConfig::default(),
      storage: StorageConfig::default(),
    }
  }
}

impl Default for ShellConfig {
  fn default() -> Self {
    Self {
      name: "app-shell-v2".to_string(),
      entry_document: "/index.html".to_string(),
      assets: [
        "/",
        "/index.html",
        "/manifest.json",
        "/icons/icon-192.png",
        "/icons/icon-512.png",
      ]
      .into_iter()
      .map(String::from)
      .collect(),
    }
  }
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      connect_timeout_secs: 10,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-shell.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-shell/config.yaml
  ///
  /// Falls back to built-in defaults when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-shell.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-shell").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))
  }

  pub fn validate(&self) -> Result<()> {
    let origin = self.origin_url()?;
    if origin.host_str().is_none() {
      return Err(eyre!("origin {} has no host", self.origin));
    }
    if !self.asset_prefix.starts_with('/') {
      return Err(eyre!(
        "asset_prefix must be root-relative, got {}",
        self.asset_prefix
      ));
    }
    if !self.shell.entry_document.starts_with('/') {
      return Err(eyre!(
        "shell.entry_document must be root-relative, got {}",
        self.shell.entry_document
      ));
    }
    if self.shell.name == self.runtime_cache {
      return Err(eyre!(
        "shell.name and runtime_cache must differ, both are {}",
        self.runtime_cache
      ));
    }
    Ok(())
  }

  /// The configured origin as an absolute http(s) URL.
  pub fn origin_url(&self) -> Result<Url> {
    let url = Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin {}: {}", self.origin, e))?;
    match url.scheme() {
      "http" | "https" => Ok(url),
      other => Err(eyre!("origin must be http or https, got {}", other)),
    }
  }

  /// Directory for the cache database and log file.
  pub fn data_dir() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("offline-shell"))
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    match &self.storage.path {
      Some(path) => Ok(path.clone()),
      None => Ok(Self::data_dir()?.join("cache.db")),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    config.validate().unwrap();
    assert_eq!(config.shell.assets.len(), 5);
    assert_eq!(config.shell.assets[0], "/");
    assert!(config.whitelist.contains("fonts.gstatic.com"));
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "origin: https://math.example.com\n\
       shell:\n  name: app-shell-v3\n\
       whitelist:\n  - Fonts.GStatic.com\n",
    )
    .unwrap();

    assert_eq!(config.origin, "https://math.example.com");
    assert_eq!(config.shell.name, "app-shell-v3");
    assert_eq!(config.shell.entry_document, "/index.html");
    assert_eq!(config.runtime_cache, "pwa-cache");
    assert_eq!(
      config.whitelist.iter().collect::<Vec<_>>(),
      vec!["fonts.gstatic.com"]
    );
  }

  #[test]
  fn test_rejects_non_http_origin() {
    let config = Config {
      origin: "ftp://math.example.com".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_relative_asset_prefix() {
    let config = Config {
      asset_prefix: "assets/".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_shared_store_name() {
    let mut config = Config::default();
    config.runtime_cache = config.shell.name.clone();
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    assert!(Config::load(Some(Path::new("/nonexistent/offline-shell.yaml"))).is_err());
  }
}
