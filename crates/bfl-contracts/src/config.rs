use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{FluxError, FluxResult};

pub const DEFAULT_BASE_URL: &str = "https://api.bfl.ml/v1/";
pub const DEFAULT_CONFIG_FILE: &str = "config.toml";
pub const CONFIG_PATH_ENV: &str = "BFL_CONFIG";

/// Region label meaning "no regional endpoint" in host choice widgets.
pub const NO_REGION: &str = "none";

fn builtin_regions() -> BTreeMap<String, String> {
    let mut regions = BTreeMap::new();
    regions.insert("us".to_string(), "https://api.us1.bfl.ai".to_string());
    regions.insert("eu".to_string(), "https://api.eu1.bfl.ai".to_string());
    regions
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    #[serde(rename = "API", default)]
    api: ApiSection,
    #[serde(rename = "REGIONS", default)]
    regions: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
struct ApiSection {
    #[serde(rename = "BASE_URL")]
    base_url: Option<String>,
    #[serde(rename = "X_KEY")]
    x_key: Option<String>,
}

/// Values read from the static configuration file.
///
/// ```toml
/// [API]
/// BASE_URL = "https://api.bfl.ml/v1/"
/// X_KEY = "..."
///
/// [REGIONS]
/// us = "https://api.us1.bfl.ai"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigStore {
    pub base_url: Option<String>,
    pub x_key: Option<String>,
    pub regions: BTreeMap<String, String>,
}

impl ConfigStore {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Path from `BFL_CONFIG`, falling back to `./config.toml`.
    pub fn default_path() -> PathBuf {
        non_empty_env(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    /// A missing file yields an empty store; a malformed one is an error.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let parsed: ConfigFile = toml::from_str(raw)?;
        Ok(Self {
            base_url: non_empty(parsed.api.base_url),
            x_key: non_empty(parsed.api.x_key),
            regions: parsed
                .regions
                .into_iter()
                .filter_map(|(name, url)| non_empty(Some(url)).map(|url| (name, url)))
                .collect(),
        })
    }
}

/// Per-invocation settings produced by the config node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigOverride {
    pub x_key: Option<String>,
    pub base_url: Option<String>,
    pub default_region: Option<String>,
}

impl ConfigOverride {
    /// Blank key means "not set"; blank base URL falls back to the default
    /// endpoint; region `none` disables regional routing.
    pub fn new(x_key: &str, base_url: &str, region: Option<&str>) -> Self {
        Self {
            x_key: non_empty(Some(x_key.to_string())),
            base_url: Some(
                non_empty(Some(base_url.to_string()))
                    .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            ),
            default_region: region
                .map(str::trim)
                .filter(|value| !value.is_empty() && *value != NO_REGION)
                .map(str::to_string),
        }
    }
}

/// Configuration resolved once per invocation and passed down by value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub api_key: String,
    pub base_url: String,
    pub regions: BTreeMap<String, String>,
    pub default_region: Option<String>,
}

impl ResolvedConfig {
    /// `{base}/{path}`, or `{regional}/v1/{path}` when `region` is known.
    pub fn url(&self, path: &str, region: Option<&str>) -> String {
        let path = path.trim_start_matches('/');
        if let Some(regional) = region.and_then(|name| self.regions.get(name)) {
            return format!("{}/v1/{}", regional.trim_end_matches('/'), path);
        }
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    pub fn regional_endpoint(&self, region: &str) -> FluxResult<&str> {
        self.regions.get(region).map(String::as_str).ok_or_else(|| {
            FluxError::Validation(format!(
                "invalid region '{region}'; expected one of: {}",
                self.regions.keys().cloned().collect::<Vec<String>>().join(", ")
            ))
        })
    }

    /// The node's own region input wins over the override's default region.
    pub fn effective_region(&self, requested: Option<&str>) -> Option<String> {
        requested
            .map(str::trim)
            .filter(|value| !value.is_empty() && *value != NO_REGION)
            .map(str::to_string)
            .or_else(|| self.default_region.clone())
    }
}

#[derive(Debug, Clone)]
pub struct ConfigResolver {
    store: ConfigStore,
    env_fallback: bool,
}

impl ConfigResolver {
    pub fn new(store: ConfigStore) -> Self {
        Self {
            store,
            env_fallback: true,
        }
    }

    /// Ignore `BFL_API_KEY` / `FLUX_API_KEY` / `FLUX_API_BASE`.
    pub fn without_env(mut self) -> Self {
        self.env_fallback = false;
        self
    }

    /// Override fields first, then the file, then the environment.
    pub fn resolve(&self, override_config: Option<&ConfigOverride>) -> FluxResult<ResolvedConfig> {
        let api_key = override_config
            .and_then(|config| non_empty(config.x_key.clone()))
            .or_else(|| self.store.x_key.clone())
            .or_else(|| self.env_key())
            .ok_or_else(|| {
                FluxError::Config("X_KEY not found in section API of config file".to_string())
            })?;
        let base_url = override_config
            .and_then(|config| non_empty(config.base_url.clone()))
            .or_else(|| self.store.base_url.clone())
            .or_else(|| self.env_base_url())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());

        let mut regions = builtin_regions();
        for (name, url) in &self.store.regions {
            regions.insert(name.clone(), url.clone());
        }

        Ok(ResolvedConfig {
            api_key,
            base_url,
            regions,
            default_region: override_config
                .and_then(|config| config.default_region.clone())
                .filter(|value| value != NO_REGION),
        })
    }

    fn env_key(&self) -> Option<String> {
        if !self.env_fallback {
            return None;
        }
        non_empty_env("BFL_API_KEY").or_else(|| non_empty_env("FLUX_API_KEY"))
    }

    fn env_base_url(&self) -> Option<String> {
        if !self.env_fallback {
            return None;
        }
        non_empty_env("FLUX_API_BASE")
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|raw| raw.trim().to_string())
        .filter(|raw| !raw.is_empty())
}

fn non_empty_env(key: &str) -> Option<String> {
    non_empty(env::var(key).ok())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn file_store() -> ConfigStore {
        ConfigStore {
            base_url: Some("https://file.example/v1/".to_string()),
            x_key: Some("file-key".to_string()),
            regions: BTreeMap::new(),
        }
    }

    #[test]
    fn load_reads_api_section() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "[API]\nBASE_URL = \"https://api.bfl.ml/v1/\"\nX_KEY = \" secret \"\n\n[REGIONS]\nap = \"https://api.ap1.bfl.ai\"\n",
        )?;
        let store = ConfigStore::load(&path)?;
        assert_eq!(store.base_url.as_deref(), Some("https://api.bfl.ml/v1/"));
        assert_eq!(store.x_key.as_deref(), Some("secret"));
        assert_eq!(
            store.regions.get("ap").map(String::as_str),
            Some("https://api.ap1.bfl.ai")
        );
        Ok(())
    }

    #[test]
    fn missing_file_is_an_empty_store() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let store = ConfigStore::load(&temp.path().join("absent.toml"))?;
        assert_eq!(store, ConfigStore::empty());
        Ok(())
    }

    #[test]
    fn malformed_file_is_an_error() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("config.toml");
        fs::write(&path, "[API\nX_KEY = ")?;
        assert!(ConfigStore::load(&path).is_err());
        Ok(())
    }

    #[test]
    fn override_wins_over_file_values() -> anyhow::Result<()> {
        let resolver = ConfigResolver::new(file_store()).without_env();
        let override_config = ConfigOverride::new("override-key", "https://override.example/v1/", Some("eu"));
        let resolved = resolver.resolve(Some(&override_config))?;
        assert_eq!(resolved.api_key, "override-key");
        assert_eq!(resolved.base_url, "https://override.example/v1/");
        assert_eq!(resolved.default_region.as_deref(), Some("eu"));
        assert_eq!(resolved.effective_region(None).as_deref(), Some("eu"));
        Ok(())
    }

    #[test]
    fn blank_override_key_falls_back_to_file() -> anyhow::Result<()> {
        let resolver = ConfigResolver::new(file_store()).without_env();
        let override_config = ConfigOverride {
            x_key: Some("   ".to_string()),
            base_url: None,
            default_region: None,
        };
        let resolved = resolver.resolve(Some(&override_config))?;
        assert_eq!(resolved.api_key, "file-key");
        assert_eq!(resolved.base_url, "https://file.example/v1/");
        assert_eq!(resolved.default_region, None);
        Ok(())
    }

    #[test]
    fn missing_key_is_a_config_error() {
        let resolver = ConfigResolver::new(ConfigStore::empty()).without_env();
        let err = resolver.resolve(None).err();
        assert!(matches!(err, Some(FluxError::Config(_))));
    }

    #[test]
    fn config_node_defaults() {
        let override_config = ConfigOverride::new("", "  ", Some("none"));
        assert_eq!(override_config.x_key, None);
        assert_eq!(override_config.base_url.as_deref(), Some(DEFAULT_BASE_URL));
        assert_eq!(override_config.default_region, None);
    }

    #[test]
    fn url_joins_base_and_regional_endpoints() -> anyhow::Result<()> {
        let resolver = ConfigResolver::new(file_store()).without_env();
        let resolved = resolver.resolve(None)?;
        assert_eq!(
            resolved.url("flux-pro-1.1", None),
            "https://file.example/v1/flux-pro-1.1"
        );
        assert_eq!(
            resolved.url("/finetune", Some("us")),
            "https://api.us1.bfl.ai/v1/finetune"
        );
        assert_eq!(
            resolved.url("get_result", Some("mars")),
            "https://file.example/v1/get_result"
        );
        assert!(resolved.regional_endpoint("eu").is_ok());
        assert!(matches!(
            resolved.regional_endpoint("mars"),
            Err(FluxError::Validation(_))
        ));
        Ok(())
    }

    #[test]
    fn node_region_beats_default_region() -> anyhow::Result<()> {
        let resolver = ConfigResolver::new(file_store()).without_env();
        let override_config = ConfigOverride::new("k", "", Some("eu"));
        let resolved = resolver.resolve(Some(&override_config))?;
        assert_eq!(resolved.effective_region(Some("us")).as_deref(), Some("us"));
        assert_eq!(resolved.effective_region(Some("none")).as_deref(), Some("eu"));
        Ok(())
    }
}
