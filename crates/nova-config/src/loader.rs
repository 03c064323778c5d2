use std::path::{Path, PathBuf};

use nova_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

/// Directory holding `config.yml`, `.env` and the default database.
pub fn default_config_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".nova"))
        .unwrap_or_else(|| PathBuf::from(".nova"))
}

/// Resolves configuration from file, `.env` and `NOVA_*` environment variables.
pub struct ConfigLoader {
    config_dir: PathBuf,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config_dir: default_config_dir(),
        }
    }

    pub fn with_dir(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    /// Load `config.yml`, `config.yaml` or `config.toml` from the config dir.
    /// A missing file yields the defaults.
    pub fn load(&self) -> Result<AppConfig> {
        let env_path = self.config_dir.join(".env");
        if env_path.exists() {
            dotenvy::from_path(&env_path)
                .map_err(|e| Error::Config(format!("failed to load {}: {e}", env_path.display())))?;
        }

        let candidates = ["config.yml", "config.yaml", "config.toml"];
        let found = candidates
            .iter()
            .map(|name| self.config_dir.join(name))
            .find(|p| p.exists());

        let config = match found {
            Some(path) => Self::from_path(&path)?,
            None => {
                debug!(
                    "no config file in {}, using defaults",
                    self.config_dir.display()
                );
                AppConfig::default()
            }
        };

        Ok(apply_env_overrides(config, |key| std::env::var(key).ok()))
    }

    /// Parse a single file, choosing YAML or TOML by extension.
    pub fn from_path(path: &Path) -> Result<AppConfig> {
        info!("loading config from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();

        match ext.as_str() {
            "toml" => toml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid TOML in {}: {e}", path.display()))),
            "yml" | "yaml" => serde_yaml::from_str(&raw)
                .map_err(|e| Error::Config(format!("invalid YAML in {}: {e}", path.display()))),
            other => Err(Error::Config(format!(
                "unsupported config extension '{other}' for {}",
                path.display()
            ))),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn apply_env_overrides(
    mut config: AppConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> AppConfig {
    if let Some(provider) = lookup("NOVA_DEFAULT_PROVIDER").filter(|v| !v.trim().is_empty()) {
        config.agent.default_provider = Some(provider.trim().to_string());
    }
    if let Some(model) = lookup("NOVA_MODEL").filter(|v| !v.trim().is_empty()) {
        config.agent.model = Some(model.trim().to_string());
    }
    if let Some(port) = lookup("NOVA_GATEWAY_PORT").and_then(|v| v.trim().parse().ok()) {
        config.gateway.port = port;
    }
    if let Some(dir) = lookup("NOVA_DATA_DIR").filter(|v| !v.trim().is_empty()) {
        config.storage.data_dir = Some(PathBuf::from(dir.trim()));
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(config.gateway.port, 3789);
        assert!(config.llm.is_empty());
    }

    #[test]
    fn loads_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("config.yml"),
            "agent:\n  default_provider: main\n  fallback_providers: [backup]\nprompt:\n  max_prompt_tokens: 4000\n",
        )
        .unwrap();

        let config = ConfigLoader::with_dir(dir.path()).load().unwrap();
        assert_eq!(config.agent.default_provider.as_deref(), Some("main"));
        assert_eq!(config.agent.fallback_providers, vec!["backup".to_string()]);
        assert_eq!(config.prompt.max_prompt_tokens, 4000);
    }

    #[test]
    fn loads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[tool_loop]\nmax_steps = 2\n\n[gateway]\nport = 9000\n").unwrap();

        let config = ConfigLoader::from_path(&path).unwrap();
        assert_eq!(config.tool_loop.max_steps, 2);
        assert_eq!(config.gateway.port, 9000);
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.ini");
        std::fs::write(&path, "x=1").unwrap();
        assert!(matches!(
            ConfigLoader::from_path(&path),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("NOVA_DEFAULT_PROVIDER", "backup"),
            ("NOVA_GATEWAY_PORT", "4100"),
            ("NOVA_MODEL", " "),
        ]
        .into_iter()
        .collect();

        let config = apply_env_overrides(AppConfig::default(), |k| {
            vars.get(k).map(|v| v.to_string())
        });
        assert_eq!(config.agent.default_provider.as_deref(), Some("backup"));
        assert_eq!(config.gateway.port, 4100);
        assert!(config.agent.model.is_none());
    }
}
