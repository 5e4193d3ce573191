//! Configuration loader with multi-source merging

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::{Paths, TesseraConfig};

/// Configuration loader with builder pattern
pub struct ConfigLoader {
    project_dir: PathBuf,
    env_prefix: String,
    explicit_file: Option<PathBuf>,
    read_user_config: bool,
}

impl ConfigLoader {
    /// Loader rooted at the current directory.
    pub fn new() -> Self {
        Self {
            project_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            env_prefix: "TESSERA".to_string(),
            explicit_file: None,
            read_user_config: true,
        }
    }

    pub fn with_project_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.project_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Set the environment variable prefix (default: "TESSERA")
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Use `path` instead of `<project_dir>/tessera.toml`. Relative paths
    /// in it resolve against its directory, and the file must exist.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.project_dir = parent.to_path_buf();
        }
        self.explicit_file = Some(path);
        self
    }

    /// Skip ~/.config/tessera/config.toml.
    pub fn without_user_config(mut self) -> Self {
        self.read_user_config = false;
        self
    }

    /// Load configuration from all sources with proper precedence
    pub fn load(self) -> Result<TesseraConfig> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        let defaults = TesseraConfig::default();
        builder = builder.add_source(config::Config::try_from(&defaults)?);

        // 2. User config
        if self.read_user_config
            && let Ok(user_config_file) = Paths::new().user_config_file()
            && user_config_file.exists()
        {
            builder = builder.add_source(
                config::File::from(user_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Project config, or the file named on the command line
        match &self.explicit_file {
            Some(path) => {
                builder = builder.add_source(
                    config::File::from(path.as_path())
                        .required(true)
                        .format(config::FileFormat::Toml),
                );
            }
            None => {
                let project_config_file = Paths::project_config_file(&self.project_dir);
                if project_config_file.exists() {
                    builder = builder.add_source(
                        config::File::from(project_config_file)
                            .required(false)
                            .format(config::FileFormat::Toml),
                    );
                }
            }
        }

        // 4. Local overrides
        let local_config_file = Paths::local_config_file(&self.project_dir);
        if local_config_file.exists() {
            builder = builder.add_source(
                config::File::from(local_config_file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 5. Environment (TESSERA_CONSENSUS__ROUND_TIMEOUT_MS=500)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut tessera_config: TesseraConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        tessera_config.resolve_paths(&self.project_dir);
        tessera_config
            .validate()
            .context("Invalid configuration")?;

        Ok(tessera_config)
    }

    /// Load configuration or fall back to defaults
    pub fn load_or_default(self) -> TesseraConfig {
        self.load().unwrap_or_default()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn loader(dir: &Path) -> ConfigLoader {
        ConfigLoader::new()
            .with_project_dir(dir)
            .with_env_prefix("TESSERA_LOADER_TEST")
            .without_user_config()
    }

    #[test]
    fn test_load_defaults() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let config = loader(temp_dir.path()).load().expect("Failed to load config");

        assert_eq!(config.consensus.round_timeout_ms, 2_000);
        assert_eq!(config.node.keys_dir, temp_dir.path().join(".tessera/keys"));
    }

    #[test]
    fn test_load_project_config() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        let config_content = r#"
[consensus]
round_timeout_ms = 500

[[roster.nodes]]
id = "R1"
address = "127.0.0.1:7001"
public_key = "O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik="

[[roster.clients]]
id = "C1"
address = "127.0.0.1:8001"
public_key = "O2onvM62pC1io6jQKm8Nc2UyFXcd4kOmOsBIoYtZ2ik="
"#;
        fs::write(project_dir.join("tessera.toml"), config_content)
            .expect("Failed to write config");

        let config = loader(project_dir).load().expect("Failed to load config");

        assert_eq!(config.consensus.round_timeout_ms, 500);
        assert_eq!(config.consensus.max_pending_instances, 64);
        assert_eq!(config.roster.nodes.len(), 1);
        assert_eq!(config.roster.nodes[0].id, "R1");
        assert_eq!(config.roster.clients[0].address, "127.0.0.1:8001");
    }

    #[test]
    fn test_local_overrides_project() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let project_dir = temp_dir.path();

        fs::write(
            project_dir.join("tessera.toml"),
            "[service]\nworker_permits = 8\n\n[client]\nrequest_timeout_ms = 900\n",
        )
        .expect("Failed to write config");
        fs::write(
            project_dir.join("tessera.local.toml"),
            "[service]\nworker_permits = 2\n",
        )
        .expect("Failed to write local config");

        let config = loader(project_dir).load().expect("Failed to load config");
        assert_eq!(config.service.worker_permits, 2);
        assert_eq!(config.client.request_timeout_ms, 900);
    }

    #[test]
    fn test_explicit_file() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let file = temp_dir.path().join("cluster-a.toml");
        fs::write(&file, "[node]\nkeys_dir = \"secrets\"\n").expect("Failed to write config");

        let config = ConfigLoader::new()
            .with_env_prefix("TESSERA_LOADER_TEST")
            .without_user_config()
            .with_file(&file)
            .load()
            .expect("Failed to load config");
        assert_eq!(config.node.keys_dir, temp_dir.path().join("secrets"));
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        let result = ConfigLoader::new()
            .without_user_config()
            .with_file(temp_dir.path().join("absent.toml"))
            .load();
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let temp_dir = tempdir().expect("Failed to create temp dir");
        fs::write(
            temp_dir.path().join("tessera.toml"),
            "[service]\nworker_permits = 0\n",
        )
        .expect("Failed to write config");

        assert!(loader(temp_dir.path()).load().is_err());
        let fallback = loader(temp_dir.path()).load_or_default();
        assert_eq!(fallback.service.worker_permits, 64);
    }
}
