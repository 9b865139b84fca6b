//! Config file discovery.
//!
//! The first file found wins:
//! 1. An explicit path (the `--config` flag)
//! 2. The `LAPSE_CONFIG` environment variable
//! 3. `./lapse.toml` (project-local)
//! 4. `~/.config/lapse/config.toml` (platform config dir)
//!
//! When none exists the defaults apply. An explicit or environment path
//! that cannot be read is an error rather than a silent fallback.

use std::path::{Path, PathBuf};

use crate::{ConfigError, LapseConfig, Result};

/// Default config filename for project-local config.
const PROJECT_CONFIG_FILE: &str = "lapse.toml";

/// Default config filename within the user config directory.
const USER_CONFIG_FILE: &str = "config.toml";

/// Application name for config directory resolution.
const APP_NAME: &str = "lapse";

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "LAPSE_CONFIG";

/// Result of config discovery and loading.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    /// The configuration.
    pub config: LapseConfig,
    /// File it was loaded from; `None` when defaults were used.
    pub source: Option<PathBuf>,
}

/// One place a config file may live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Path to check.
    pub path: PathBuf,
    /// Whether a missing file is an error.
    pub required: bool,
}

/// Load configuration, honouring `explicit` and the `LAPSE_CONFIG` variable.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig> {
    let env = std::env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    load_config_with_options(explicit, env.as_deref(), None, user_config_path().as_deref())
}

/// Load configuration with every search location given explicitly.
///
/// `project_dir` defaults to the working directory.
pub fn load_config_with_options(
    explicit: Option<&Path>,
    env: Option<&Path>,
    project_dir: Option<&Path>,
    user_config: Option<&Path>,
) -> Result<LoadedConfig> {
    for candidate in candidates(explicit, env, project_dir, user_config) {
        if candidate.required || candidate.path.is_file() {
            let config = load_config_file(&candidate.path)?;
            return Ok(LoadedConfig {
                config,
                source: Some(candidate.path),
            });
        }
    }

    Ok(LoadedConfig {
        config: LapseConfig::default(),
        source: None,
    })
}

/// Search locations in priority order.
pub fn candidates(
    explicit: Option<&Path>,
    env: Option<&Path>,
    project_dir: Option<&Path>,
    user_config: Option<&Path>,
) -> Vec<Candidate> {
    if let Some(path) = explicit.or(env) {
        return vec![Candidate {
            path: path.to_path_buf(),
            required: true,
        }];
    }

    let project = project_dir
        .map(|d| d.join(PROJECT_CONFIG_FILE))
        .unwrap_or_else(|| PathBuf::from(PROJECT_CONFIG_FILE));
    let mut found = vec![Candidate {
        path: project,
        required: false,
    }];
    if let Some(path) = user_config {
        found.push(Candidate {
            path: path.to_path_buf(),
            required: false,
        });
    }
    found
}

/// Load config from a specific file path (no discovery).
pub fn load_config_file(path: &Path) -> Result<LapseConfig> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.display().to_string(),
        source: e,
    })?;
    LapseConfig::from_toml(&contents)
}

/// Save configuration to a file.
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &LapseConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| ConfigError::WriteFile {
            path: parent.display().to_string(),
            source: e,
        })?;
    }

    let contents = config.to_toml()?;
    std::fs::write(path, contents).map_err(|e| ConfigError::WriteFile {
        path: path.display().to_string(),
        source: e,
    })?;

    Ok(())
}

/// Path of the per-user config file.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(APP_NAME).join(USER_CONFIG_FILE))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, namespace: &str) -> PathBuf {
        let path = dir.join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&path, format!("[session]\nnamespace = \"{namespace}\"\n")).unwrap();
        path
    }

    #[test]
    fn test_user_config_path() {
        if let Some(p) = user_config_path() {
            assert!(p.ends_with("lapse/config.toml"));
        }
    }

    #[test]
    fn test_defaults_when_nothing_found() {
        let dir = TempDir::new().unwrap();
        let loaded = load_config_with_options(
            None,
            None,
            Some(dir.path()),
            Some(&dir.path().join("missing.toml")),
        )
        .unwrap();
        assert!(loaded.source.is_none());
        assert_eq!(loaded.config, LapseConfig::default());
    }

    #[test]
    fn test_project_beats_user() {
        let dir = TempDir::new().unwrap();
        let project = write(dir.path(), "lapse.toml", "project");
        let user = write(dir.path(), "user/lapse/config.toml", "user");

        let loaded =
            load_config_with_options(None, None, Some(dir.path()), Some(&user)).unwrap();
        assert_eq!(loaded.source.as_deref(), Some(project.as_path()));
        assert_eq!(loaded.config.session.namespace, "project");
    }

    #[test]
    fn test_user_config_used_without_project_file() {
        let dir = TempDir::new().unwrap();
        let user = write(dir.path(), "user/lapse/config.toml", "user");

        let loaded =
            load_config_with_options(None, None, Some(dir.path()), Some(&user)).unwrap();
        assert_eq!(loaded.config.session.namespace, "user");
    }

    #[test]
    fn test_explicit_beats_env_and_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "lapse.toml", "project");
        let env = write(dir.path(), "env.toml", "env");
        let explicit = write(dir.path(), "explicit.toml", "explicit");

        let loaded =
            load_config_with_options(Some(&explicit), Some(&env), Some(dir.path()), None)
                .unwrap();
        assert_eq!(loaded.config.session.namespace, "explicit");

        let loaded = load_config_with_options(None, Some(&env), Some(dir.path()), None).unwrap();
        assert_eq!(loaded.config.session.namespace, "env");
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("nope.toml");
        let err = load_config_with_options(Some(&missing), None, Some(dir.path()), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::ReadFile { .. }));
    }

    #[test]
    fn test_invalid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lapse.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();

        let err = load_config_file(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/config.toml");

        let mut config = LapseConfig::default();
        config.redis.url = "redis://elsewhere:6380".to_string();
        save_config(&config, &path).unwrap();

        assert_eq!(load_config_file(&path).unwrap(), config);
    }
}
