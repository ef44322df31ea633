use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::{env_subst::substitute_env, schema::BotlinkConfig};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &[
    "botlink.toml",
    "botlink.yaml",
    "botlink.yml",
    "botlink.json",
];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> anyhow::Result<BotlinkConfig> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("failed to read {}: {e}", path.display()))?;
    let raw = substitute_env(&raw);
    parse_config(&raw, path)
}

/// Load an explicitly named config file, or discover one in standard
/// locations.
///
/// Search order when `explicit` is `None`:
/// 1. `./botlink.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/botlink/botlink.{toml,yaml,yml,json}` (user-global)
///
/// An explicit path that fails to load is an error. A discovered file that
/// fails to load is logged and defaults are used, as are defaults when no
/// file exists at all.
pub fn discover_and_load(explicit: Option<&Path>) -> anyhow::Result<BotlinkConfig> {
    if let Some(path) = explicit {
        debug!(path = %path.display(), "loading config");
        return load_config(path);
    }

    let Some(path) = find_config_file() else {
        debug!("no config file found, using defaults");
        return Ok(BotlinkConfig::default());
    };

    debug!(path = %path.display(), "loading config");
    match load_config(&path) {
        Ok(cfg) => Ok(cfg),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load config, using defaults");
            Ok(BotlinkConfig::default())
        },
    }
}

/// Find the first config file in standard locations.
fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns `~/.config/botlink/` on all platforms.
pub fn config_dir() -> Option<PathBuf> {
    home_dir().map(|h| h.join(".config").join("botlink"))
}

/// Returns the data directory: `~/.botlink/` on all platforms.
pub fn data_dir() -> PathBuf {
    home_dir()
        .map(|h| h.join(".botlink"))
        .unwrap_or_else(|| PathBuf::from(".botlink"))
}

fn home_dir() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf())
}

/// Serialize `config` as TOML.
pub fn render_config(config: &BotlinkConfig) -> anyhow::Result<String> {
    toml::to_string_pretty(config).map_err(|e| anyhow::anyhow!("serialize config: {e}"))
}

/// Write `config` as TOML to `path`, or to the user-global config location.
///
/// Refuses to overwrite an existing file. Returns the path written to.
pub fn write_default_config(
    config: &BotlinkConfig,
    path: Option<&Path>,
) -> anyhow::Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("botlink.toml"),
    };
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, render_config(config)?)?;
    debug!(path = %path.display(), "wrote default config file");
    Ok(path)
}

fn parse_config(raw: &str, path: &Path) -> anyhow::Result<BotlinkConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        _ => anyhow::bail!("unsupported config format: .{ext}"),
    }
}

#[cfg(test)]
mod tests {
    use {super::*, crate::schema::StorageConfig};

    #[test]
    fn loads_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botlink.yaml");
        std::fs::write(
            &path,
            "server:\n  port: 9000\nstorage:\n  backend: memory\n",
        )
        .unwrap();
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.port, 9000);
        assert_eq!(cfg.storage, StorageConfig::Memory);
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(discover_and_load(Some(&missing)).is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("botlink.ini");
        std::fs::write(&path, "port=1").unwrap();
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn default_config_round_trips_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("botlink.toml");
        let written = write_default_config(&BotlinkConfig::default(), Some(&path)).unwrap();
        assert_eq!(written, path);
        let cfg = load_config(&path).unwrap();
        assert_eq!(cfg.server.worker_path, "/ws");

        // Second write refuses to clobber.
        assert!(write_default_config(&BotlinkConfig::default(), Some(&path)).is_err());
    }
}
