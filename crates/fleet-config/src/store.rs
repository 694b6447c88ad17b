use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::model::Config;
use crate::validate::validate;

/// Load and validate a config snapshot from `path`.
///
/// The returned snapshot is immutable; hot reload swaps the whole `Arc`.
pub fn load_from_path(path: &Path) -> Result<Arc<Config>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config: {}", path.display()))?;
    let config: Config = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config: {}", path.display()))?;
    validate(&config).with_context(|| format!("invalid config: {}", path.display()))?;
    Ok(Arc::new(config))
}

/// Persist a config snapshot with an atomic same-directory rename, so a
/// concurrent reader never observes a partial write.
pub fn save_to_path(path: &Path, config: &Config) -> Result<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;
    }

    let dir = parent.unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("failed to create temp file in {}", dir.display()))?;

    let payload = serde_json::to_string_pretty(config).context("failed to serialize config")?;
    use std::io::Write;
    tmp.write_all(payload.as_bytes())
        .and_then(|()| tmp.write_all(b"\n"))
        .with_context(|| format!("failed to write config: {}", path.display()))?;

    tmp.persist(path)
        .with_context(|| format!("failed to replace config: {}", path.display()))?;
    Ok(())
}

/// Default config location: `~/.config/mcp-fleet/config.json` (platform
/// equivalent), falling back to the working directory when no home exists.
pub fn default_config_path() -> PathBuf {
    directories::ProjectDirs::from("", "", "mcp-fleet")
        .map(|dirs| dirs.config_dir().join("config.json"))
        .unwrap_or_else(|| PathBuf::from("config.json"))
}
