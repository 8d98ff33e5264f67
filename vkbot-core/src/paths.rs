// ABOUTME: XDG Base Directory paths for config, logs and the record store
// ABOUTME: Falls back to local directories when no home directory can be determined

use directories::ProjectDirs;
use std::path::PathBuf;

const QUALIFIER: &str = "com";
const ORGANIZATION: &str = "vkbot";
const APPLICATION: &str = "vkbot";

pub fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from(QUALIFIER, ORGANIZATION, APPLICATION)
}

/// Data directory (e.g., ~/.local/share/vkbot/), or ./data without XDG
pub fn data_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("./data"))
}

/// e.g., ~/.local/share/vkbot/logs/
pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

/// Config directory (e.g., ~/.config/vkbot/), or the current directory without XDG
pub fn config_dir() -> PathBuf {
    project_dirs()
        .map(|p| p.config_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn config_file() -> PathBuf {
    config_dir().join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_paths_nest_under_their_roots() {
        assert!(log_dir().starts_with(data_dir()));
        assert!(config_file().starts_with(config_dir()));
        assert!(config_file().ends_with("config.toml"));
    }
}
