/// Canonical file paths for unbell.
///
/// The daemon reads an optional config from ~/.config/unbell/config.toml;
/// everything else it needs lives on the other side of the websocket.
use std::path::PathBuf;

const APP_DIR_NAME: &str = "unbell";
pub const CONFIG_FILE_NAME: &str = "config.toml";

fn home_dir() -> PathBuf {
    let home = std::env::var("HOME").expect("HOME environment variable not set");
    PathBuf::from(home)
}

/// Returns the unbell config directory: ~/.config/unbell/
pub fn app_config_dir() -> PathBuf {
    home_dir().join(".config").join(APP_DIR_NAME)
}

/// Returns the full path to the config file: ~/.config/unbell/config.toml
pub fn config_file_path() -> PathBuf {
    app_config_dir().join(CONFIG_FILE_NAME)
}
