//! Default paths for tutord components
//!
//! Paths are user-writable by default:
//! - Socket: `$XDG_RUNTIME_DIR/tutord/tutord.sock` or `/tmp/tutord-$USER/tutord.sock`
//! - Data: `$XDG_DATA_HOME/tutord` or `~/.local/share/tutord`
//! - Config: `$XDG_CONFIG_HOME/tutord/config.toml` or `~/.config/tutord/config.toml`

use std::path::PathBuf;

/// Environment variable for overriding the socket path
pub const TUTORD_SOCKET_ENV: &str = "TUTORD_SOCKET";

/// Environment variable for overriding the data directory
pub const TUTORD_DATA_DIR_ENV: &str = "TUTORD_DATA_DIR";

const SOCKET_FILENAME: &str = "tutord.sock";
const DATABASE_FILENAME: &str = "tutord.db";
const APP_DIR: &str = "tutord";

/// Default socket path, honouring `$TUTORD_SOCKET`.
pub fn default_socket_path() -> PathBuf {
    if let Ok(path) = std::env::var(TUTORD_SOCKET_ENV) {
        return PathBuf::from(path);
    }

    socket_path_without_env()
}

/// Socket path ignoring `$TUTORD_SOCKET`; used for config defaults where the
/// CLI layer applies the env override itself.
pub fn socket_path_without_env() -> PathBuf {
    if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime_dir).join(APP_DIR).join(SOCKET_FILENAME);
    }

    let username = std::env::var("USER").unwrap_or_else(|_| "unknown".to_string());
    PathBuf::from(format!("/tmp/{}-{}", APP_DIR, username)).join(SOCKET_FILENAME)
}

/// Default data directory, honouring `$TUTORD_DATA_DIR`.
pub fn default_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var(TUTORD_DATA_DIR_ENV) {
        return PathBuf::from(path);
    }

    data_dir_without_env()
}

pub fn data_dir_without_env() -> PathBuf {
    if let Ok(data_home) = std::env::var("XDG_DATA_HOME") {
        return PathBuf::from(data_home).join(APP_DIR);
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".local").join("share").join(APP_DIR);
    }

    PathBuf::from("/tmp").join(APP_DIR).join("data")
}

/// Database file inside a data directory
pub fn database_path(data_dir: &std::path::Path) -> PathBuf {
    data_dir.join(DATABASE_FILENAME)
}

/// Default configuration file path
pub fn default_config_path() -> PathBuf {
    if let Ok(config_home) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(config_home).join(APP_DIR).join("config.toml");
    }

    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml");
    }

    PathBuf::from("/etc").join(APP_DIR).join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_path_contains_app_dir() {
        let path = socket_path_without_env();
        assert!(path.to_string_lossy().contains("tutord"));
        assert!(path.to_string_lossy().ends_with(".sock"));
    }

    #[test]
    fn database_lives_in_data_dir() {
        let dir = data_dir_without_env();
        let db = database_path(&dir);
        assert_eq!(db.parent().unwrap(), dir);
        assert!(db.to_string_lossy().ends_with("tutord.db"));
    }

    #[test]
    fn config_path_is_toml() {
        assert!(default_config_path().to_string_lossy().ends_with("config.toml"));
    }
}
