//! Settings and launch file loading from `.android-debug/`

use std::path::{Path, PathBuf};

use adbg_core::prelude::*;

use super::types::{DebugRequest, LaunchFile, Settings};

const CONFIG_FILENAME: &str = "config.toml";
const LAUNCH_FILENAME: &str = "launch.toml";
pub const CONFIG_DIR: &str = ".android-debug";

pub fn config_dir(project_path: &Path) -> PathBuf {
    project_path.join(CONFIG_DIR)
}

/// Per-user settings, used when a project has no config of its own.
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("android-debug").join(CONFIG_FILENAME))
}

/// Load settings from .android-debug/config.toml, falling back to the
/// per-user config file.
///
/// A missing or unreadable file yields defaults.
pub fn load_settings(project_path: &Path) -> Settings {
    let project_config = config_dir(project_path).join(CONFIG_FILENAME);
    if project_config.exists() {
        return load_settings_file(&project_config);
    }

    match user_config_path() {
        Some(user_config) if user_config.exists() => load_settings_file(&user_config),
        _ => {
            debug!("No config file at {:?}, using defaults", project_config);
            Settings::default()
        }
    }
}

fn load_settings_file(config_path: &Path) -> Settings {
    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Load named configurations from .android-debug/launch.toml
///
/// Unlike settings, a broken launch file is an error: silently dropping a
/// configuration the user asked for by name would be confusing.
pub fn load_launch_file(project_path: &Path) -> Result<LaunchFile> {
    let launch_path = config_dir(project_path).join(LAUNCH_FILENAME);
    if !launch_path.exists() {
        return Ok(LaunchFile::default());
    }

    let content = std::fs::read_to_string(&launch_path)
        .map_err(|e| Error::config(format!("Failed to read {:?}: {}", launch_path, e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::config(format!("Failed to parse {:?}: {}", launch_path, e)))
}

/// Look up a configuration by name.
pub fn find_configuration(project_path: &Path, name: &str) -> Result<DebugRequest> {
    load_launch_file(project_path)?
        .find(name)
        .cloned()
        .ok_or_else(|| Error::config(format!("No configuration named `{}`", name)))
}

/// Create default config files in .android-debug/
pub fn init_config_dir(project_path: &Path) -> Result<()> {
    let dir = config_dir(project_path);

    if !dir.exists() {
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::config(format!("Failed to create {}: {}", CONFIG_DIR, e)))?;
    }

    let config_path = dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        let default_content = r#"# android-debug configuration

[paths]
# adb = "/opt/android-sdk/platform-tools/adb"
# sdk_root = "/opt/android-sdk"     # Defaults to $ANDROID_HOME / $ANDROID_SDK_ROOT
# ndk_root = "/opt/android-ndk"     # Defaults to $ANDROID_NDK_ROOT or <sdk>/ndk/<newest>
# lldb_server_root = ""             # Flat <abi>/lldb-server layout

[timing]
discovery_initial_wait_ms = 3000
discovery_quiet_period_ms = 200
launch_settle_ms = 1000
handshake_timeout_ms = 3000
reply_timeout_ms = 10000
child_stop_timeout_ms = 5000

[abi]
supported = ["armeabi-v7a", "arm64-v8a", "x86", "x86_64"]

[abi.map]
"#;
        std::fs::write(&config_path, default_content)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
        info!("Created {:?}", config_path);
    }

    Ok(())
}
