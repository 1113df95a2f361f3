//! Configuration file parsing for android-debug
//!
//! Supports:
//! - `.android-debug/config.toml` - Project settings
//! - `.android-debug/launch.toml` - Named attach/launch configurations
//! - `<user config dir>/android-debug/config.toml` - Fallback settings

pub mod settings;
pub mod types;

pub use settings::{
    config_dir, find_configuration, init_config_dir, load_launch_file, load_settings,
    user_config_path, CONFIG_DIR,
};
pub use types::*;
