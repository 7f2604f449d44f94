use directories::{BaseDirs, ProjectDirs};
use std::path::PathBuf;

const APP_DIR: &str = "tutor-relay";

pub fn app_root() -> PathBuf {
    if let Some(project_dirs) = ProjectDirs::from("", "", APP_DIR) {
        return project_dirs.config_dir().to_path_buf();
    }

    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs.config_dir().join(APP_DIR);
    }

    std::env::temp_dir().join(APP_DIR)
}

pub fn default_config_path() -> String {
    app_root()
        .join("config.json")
        .to_string_lossy()
        .to_string()
}
