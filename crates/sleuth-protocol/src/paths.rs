use std::path::PathBuf;

/// HTTP route that starts a research task.
pub const START_RESEARCH_PATH: &str = "/api/research";

/// Default websocket route for the task event channel.
pub const EVENTS_PATH: &str = "/ws";

/// HTTP route for the server-side snapshot of a task.
pub fn status_path(task_id: &str) -> String {
    format!("/api/status/{task_id}")
}

/// HTTP route for the plain-text report of a completed task.
pub fn download_path(task_id: &str) -> String {
    format!("/api/download/{task_id}")
}

/// Returns the config directory path for sleuth.
pub fn dirs_path() -> PathBuf {
    if let Ok(config_dir) = std::env::var("XDG_CONFIG_HOME") {
        PathBuf::from(config_dir).join("sleuth")
    } else if let Ok(home) = std::env::var("HOME") {
        PathBuf::from(home).join(".config").join("sleuth")
    } else {
        PathBuf::from("/tmp/sleuth")
    }
}

/// Returns the config file path for the sleuth client.
pub fn config_path() -> PathBuf {
    dirs_path().join("config.toml")
}
