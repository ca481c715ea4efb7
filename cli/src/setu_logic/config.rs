use clap::Parser;
use lib_setu::ManagerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "setu_listen.conf";

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Mechanic Setu job notification listener", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "SETU_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "SETU_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "SETU_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "SETU_API_BASE_URL", help = "REST base URL, including the /api prefix.")]
    pub api_base_url: Option<String>,

    #[clap(long, env = "SETU_TOKEN_PATH", help = "Path of the socket token endpoint, relative to the REST base.")]
    pub token_path: Option<String>,

    #[clap(long, env = "SETU_NOTIFICATION_PATH", help = "Path of the job notification socket on the server origin.")]
    pub notification_path: Option<String>,

    #[clap(long, env = "SETU_HEARTBEAT_INTERVAL_SECONDS", help = "Seconds between heartbeats on an open socket (0 disables).")]
    pub heartbeat_interval_seconds: Option<u64>,

    #[clap(long, env = "SETU_REFRESH_INTERVAL_SECONDS", help = "Seconds after which an open socket is recycled with a fresh token.")]
    pub refresh_interval_seconds: Option<u64>,

    #[clap(long, env = "SETU_STORE_PATH", help = "JSON file holding the persisted login flag.")]
    pub store_path: Option<PathBuf>,

    #[clap(long, env = "SETU_EMAIL", help = "Log in with an emailed one-time code for this address.")]
    pub email: Option<String>,

    #[clap(long, env = "SETU_GOOGLE_TOKEN", help = "Log in with a Google ID token instead of an emailed code.")]
    pub google_token: Option<String>,

    #[clap(long, env = "SETU_ASSUME_AUTHENTICATED", help = "Skip the profile check and connect straight away (true/false).")]
    pub assume_authenticated: Option<bool>,

    #[clap(long, env = "SETU_REQUEST_ID", help = "Service request to subscribe to once connected.")]
    pub request_id: Option<i64>,

    #[clap(long, env = "SETU_JOB_ID", help = "Active job id reported in heartbeats.")]
    pub job_id: Option<String>,

    #[clap(long, env = "SETU_LOGOUT_ON_EXIT", help = "End the backend session on shutdown (true/false).")]
    pub logout_on_exit: Option<bool>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            api_base_url: other.api_base_url.or(self.api_base_url),
            token_path: other.token_path.or(self.token_path),
            notification_path: other.notification_path.or(self.notification_path),
            heartbeat_interval_seconds: other.heartbeat_interval_seconds.or(self.heartbeat_interval_seconds),
            refresh_interval_seconds: other.refresh_interval_seconds.or(self.refresh_interval_seconds),
            store_path: other.store_path.or(self.store_path),
            email: other.email.or(self.email),
            google_token: other.google_token.or(self.google_token),
            assume_authenticated: other.assume_authenticated.or(self.assume_authenticated),
            request_id: other.request_id.or(self.request_id),
            job_id: other.job_id.or(self.job_id),
            logout_on_exit: other.logout_on_exit.or(self.logout_on_exit),
        }
    }

    fn defaults() -> Config {
        let manager = ManagerConfig::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            api_base_url: Some(manager.api_base_url),
            token_path: Some(manager.token_path),
            notification_path: Some(manager.notification_path),
            heartbeat_interval_seconds: Some(manager.heartbeat_interval.as_secs()),
            refresh_interval_seconds: Some(manager.refresh_interval.as_secs()),
            assume_authenticated: Some(false),
            logout_on_exit: Some(false),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> &Path {
        self.log_dir.as_deref().unwrap_or_else(|| Path::new("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(default_store_path)
    }

    /// Connection manager settings; anything unset keeps the library default.
    pub fn manager_config(&self) -> ManagerConfig {
        let mut manager = ManagerConfig::default();
        if let Some(url) = &self.api_base_url {
            manager.api_base_url = url.clone();
        }
        if let Some(path) = &self.token_path {
            manager.token_path = path.clone();
        }
        if let Some(path) = &self.notification_path {
            manager.notification_path = path.clone();
        }
        if let Some(secs) = self.heartbeat_interval_seconds {
            manager.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = self.refresh_interval_seconds {
            manager.refresh_interval = Duration::from_secs(secs);
        }
        manager
    }
}

fn default_store_path() -> PathBuf {
    match dirs::data_local_dir() {
        Some(dir) => dir.join("mechanic-setu").join("session.json"),
        None => PathBuf::from("setu_session.json"),
    }
}

pub fn load_config() -> Config {
    layer_config(Config::parse())
}

/// Defaults, then the JSON file, then environment and CLI (already folded into `cli` by clap).
pub fn layer_config(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();

    if config_file_path.exists() {
        match fs::read_to_string(&config_file_path) {
            Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
                Ok(file_config) => current_config = current_config.merge(file_config),
                Err(e) => log::warn!(
                    "Failed to parse config file {}: {}. Falling back to other sources.",
                    config_file_path.display(),
                    e
                ),
            },
            Err(e) => log::warn!(
                "Failed to read config file {}: {}. Falling back to other sources.",
                config_file_path.display(),
                e
            ),
        }
    } else {
        log::info!(
            "Config file not found at {}. Using defaults and environment/CLI variables.",
            config_file_path.display()
        );
    }

    current_config.merge(cli)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn file_overrides_defaults_and_cli_overrides_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("setu_listen.conf");
        fs::write(
            &path,
            r#"{"apiBaseUrl":"http://127.0.0.1:8000/api","heartbeatIntervalSeconds":5,"requestId":42}"#,
        )
        .unwrap();

        let cli = Config::try_parse_from([
            "setu_listen",
            "--config-path",
            path.to_str().unwrap(),
            "--request-id",
            "77",
        ])
        .unwrap();
        let config = layer_config(cli);

        assert_eq!(config.api_base_url.as_deref(), Some("http://127.0.0.1:8000/api"));
        assert_eq!(config.request_id, Some(77));
        assert_eq!(config.log_level(), "info");

        let manager = config.manager_config();
        assert_eq!(manager.heartbeat_interval, Duration::from_secs(5));
        assert_eq!(manager.refresh_interval, Duration::from_secs(240));
        assert_eq!(manager.token_path, "/core/ws-token/");
    }

    #[test]
    fn unreadable_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.conf");
        fs::write(&path, "{ not json").unwrap();

        let cli = Config::try_parse_from(["setu_listen", "--config-path", path.to_str().unwrap()]).unwrap();
        let config = layer_config(cli);
        assert_eq!(
            config.api_base_url.as_deref(),
            Some("https://mechanic-setu.onrender.com/api")
        );
        assert_eq!(config.assume_authenticated, Some(false));
    }
}
