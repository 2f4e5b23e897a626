//! Process-wide configuration, read once from the environment.

use once_cell::sync::Lazy;
use std::path::PathBuf;

pub static CONFIG: Lazy<Config> = Lazy::new(Config::from_env);

#[derive(Debug, Clone)]
pub struct Config {
    pub manager_ip: String,
    pub manager_port: u16,
    pub executor_port: u16,
    pub web_server_ip: String,
    pub web_server_port: u16,
    pub web_account: Option<String>,
    pub web_password: Option<String>,
    /// Heartbeat interval in minutes. Can be raised on stable networks.
    pub keep_alive_interval: u64,
    /// Build parallelism, defaults to the CPU count (4 if unknown).
    pub parallel_build: usize,
    /// Holds unpacked templates, per-judgment working copies and token caches.
    pub tmp_dir: PathBuf,
    /// Holds one log file per judgment.
    pub log_dir: PathBuf,
    /// Manager only: state-store connection string.
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> Config {
        Config {
            manager_ip: env_or("MANAGER_IP", "127.0.0.1"),
            manager_port: env_parse("MANAGER_PORT", 10010),
            executor_port: env_parse("EXECUTOR_PORT", 10011),
            web_server_ip: env_or("WEB_SERVER_IP", "127.0.0.1"),
            web_server_port: env_parse("WEB_SERVER_PORT", 8000),
            web_account: std::env::var("WEB_ACCOUNT").ok(),
            web_password: std::env::var("WEB_PASSWORD").ok(),
            keep_alive_interval: env_parse("KEEP_ALIVE_INTERVAL", 1),
            parallel_build: env_parse("PARALLEL_BUILD", default_parallelism()),
            tmp_dir: PathBuf::from(env_or("TMP_DIR", "/tmp")),
            log_dir: PathBuf::from(env_or("LOG_DIR", "/var/log/judgment")),
            database_url: env_or("DATABASE_URL", "sqlite://judger.db?mode=rwc"),
        }
    }

    pub fn web_base_url(&self) -> String {
        format!("http://{}:{}", self.web_server_ip, self.web_server_port)
    }

    pub fn manager_base_url(&self) -> String {
        format!("http://{}:{}", self.manager_ip, self.manager_port)
    }

    /// Where the pipeline reports its verdict.
    pub fn result_endpoint(&self, judgment_id: i64) -> String {
        format!("{}/api/judge/{}/result", self.manager_base_url(), judgment_id)
    }

    /// Where the heartbeat reporter posts executor status.
    pub fn executors_endpoint(&self) -> String {
        format!("{}/api/judge/executors", self.manager_base_url())
    }

    pub fn token_cache_path(&self, role: &str) -> PathBuf {
        self.tmp_dir.join(format!("oj_judger_{}_tokens.json", role))
    }

    pub fn template_cache_dir(&self) -> PathBuf {
        self.tmp_dir.join("templates")
    }

    pub fn working_dir(&self, judgment_id: i64) -> PathBuf {
        self.tmp_dir.join(format!("judgement_for_{}", judgment_id))
    }

    pub fn judgment_log_path(&self, judgment_id: i64) -> PathBuf {
        self.log_dir.join(format!("{}.log", judgment_id))
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
