use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Parser;
use rand::seq::SliceRandom;
use reqwest::header::{self, HeaderMap, HeaderValue};

use crate::retry::RetryPolicy;
use crate::{
    Error, Result, DEFAULT_CONCURRENCY, DEFAULT_ENDPOINT, DEFAULT_EXAM, DEFAULT_FLUSH_IDLE_MS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_PROBE_URL, DEFAULT_RETRY_DELAY_SECS, DEFAULT_ROLLS_PATH,
    DEFAULT_SHUTDOWN_GRACE_SECS, DEFAULT_STORE_PATH, DEFAULT_TIMEOUT_SECS,
};

#[derive(Debug, Clone, Parser)]
#[command(name = "roll-scrap")]
#[command(about = "Fetch exam results for every roll number into a resumable JSON store")]
#[command(version)]
pub struct Config {
    /// JSON array of roll numbers to fetch
    #[arg(long, env = "ROLL_SCRAP_ROLLS", default_value = DEFAULT_ROLLS_PATH)]
    pub rolls: PathBuf,

    /// JSON store with the results fetched so far
    #[arg(long, env = "ROLL_SCRAP_STORE", default_value = DEFAULT_STORE_PATH)]
    pub store: PathBuf,

    /// Newline-delimited proxy list. One entry is picked per run.
    #[arg(long, env = "ROLL_SCRAP_PROXIES")]
    pub proxies: Option<PathBuf>,

    /// URL used to check the chosen proxy before starting
    #[arg(long, env = "ROLL_SCRAP_PROBE_URL", default_value = DEFAULT_PROBE_URL)]
    pub probe_url: String,

    /// Result endpoint receiving the form POST
    #[arg(long, env = "ROLL_SCRAP_ENDPOINT", default_value = DEFAULT_ENDPOINT)]
    pub endpoint: String,

    /// Exam context token sent with every request
    #[arg(long, env = "ROLL_SCRAP_EXAM", default_value = DEFAULT_EXAM)]
    pub exam: String,

    /// Number of rolls fetched in parallel
    #[arg(long, env = "ROLL_SCRAP_CONCURRENCY", default_value_t = DEFAULT_CONCURRENCY)]
    pub concurrency: usize,

    /// Attempts per roll before giving up
    #[arg(long, env = "ROLL_SCRAP_MAX_ATTEMPTS", default_value_t = DEFAULT_MAX_ATTEMPTS)]
    pub max_attempts: u32,

    /// Fixed delay between attempts
    #[arg(long, env = "ROLL_SCRAP_RETRY_DELAY_SECS", default_value_t = DEFAULT_RETRY_DELAY_SECS)]
    pub retry_delay_secs: u64,

    /// Per-request timeout
    #[arg(long, env = "ROLL_SCRAP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// How long the writer sleeps when there is nothing to flush
    #[arg(long, env = "ROLL_SCRAP_FLUSH_IDLE_MS", default_value_t = DEFAULT_FLUSH_IDLE_MS)]
    pub flush_idle_ms: u64,

    /// How long to wait for the final flush after an interrupt
    #[arg(long, env = "ROLL_SCRAP_SHUTDOWN_GRACE_SECS", default_value_t = DEFAULT_SHUTDOWN_GRACE_SECS)]
    pub shutdown_grace_secs: u64,

    /// Debug level logging
    #[arg(long, short)]
    pub verbose: bool,

    /// Only log errors
    #[arg(long, short)]
    pub quiet: bool,
}

impl Config {
    /// Rejects values the pipeline can't run with.
    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(Error::Config("concurrency must be at least 1".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max-attempts must be at least 1".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(Error::Config("endpoint must not be empty".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_attempts, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn flush_idle(&self) -> Duration {
        Duration::from_millis(self.flush_idle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Reads a newline-delimited proxy list, skipping blank lines.
pub async fn load_proxies(path: &Path) -> Result<Vec<String>> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| Error::Config(format!("can't read proxy list {}: {e}", path.display())))?;
    let proxies = parse_proxy_list(&raw);
    if proxies.is_empty() {
        return Err(Error::Config(format!(
            "proxy list {} has no entries",
            path.display()
        )));
    }
    Ok(proxies)
}

fn parse_proxy_list(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Picks one proxy for the whole run.
pub fn choose_proxy(proxies: &[String]) -> Option<&str> {
    proxies.choose(&mut rand::thread_rng()).map(String::as_str)
}

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14.4; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36 Edg/124.0.0.0",
];

/// Browser-like headers sent with every request. Read-only once built.
#[derive(Debug, Clone)]
pub struct HeaderProfile {
    base: HeaderMap,
    user_agents: Vec<String>,
}

impl HeaderProfile {
    pub fn for_endpoint(endpoint: &str) -> Result<Self> {
        let url = reqwest::Url::parse(endpoint)
            .map_err(|e| Error::Config(format!("invalid endpoint {endpoint}: {e}")))?;
        let origin = url.origin().ascii_serialization();

        let mut base = HeaderMap::new();
        base.insert(
            header::ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8,application/signed-exchange;v=b3;q=0.7",
            ),
        );
        base.insert(
            header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.9"),
        );
        base.insert(header::CACHE_CONTROL, HeaderValue::from_static("max-age=0"));
        base.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/x-www-form-urlencoded"),
        );
        base.insert(header::UPGRADE_INSECURE_REQUESTS, HeaderValue::from_static("1"));
        base.insert(header::ORIGIN, header_value(&origin)?);
        base.insert(header::REFERER, header_value(endpoint)?);

        Ok(Self {
            base,
            user_agents: USER_AGENTS.iter().map(|ua| ua.to_string()).collect(),
        })
    }

    pub fn base(&self) -> &HeaderMap {
        &self.base
    }

    /// A fresh random user agent for each request.
    pub fn user_agent(&self) -> &str {
        self.user_agents
            .choose(&mut rand::thread_rng())
            .map(String::as_str)
            .unwrap_or(USER_AGENTS[0])
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value).map_err(|e| Error::Config(format!("bad header value {value}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_list_skips_blank_lines() {
        let proxies = parse_proxy_list("http://1.1.1.1:80\n\n  \n http://2.2.2.2:8080 \n");
        assert_eq!(proxies, vec!["http://1.1.1.1:80", "http://2.2.2.2:8080"]);
        let chosen = choose_proxy(&proxies).unwrap();
        assert!(proxies.iter().any(|p| p == chosen));
        assert!(choose_proxy(&[]).is_none());
    }

    #[tokio::test]
    async fn empty_proxy_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy.txt");
        std::fs::write(&path, "\n\n").unwrap();
        assert!(matches!(load_proxies(&path).await, Err(Error::Config(_))));
        assert!(matches!(
            load_proxies(&dir.path().join("missing.txt")).await,
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn header_profile_derives_origin_and_referer() {
        let profile = HeaderProfile::for_endpoint("http://example.com/result/index.php").unwrap();
        assert_eq!(profile.base()[header::ORIGIN], "http://example.com");
        assert_eq!(
            profile.base()[header::REFERER],
            "http://example.com/result/index.php"
        );
        assert!(USER_AGENTS.contains(&profile.user_agent()));
    }

    #[test]
    fn defaults_match_the_documented_values() {
        let config = Config::parse_from(["roll-scrap"]);
        assert_eq!(config.concurrency, 100);
        assert_eq!(config.max_attempts, 30);
        assert_eq!(config.retry_delay_secs, 5);
        assert_eq!(config.timeout_secs, 15);
        assert!(config.validate().is_ok());

        let bad = Config::parse_from(["roll-scrap", "--concurrency", "0"]);
        assert!(matches!(bad.validate(), Err(Error::Config(_))));
    }
}
