use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub headless: bool,
    /// 未指定なら `CHROME_PATH` / `CHROMIUM_PATH`、それも無ければ自動検出
    pub chrome_path: Option<PathBuf>,
    /// ランごとのダウンロード先はこの配下に作る
    pub download_root: PathBuf,
    /// `timeoutMs` 未指定のステップに使うタイムアウト
    pub default_step_timeout: Duration,
    /// セレクタ解決の暗黙ポーリング時間
    pub selector_poll: Duration,
    pub poll_interval: Duration,
    pub two_factor_timeout: Duration,
    pub max_concurrent_sessions: usize,
    /// CDPリクエストタイムアウト
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            headless: true,
            chrome_path: std::env::var("CHROME_PATH")
                .or_else(|_| std::env::var("CHROMIUM_PATH"))
                .ok()
                .map(PathBuf::from),
            download_root: PathBuf::from("./downloads"),
            default_step_timeout: Duration::from_secs(30),
            selector_poll: Duration::from_secs(5),
            poll_interval: Duration::from_millis(250),
            two_factor_timeout: Duration::from_secs(300),
            max_concurrent_sessions: 4,
            request_timeout: Duration::from_secs(60),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 既定値に環境変数を重ねる
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(headless) = env_parse::<bool>("SCRAPER_HEADLESS") {
            config.headless = headless;
        }
        if let Ok(root) = std::env::var("SCRAPER_DOWNLOAD_ROOT") {
            config.download_root = PathBuf::from(root);
        }
        if let Some(max) = env_parse::<usize>("SCRAPER_MAX_SESSIONS") {
            config = config.with_max_concurrent_sessions(max);
        }
        if let Some(ms) = env_parse::<u64>("SCRAPER_STEP_TIMEOUT_MS") {
            config.default_step_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = env_parse::<u64>("SCRAPER_TWO_FACTOR_TIMEOUT_MS") {
            config.two_factor_timeout = Duration::from_millis(ms);
        }
        config
    }

    pub fn with_headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_chrome_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.chrome_path = Some(path.into());
        self
    }

    pub fn with_download_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.download_root = path.into();
        self
    }

    pub fn with_default_step_timeout(mut self, timeout: Duration) -> Self {
        self.default_step_timeout = timeout;
        self
    }

    pub fn with_selector_poll(mut self, timeout: Duration) -> Self {
        self.selector_poll = timeout;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_two_factor_timeout(mut self, timeout: Duration) -> Self {
        self.two_factor_timeout = timeout;
        self
    }

    pub fn with_max_concurrent_sessions(mut self, max: usize) -> Self {
        self.max_concurrent_sessions = max.max(1);
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// ミリ秒指定があればそれを、無ければ既定のステップタイムアウトを返す
    pub fn step_timeout(&self, timeout_ms: Option<u64>) -> Duration {
        timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_step_timeout)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!("Ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = EngineConfig::new()
            .with_headless(false)
            .with_download_root("/tmp/runs")
            .with_max_concurrent_sessions(0)
            .with_default_step_timeout(Duration::from_secs(10));

        assert!(!config.headless);
        assert_eq!(config.download_root, PathBuf::from("/tmp/runs"));
        assert_eq!(config.max_concurrent_sessions, 1);
        assert_eq!(config.step_timeout(None), Duration::from_secs(10));
        assert_eq!(config.step_timeout(Some(2000)), Duration::from_millis(2000));
    }

    #[test]
    fn test_from_env_overlays_defaults() {
        std::env::set_var("SCRAPER_MAX_SESSIONS", "7");
        std::env::set_var("SCRAPER_STEP_TIMEOUT_MS", "not-a-number");
        let config = EngineConfig::from_env();
        std::env::remove_var("SCRAPER_MAX_SESSIONS");
        std::env::remove_var("SCRAPER_STEP_TIMEOUT_MS");

        assert_eq!(config.max_concurrent_sessions, 7);
        assert_eq!(config.default_step_timeout, Duration::from_secs(30));
    }
}
