use std::env;
use std::time::Duration;

pub const DEFAULT_STUN_URL: &str = "stun:stun.l.google.com:19302";

/// ICE server entry handed to the media engine. Only STUN is configured by
/// default, so peers behind symmetric NATs may fail to connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Exponential backoff for re-acquiring the signaling subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub max: Duration,
    pub attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(200),
            max: Duration::from_secs(5),
            attempts: 6,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `retry` (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Call agent configuration
#[derive(Debug, Clone)]
pub struct CallConfig {
    /// ICE servers used for every peer connection
    pub ice_servers: Vec<IceServer>,
    /// Quiet period after the last keystroke before "stopped typing" is sent
    pub typing_quiet_period: Duration,
    /// Volume sampling interval (one display refresh)
    pub volume_tick: Duration,
    /// Samples per spectrum analysis window, rounded up to a power of two in 32..=32768
    pub analysis_window: usize,
    /// Retry policy for the signaling subscription
    pub subscribe_backoff: BackoffPolicy,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![IceServer::stun(DEFAULT_STUN_URL)],
            typing_quiet_period: Duration::from_secs(2),
            volume_tick: Duration::from_millis(16),
            analysis_window: 256,
            subscribe_backoff: BackoffPolicy::default(),
        }
    }
}

impl CallConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = env::var("CALL_ICE_SERVERS") {
            let servers: Vec<IceServer> = raw
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(IceServer::stun)
                .collect();
            // An explicitly empty list means host candidates only.
            config.ice_servers = servers;
        }
        if let Some(ms) = env_u64("CALL_TYPING_QUIET_MS") {
            config.typing_quiet_period = Duration::from_millis(ms);
        }
        if let Some(ms) = env_u64("CALL_VOLUME_TICK_MS").filter(|ms| *ms > 0) {
            config.volume_tick = Duration::from_millis(ms);
        }
        if let Some(attempts) = env_u64("CALL_SUBSCRIBE_ATTEMPTS").filter(|n| *n > 0) {
            config.subscribe_backoff.attempts = attempts.min(u32::MAX as u64) as u32;
        }
        config
    }

    /// Localhost-only configuration (no STUN)
    pub fn localhost() -> Self {
        Self {
            ice_servers: vec![],
            ..Default::default()
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use test_timeout::timeout;

    // Environment variable tests must not run in parallel
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const KEYS: [&str; 4] = [
        "CALL_ICE_SERVERS",
        "CALL_TYPING_QUIET_MS",
        "CALL_VOLUME_TICK_MS",
        "CALL_SUBSCRIBE_ATTEMPTS",
    ];

    fn clear_env() {
        for key in KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = CallConfig::default();
        assert_eq!(config.ice_servers, vec![IceServer::stun(DEFAULT_STUN_URL)]);
        assert_eq!(config.typing_quiet_period, Duration::from_secs(2));
        assert_eq!(config.analysis_window, 256);
    }

    #[timeout(5)]
    fn test_config_from_env_default() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        let config = CallConfig::from_env();
        assert_eq!(config.ice_servers.len(), 1);
        assert_eq!(config.subscribe_backoff, BackoffPolicy::default());
    }

    #[timeout(5)]
    fn test_config_from_env_custom() {
        let _lock = ENV_MUTEX.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        clear_env();
        env::set_var("CALL_ICE_SERVERS", "stun:a.example:3478, stun:b.example:3478");
        env::set_var("CALL_TYPING_QUIET_MS", "500");
        env::set_var("CALL_VOLUME_TICK_MS", "0");
        env::set_var("CALL_SUBSCRIBE_ATTEMPTS", "2");

        let config = CallConfig::from_env();
        assert_eq!(
            config.ice_servers,
            vec![
                IceServer::stun("stun:a.example:3478"),
                IceServer::stun("stun:b.example:3478"),
            ]
        );
        assert_eq!(config.typing_quiet_period, Duration::from_millis(500));
        assert_eq!(config.volume_tick, Duration::from_millis(16), "zero tick is ignored");
        assert_eq!(config.subscribe_backoff.attempts, 2);
        clear_env();
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(5), Duration::from_millis(3200));
        assert_eq!(policy.delay(6), Duration::from_secs(5));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }
}
