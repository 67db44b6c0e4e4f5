use rand::Rng;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:8080";
pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(15);
// payout lags the win determination by a few blocks
const DEFAULT_PAYOUT_REFRESH_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_LOBBY_INTERVAL: Duration = Duration::from_secs(6);
const DEFAULT_LOBBY_SIZE: usize = 20;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    pub api_url: String,
    pub ws_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: DEFAULT_WS_URL.to_string(),
        }
    }
}

/// Exponential backoff used when resubscribing after the event stream drops.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub jitter: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: Duration::from_millis(250),
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let jitter_ms = u64::try_from(self.jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        let extra = rand::rng().random_range(0..=jitter_ms);
        base + Duration::from_millis(extra)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncConfig {
    pub poll_interval: Duration,
    pub payout_refresh_delay: Duration,
    pub resubscribe: Backoff,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            payout_refresh_delay: DEFAULT_PAYOUT_REFRESH_DELAY,
            resubscribe: Backoff::default(),
        }
    }
}

impl SyncConfig {
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_payout_refresh_delay(mut self, delay: Duration) -> Self {
        self.payout_refresh_delay = delay;
        self
    }

    pub fn with_resubscribe_backoff(mut self, backoff: Backoff) -> Self {
        self.resubscribe = backoff;
        self
    }
}

/// How the lobby list is kept fresh.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LobbyConfig {
    pub refresh_interval: Duration,
    pub size: usize,
}

impl Default for LobbyConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_LOBBY_INTERVAL,
            size: DEFAULT_LOBBY_SIZE,
        }
    }
}

impl LobbyConfig {
    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }
}
