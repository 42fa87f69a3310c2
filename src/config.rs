//! Client configuration: connection target, timing knobs, and the
//! reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

/// Default TCP port the server listens on.
pub const DEFAULT_PORT: u16 = 1735;

/// Connection and behavior knobs for a [`crate::Client`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    pub server_addr: String,
    pub server_port: u16,
    pub client_ident: String,
    pub keep_alive_interval: Duration,
    pub rpc_timeout: Duration,
    pub reconnect: bool,
    pub reconnect_backoff: BackoffConfig,
}

impl ClientConfig {
    /// Builds a config pointed at `server_addr` with every other field at
    /// its documented default.
    pub fn new(server_addr: impl Into<String>) -> Self {
        ClientConfig {
            server_addr: server_addr.into(),
            ..Self::default()
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            server_addr: String::new(),
            server_port: DEFAULT_PORT,
            client_ident: String::new(),
            keep_alive_interval: Duration::from_secs(1),
            rpc_timeout: Duration::from_secs(5),
            reconnect: true,
            reconnect_backoff: BackoffConfig::default(),
        }
    }
}

/// Exponential backoff with jitter for reconnect attempts.
#[derive(Clone, Copy, Debug)]
pub struct BackoffConfig {
    pub initial: Duration,
    pub cap: Duration,
    pub factor: f64,
    /// Fractional jitter applied symmetrically around the computed delay,
    /// e.g. `0.25` means the actual delay is the base value +/- 25%.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        BackoffConfig {
            initial: Duration::from_millis(100),
            cap: Duration::from_secs(5),
            factor: 2.0,
            jitter: 0.25,
        }
    }
}

impl BackoffConfig {
    /// Computes the delay before reconnect attempt number `attempt` (0
    /// indexed: the first retry after an initial failure is `attempt = 0`).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial.as_secs_f64() * self.factor.powi(attempt as i32))
            .min(self.cap.as_secs_f64());
        let jitter_span = base * self.jitter;
        let jittered = if jitter_span > 0.0 {
            base + rand::thread_rng().gen_range(-jitter_span..=jitter_span)
        } else {
            base
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }
}
