//! Process configuration.
//!
//! Layered the way the teacher's `medea` binary layers its own
//! configuration: compiled-in defaults, overridden by an optional YAML
//! file, overridden by `CONFCORE_`-prefixed environment variables (loaded
//! from a `.env` file in development via `dotenv`).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

/// Top-level process configuration.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct Conf {
    pub server: ServerConf,
    pub timers: TimersConf,
}

/// HTTP/WebSocket listen configuration.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct ServerConf {
    #[default = "0.0.0.0:8080"]
    pub bind_addr: String,

    /// High-water mark of a session's un-flushed outbound byte count
    /// before the connection is force-closed (§4.C, §5).
    #[default(1024 * 1024)]
    pub outbound_high_water_bytes: usize,
}

/// Every timing constant named by the spec, in one place so they can all
/// be tuned from config instead of scattered `const`s.
#[derive(Clone, Debug, Deserialize, Serialize, SmartDefault)]
#[serde(default)]
pub struct TimersConf {
    /// §3 "FrameFingerprint" TTL.
    #[default(Duration::from_secs(15))]
    #[serde(with = "humantime_serde")]
    pub fingerprint_ttl: Duration,

    /// §4.E sweep cadence ("runs at a cadence ≤ 5s").
    #[default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub fingerprint_sweep_interval: Duration,

    /// §3 "AckWindow" length.
    #[default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub ack_window: Duration,

    /// §4.H decision cadence.
    #[default(Duration::from_secs(2))]
    #[serde(with = "humantime_serde")]
    pub quality_decision_interval: Duration,

    /// §4.H / §3 "QualityDecision" anti-flap interval.
    #[default(Duration::from_secs(10))]
    #[serde(with = "humantime_serde")]
    pub quality_anti_flap: Duration,

    /// §5 "suggest 60s" client inactivity timeout.
    #[default(Duration::from_secs(60))]
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// §5 "suggest 5s" per-call `MediaRouter` deadline.
    #[default(Duration::from_secs(5))]
    #[serde(with = "humantime_serde")]
    pub router_call_deadline: Duration,
}

/// Loads configuration: defaults, then an optional YAML file named by
/// `CONFCORE_CONF`, then `CONFCORE_`-prefixed environment variables.
///
/// # Errors
///
/// Returns an error if the configured file does not parse, or if an
/// environment override does not match the expected type.
pub fn load() -> Result<Conf, config::ConfigError> {
    dotenv::dotenv().ok();

    let mut raw = config::Config::default();
    raw.merge(config::Config::try_from(&Conf::default())?)?;

    if let Ok(path) = std::env::var("CONFCORE_CONF") {
        raw.merge(config::File::with_name(&path))?;
    }
    raw.merge(config::Environment::with_prefix("CONFCORE").separator("__"))?;

    raw.try_into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_constants() {
        let conf = Conf::default();
        assert_eq!(conf.timers.fingerprint_ttl, Duration::from_secs(15));
        assert_eq!(conf.timers.ack_window, Duration::from_secs(5));
        assert_eq!(
            conf.timers.quality_decision_interval,
            Duration::from_secs(2)
        );
        assert_eq!(conf.timers.quality_anti_flap, Duration::from_secs(10));
        assert_eq!(conf.timers.idle_timeout, Duration::from_secs(60));
        assert_eq!(conf.timers.router_call_deadline, Duration::from_secs(5));
        assert_eq!(conf.server.outbound_high_water_bytes, 1024 * 1024);
    }
}
