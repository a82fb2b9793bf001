use crate::error::InvokeError;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// Per-call metadata bag, also the wire representation of frame metadata
pub type Metadata = BTreeMap<String, String>;

/// The fixed set of recognized parameter keys.
///
/// Every per-endpoint setting travels as a string in the locator parameter
/// bag, a connection-scoped config map, or per-call metadata; the key set is
/// enumerated here rather than being free-form, and the kebab serials are
/// the on-wire/URI spelling.
#[derive(
    strum::Display, strum::EnumString, strum::AsRefStr, PartialEq, Eq, Clone, Copy, Debug, Hash,
)]
pub enum ParamKey {
    #[strum(serialize = "lease-period")]
    LeasePeriod,
    #[strum(serialize = "poll-period")]
    PollPeriod,
    #[strum(serialize = "ping-frequency")]
    PingFrequency,
    #[strum(serialize = "max-pool-size")]
    MaxPoolSize,
    #[strum(serialize = "max-worker-pool-size")]
    MaxWorkerPoolSize,
    #[strum(serialize = "max-error-count")]
    MaxErrorCount,
    #[strum(serialize = "ack-required")]
    AckRequired,
    #[strum(serialize = "secondary-bind-ports")]
    SecondaryBindPorts,
    #[strum(serialize = "secondary-connect-ports")]
    SecondaryConnectPorts,
    #[strum(serialize = "acquire-timeout")]
    AcquireTimeout,
    #[strum(serialize = "read-timeout")]
    ReadTimeout,
    #[strum(serialize = "write-timeout")]
    WriteTimeout,
    #[strum(serialize = "idle-timeout")]
    IdleTimeout,
    #[strum(serialize = "claim-timeout")]
    ClaimTimeout,
    #[strum(serialize = "pool-low-water")]
    PoolLowWater,
    #[strum(serialize = "secondary-count")]
    SecondaryCount,
}

/// Which source wins when the same key is present in the locator parameter
/// bag, the connection config map, and per-call metadata.
///
/// `LastWriter` is the documented default: locator < config < metadata.
/// `Narrowest` takes the numerically smallest candidate instead, for
/// deployments that prefer the tightest timer regardless of source.
/// The policy is always an explicit constructor argument.
#[derive(PartialEq, Eq, Clone, Copy, Debug, Default)]
pub enum OverridePolicy {
    #[default]
    LastWriter,
    Narrowest,
}

/// Resolves one parameter across the three sources under a policy.
///
/// Sources are borrowed for one resolution pass; absent maps are fine.
pub struct Resolver<'a> {
    locator: Option<&'a BTreeMap<String, String>>,
    config: Option<&'a BTreeMap<String, String>>,
    metadata: Option<&'a Metadata>,
    policy: OverridePolicy,
}

impl<'a> Resolver<'a> {
    pub fn new(
        locator: Option<&'a BTreeMap<String, String>>,
        config: Option<&'a BTreeMap<String, String>>, metadata: Option<&'a Metadata>,
        policy: OverridePolicy,
    ) -> Self {
        Self { locator, config, metadata, policy }
    }

    #[inline]
    fn raw_candidates(&self, key: ParamKey) -> impl Iterator<Item = &'a str> {
        // precedence order: locator first, metadata last
        [self.locator, self.config, self.metadata]
            .into_iter()
            .flatten()
            .filter_map(move |m| m.get(key.as_ref()).map(|s| s.as_str()))
    }

    /// Raw string resolution; `Narrowest` falls back to last-writer for
    /// non-numeric values.
    pub fn get(&self, key: ParamKey) -> Option<&'a str> {
        match self.policy {
            OverridePolicy::LastWriter => self.raw_candidates(key).last(),
            OverridePolicy::Narrowest => {
                let mut best: Option<(u64, &'a str)> = None;
                let mut last: Option<&'a str> = None;
                for s in self.raw_candidates(key) {
                    last = Some(s);
                    if let Ok(n) = s.parse::<u64>() {
                        if best.map_or(true, |(b, _)| n < b) {
                            best = Some((n, s));
                        }
                    }
                }
                best.map(|(_, s)| s).or(last)
            }
        }
    }

    pub fn get_millis(&self, key: ParamKey) -> Result<Option<Duration>, InvokeError> {
        match self.get(key) {
            None => Ok(None),
            Some(s) => match s.parse::<u64>() {
                Ok(ms) => Ok(Some(Duration::from_millis(ms))),
                Err(_) => {
                    Err(InvokeError::config(format!("param {} is not millis: {:?}", key, s)))
                }
            },
        }
    }

    pub fn get_usize(&self, key: ParamKey) -> Result<Option<usize>, InvokeError> {
        match self.get(key) {
            None => Ok(None),
            Some(s) => match s.parse::<usize>() {
                Ok(n) => Ok(Some(n)),
                Err(_) => {
                    Err(InvokeError::config(format!("param {} is not a count: {:?}", key, s)))
                }
            },
        }
    }

    pub fn get_bool(&self, key: ParamKey) -> Result<Option<bool>, InvokeError> {
        match self.get(key) {
            None => Ok(None),
            Some(s) => match s {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(InvokeError::config(format!("param {} is not a bool: {:?}", key, s))),
            },
        }
    }
}

/// Parse a comma-separated port list param ("7801,7802,7803")
pub fn parse_port_list(key: ParamKey, s: &str) -> Result<Vec<u16>, InvokeError> {
    let mut ports = Vec::new();
    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match u16::from_str(part) {
            Ok(p) => ports.push(p),
            Err(_) => {
                return Err(InvokeError::config(format!("param {} has bad port {:?}", key, part)));
            }
        }
    }
    Ok(ports)
}

#[derive(Clone, Copy)]
pub struct TimeoutSetting {
    /// Socket read timeout for one frame segment
    pub read_timeout: Duration,
    /// Socket write timeout
    pub write_timeout: Duration,
    /// Worker waits this long for the next request before closing the conn.
    /// Zero disables the idle check.
    pub idle_timeout: Duration,
    /// Wait for a pooled connection when the pool is at capacity
    pub acquire_timeout: Duration,
}

impl Default for TimeoutSetting {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(120),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

/// Client invoker configuration; locator params override these defaults
/// through a [Resolver] at connect time.
#[derive(Clone)]
pub struct ClientConfig {
    pub timeout: TimeoutSetting,
    /// Max pooled connections per invoker
    pub max_pool_size: usize,
    /// Lease period; None disables the lease pinger
    pub lease_period: Option<Duration>,
    /// POLL-mode callback poll period
    pub poll_period: Duration,
    /// Connection-scoped param overrides (the middle precedence source)
    pub params: BTreeMap<String, String>,
    pub policy: OverridePolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            max_pool_size: 8,
            lease_period: None,
            poll_period: Duration::from_millis(500),
            params: BTreeMap::new(),
            policy: OverridePolicy::default(),
        }
    }
}

/// Server invoker configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub timeout: TimeoutSetting,
    /// LRU worker pool capacity
    pub max_worker_pool_size: usize,
    /// Callback delivery failures tolerated before a registration is torn down
    pub max_error_count: usize,
    /// How long a push writer waits for a runtime ack
    pub ack_timeout: Duration,
    pub params: BTreeMap<String, String>,
    pub policy: OverridePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: TimeoutSetting::default(),
            max_worker_pool_size: 64,
            max_error_count: 5,
            ack_timeout: Duration::from_secs(5),
            params: BTreeMap::new(),
            policy: OverridePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn maps() -> (BTreeMap<String, String>, BTreeMap<String, String>, Metadata) {
        let mut locator = BTreeMap::new();
        locator.insert("poll-period".to_string(), "1000".to_string());
        let mut config = BTreeMap::new();
        config.insert("poll-period".to_string(), "200".to_string());
        let mut meta = Metadata::new();
        meta.insert("poll-period".to_string(), "600".to_string());
        (locator, config, meta)
    }

    #[test]
    fn test_last_writer_order() {
        let (locator, config, meta) = maps();
        let r =
            Resolver::new(Some(&locator), Some(&config), Some(&meta), OverridePolicy::LastWriter);
        assert_eq!(
            r.get_millis(ParamKey::PollPeriod).unwrap(),
            Some(Duration::from_millis(600))
        );

        // metadata absent: config wins over locator
        let r = Resolver::new(Some(&locator), Some(&config), None, OverridePolicy::LastWriter);
        assert_eq!(
            r.get_millis(ParamKey::PollPeriod).unwrap(),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_narrowest_wins() {
        let (locator, config, meta) = maps();
        let r =
            Resolver::new(Some(&locator), Some(&config), Some(&meta), OverridePolicy::Narrowest);
        assert_eq!(
            r.get_millis(ParamKey::PollPeriod).unwrap(),
            Some(Duration::from_millis(200))
        );
    }

    #[test]
    fn test_missing_key() {
        let (locator, config, meta) = maps();
        let r =
            Resolver::new(Some(&locator), Some(&config), Some(&meta), OverridePolicy::LastWriter);
        assert_eq!(r.get_millis(ParamKey::LeasePeriod).unwrap(), None);
    }

    #[test]
    fn test_bad_value_is_config_error() {
        let mut locator = BTreeMap::new();
        locator.insert("lease-period".to_string(), "soon".to_string());
        let r = Resolver::new(Some(&locator), None, None, OverridePolicy::LastWriter);
        assert!(matches!(
            r.get_millis(ParamKey::LeasePeriod),
            Err(InvokeError::Config(_))
        ));
    }

    #[test]
    fn test_port_list() {
        let ports = parse_port_list(ParamKey::SecondaryBindPorts, "7801, 7802,7803").unwrap();
        assert_eq!(ports, vec![7801, 7802, 7803]);
        assert!(parse_port_list(ParamKey::SecondaryBindPorts, "78o1").is_err());
    }

    #[test]
    fn test_key_serials() {
        assert_eq!(ParamKey::LeasePeriod.as_ref(), "lease-period");
        let k: ParamKey = "secondary-bind-ports".parse().expect("parse key");
        assert_eq!(k, ParamKey::SecondaryBindPorts);
    }
}
