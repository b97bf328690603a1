use std::env;
use std::str::FromStr;
use std::time::Duration;

use portcullis_core::errors::ConfigError;

/// Identity and weight of one upstream target, parsed from `GATEWAY_BACKENDS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub weight: u32,
}

/// Window-based rate limit knobs shared by the window/log/counter limiters.
#[derive(Debug, Clone)]
pub struct RateSettings {
    pub max_requests: u64,
    pub window: Duration,
}

/// Bucket knobs shared by the token and leaky bucket limiters.
#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub capacity: f64,
    /// Tokens refilled (or queue units leaked) per second.
    pub rate: f64,
}

/// Circuit breaker knobs, one set shared by every per-backend breaker.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub monitor_window: Duration,
    pub reset_timeout: Duration,
    pub half_open_max: u32,
}

/// Upstream proxying knobs.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    pub upstream_timeout: Duration,
    pub trust_forwarded_for: bool,
    pub max_concurrency: usize,
}

/// CORS response header knobs.
#[derive(Debug, Clone)]
pub struct CorsSettings {
    pub allowed_origins: Vec<String>,
    pub max_age: Duration,
}

/// Global gateway configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub backends: Vec<BackendConfig>,
    pub rate: RateSettings,
    pub bucket: BucketSettings,
    pub breaker: BreakerSettings,
    pub proxy: ProxySettings,
    pub cors: CorsSettings,
    pub virtual_nodes: usize,
    pub default_rate_limiter: String,
    pub default_load_balancer: String,
}

const DEFAULT_BACKENDS: &str =
    "alpha=127.0.0.1:4001:3,beta=127.0.0.1:4002:2,gamma=127.0.0.1:4003:1";

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = env::var("GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:4000".to_string());

        let backends_raw = env::var("GATEWAY_BACKENDS")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BACKENDS.to_string());
        let backends = parse_backends(&backends_raw)?;

        let rate = RateSettings {
            max_requests: parse_env::<u64>("GATEWAY_RATE_LIMIT_MAX", 50)?.max(1),
            window: Duration::from_millis(
                parse_env::<u64>("GATEWAY_RATE_LIMIT_WINDOW_MS", 60_000)?.max(1),
            ),
        };

        let bucket = BucketSettings {
            capacity: parse_env::<f64>("GATEWAY_BUCKET_CAPACITY", 20.0)?.max(1.0),
            rate: parse_env::<f64>("GATEWAY_BUCKET_RATE", 5.0)?.max(0.001),
        };

        let breaker = BreakerSettings {
            failure_threshold: parse_env::<u32>("GATEWAY_CIRCUIT_FAILURE_THRESHOLD", 3)?.max(1),
            monitor_window: Duration::from_millis(
                parse_env::<u64>("GATEWAY_CIRCUIT_MONITOR_WINDOW_MS", 10_000)?.max(1),
            ),
            reset_timeout: Duration::from_millis(
                parse_env::<u64>("GATEWAY_CIRCUIT_RESET_MS", 15_000)?.max(1),
            ),
            half_open_max: parse_env::<u32>("GATEWAY_CIRCUIT_HALF_OPEN_MAX", 1)?.max(1),
        };

        let proxy = ProxySettings {
            upstream_timeout: Duration::from_millis(
                parse_env::<u64>("GATEWAY_UPSTREAM_TIMEOUT_MS", 5_000)?.max(100),
            ),
            trust_forwarded_for: parse_env::<u64>("GATEWAY_TRUST_FORWARDED_FOR", 1)? != 0,
            max_concurrency: parse_env::<usize>("GATEWAY_MAX_CONCURRENCY", 128)?.max(1),
        };

        let allowed_origins = env::var("GATEWAY_ALLOWED_ORIGINS")
            .ok()
            .map(|value| {
                value
                    .split(',')
                    .filter_map(|origin| {
                        let trimmed = origin.trim();
                        if trimmed.is_empty() {
                            None
                        } else {
                            Some(trimmed.to_string())
                        }
                    })
                    .collect::<Vec<_>>()
            })
            .filter(|origins| !origins.is_empty())
            .unwrap_or_else(|| vec!["*".to_string()]);

        let cors = CorsSettings {
            allowed_origins,
            max_age: Duration::from_secs(parse_env::<u64>("GATEWAY_CORS_MAX_AGE_SECS", 86_400)?),
        };

        let virtual_nodes = parse_env::<usize>("GATEWAY_VIRTUAL_NODES", 150)?.max(1);

        let default_rate_limiter =
            env::var("GATEWAY_RATE_LIMITER").unwrap_or_else(|_| "fixed_window".to_string());
        let default_load_balancer =
            env::var("GATEWAY_LOAD_BALANCER").unwrap_or_else(|_| "round_robin".to_string());

        Ok(Self {
            bind_address,
            backends,
            rate,
            bucket,
            breaker,
            proxy,
            cors,
            virtual_nodes,
            default_rate_limiter,
            default_load_balancer,
        })
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }
}

/// Parses the `name=host:port:weight` comma list. The weight segment is
/// optional and defaults to 1.
pub fn parse_backends(raw: &str) -> Result<Vec<BackendConfig>, ConfigError> {
    let mut backends = Vec::new();

    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (name, target) = entry.split_once('=').ok_or_else(|| {
            ConfigError::Internal(format!("backend entry `{entry}` is missing `name=`"))
        })?;
        let name = name.trim();
        if name.is_empty() {
            return Err(ConfigError::Internal(format!(
                "backend entry `{entry}` has an empty name"
            )));
        }
        if backends.iter().any(|b: &BackendConfig| b.name == name) {
            return Err(ConfigError::Internal(format!(
                "duplicate backend name `{name}`"
            )));
        }

        let mut parts = target.trim().split(':');
        let host = parts
            .next()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| {
                ConfigError::Internal(format!("backend `{name}` is missing a host"))
            })?;
        let port = parts
            .next()
            .ok_or_else(|| ConfigError::Internal(format!("backend `{name}` is missing a port")))?
            .parse::<u16>()
            .map_err(|err| {
                ConfigError::Internal(format!("backend `{name}` has an invalid port: {err}"))
            })?;
        let weight = match parts.next() {
            Some(value) => value.parse::<u32>().map_err(|err| {
                ConfigError::Internal(format!("backend `{name}` has an invalid weight: {err}"))
            })?,
            None => 1,
        };
        if weight == 0 {
            return Err(ConfigError::Internal(format!(
                "backend `{name}` must have a weight of at least 1"
            )));
        }
        if parts.next().is_some() {
            return Err(ConfigError::Internal(format!(
                "backend entry `{entry}` has trailing segments"
            )));
        }

        backends.push(BackendConfig {
            name: name.to_string(),
            host: host.to_string(),
            port,
            weight,
        });
    }

    if backends.is_empty() {
        return Err(ConfigError::Internal(
            "GATEWAY_BACKENDS resolved to an empty backend list".into(),
        ));
    }

    Ok(backends)
}

fn parse_env<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            if trimmed.is_empty() {
                Ok(default)
            } else {
                T::from_str(trimmed)
                    .map_err(|err| ConfigError::Internal(format!("invalid value for {key}: {err}")))
            }
        }
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(ConfigError::InvalidEnvVar { key, source: err }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_backend_list_with_weights() {
        let backends =
            parse_backends("alpha=127.0.0.1:4001:3,beta=127.0.0.1:4002:2,gamma=10.0.0.9:4003:1")
                .expect("valid list");
        assert_eq!(backends.len(), 3);
        assert_eq!(backends[0].name, "alpha");
        assert_eq!(backends[0].port, 4001);
        assert_eq!(backends[0].weight, 3);
        assert_eq!(backends[2].host, "10.0.0.9");
    }

    #[test]
    fn weight_defaults_to_one() {
        let backends = parse_backends("solo=localhost:9000").expect("valid entry");
        assert_eq!(backends[0].weight, 1);
    }

    #[test]
    fn rejects_duplicate_names_and_zero_weights() {
        assert!(parse_backends("a=h:1,a=h:2").is_err());
        assert!(parse_backends("a=h:1:0").is_err());
    }

    #[test]
    fn rejects_malformed_entries() {
        assert!(parse_backends("no-target").is_err());
        assert!(parse_backends("a=hostonly").is_err());
        assert!(parse_backends("a=h:not-a-port").is_err());
        assert!(parse_backends("").is_err());
    }
}
