use std::collections::HashSet;
use std::env;
use std::time::Duration;

/// Relay configuration, loaded once at startup from the environment.
///
/// Every field here corresponds to a variable documented in the external
/// interfaces: `RELAY_SHARED_SECRET`, `RELAY_DEVICE_ALLOWLIST`,
/// `RELAY_PENDING_TTL_MS`, `RELAY_PUBLIC_URL`, `HOST`, `PORT`.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub shared_secret: String,
    pub device_allowlist: Option<HashSet<String>>,
    pub pending_ttl: Duration,
    pub public_url: Option<String>,
    pub host: String,
    pub port: u16,
}

impl RelayConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Panics
    ///
    /// Panics if `RELAY_SHARED_SECRET` is unset or empty, or if
    /// `RELAY_PENDING_TTL_MS`/`PORT` are set but not parseable integers.
    pub fn from_env() -> Self {
        let shared_secret = env::var("RELAY_SHARED_SECRET").expect("RELAY_SHARED_SECRET must be set");
        assert!(!shared_secret.is_empty(), "RELAY_SHARED_SECRET must not be empty");

        let device_allowlist = env::var("RELAY_DEVICE_ALLOWLIST").ok().and_then(|raw| {
            let set: HashSet<String> = raw
                .split([',', ' ', '\t'])
                .filter_map(squidrun_protocol::canonicalize_device_id)
                .collect();
            (!set.is_empty()).then_some(set)
        });

        let pending_ttl_ms: u64 = env::var("RELAY_PENDING_TTL_MS")
            .ok()
            .map(|v| v.parse().expect("RELAY_PENDING_TTL_MS must be an integer"))
            .unwrap_or(20_000)
            .max(1_000);

        let public_url = env::var("RELAY_PUBLIC_URL").ok().filter(|s| !s.is_empty());
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_owned());
        let port: u16 = env::var("PORT")
            .ok()
            .map(|v| v.parse().expect("PORT must be an integer"))
            .unwrap_or(8788);

        Self {
            shared_secret,
            device_allowlist,
            pending_ttl: Duration::from_millis(pending_ttl_ms),
            public_url,
            host,
            port,
        }
    }

    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    #[must_use]
    pub fn effective_public_url(&self) -> String {
        self.public_url
            .clone()
            .unwrap_or_else(|| format!("ws://{}:{}", self.host, self.port))
    }
}
