use std::env;
use std::time::Duration;

use squidrun_protocol::canonicalize_roles;

/// Bridge configuration, loaded once at startup from the environment.
///
/// Corresponds to the `SQUIDRUN_*` variables documented in the external
/// interfaces: `SQUIDRUN_DEVICE_ID`, `SQUIDRUN_RELAY_URL`,
/// `SQUIDRUN_RELAY_SECRET`, `SQUIDRUN_CROSS_DEVICE`,
/// `SQUIDRUN_AVAILABLE_ROLES`, `SQUIDRUN_ACK_TIMEOUT_MS`,
/// `SQUIDRUN_ACK_MAX_RETRIES`.
#[derive(Clone, Debug)]
pub struct BridgeConfig {
    pub device_id: String,
    pub relay_url: String,
    pub relay_secret: String,
    pub cross_device: bool,
    pub available_roles: Vec<String>,
    pub ack_timeout: Duration,
    pub ack_max_retries: u32,
}

const ACK_MAX_RETRIES_HARD_CAP: u32 = 5;

impl BridgeConfig {
    /// Loads configuration from the process environment.
    ///
    /// # Panics
    ///
    /// Panics if a required variable is unset or empty, or if a numeric
    /// variable is set but not parseable.
    pub fn from_env() -> Self {
        let device_id = env::var("SQUIDRUN_DEVICE_ID").expect("SQUIDRUN_DEVICE_ID must be set");
        assert!(!device_id.is_empty(), "SQUIDRUN_DEVICE_ID must not be empty");

        let relay_url = env::var("SQUIDRUN_RELAY_URL").expect("SQUIDRUN_RELAY_URL must be set");
        let relay_secret =
            env::var("SQUIDRUN_RELAY_SECRET").expect("SQUIDRUN_RELAY_SECRET must be set");

        let cross_device = env::var("SQUIDRUN_CROSS_DEVICE")
            .ok()
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        let available_roles = env::var("SQUIDRUN_AVAILABLE_ROLES")
            .ok()
            .map(|raw| canonicalize_roles(&raw.split(',').map(str::to_owned).collect::<Vec<_>>()))
            .unwrap_or_default();

        let ack_timeout_ms: u64 = env::var("SQUIDRUN_ACK_TIMEOUT_MS")
            .ok()
            .map(|v| v.parse().expect("SQUIDRUN_ACK_TIMEOUT_MS must be an integer"))
            .unwrap_or(1_200);

        let ack_max_retries: u32 = env::var("SQUIDRUN_ACK_MAX_RETRIES")
            .ok()
            .map(|v| v.parse().expect("SQUIDRUN_ACK_MAX_RETRIES must be an integer"))
            .unwrap_or(3)
            .min(ACK_MAX_RETRIES_HARD_CAP);

        Self {
            device_id,
            relay_url,
            relay_secret,
            cross_device,
            available_roles,
            ack_timeout: Duration::from_millis(ack_timeout_ms),
            ack_max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        for var in [
            "SQUIDRUN_DEVICE_ID",
            "SQUIDRUN_RELAY_URL",
            "SQUIDRUN_RELAY_SECRET",
            "SQUIDRUN_CROSS_DEVICE",
            "SQUIDRUN_AVAILABLE_ROLES",
            "SQUIDRUN_ACK_TIMEOUT_MS",
            "SQUIDRUN_ACK_MAX_RETRIES",
        ] {
            unsafe { env::remove_var(var) };
        }
    }

    #[test]
    fn ack_max_retries_is_capped_at_the_hard_limit() {
        clear_env();
        unsafe {
            env::set_var("SQUIDRUN_DEVICE_ID", "D1");
            env::set_var("SQUIDRUN_RELAY_URL", "ws://localhost:8788/ws/v1/relay");
            env::set_var("SQUIDRUN_RELAY_SECRET", "s3cr3t");
            env::set_var("SQUIDRUN_ACK_MAX_RETRIES", "50");
        }
        let cfg = BridgeConfig::from_env();
        assert_eq!(cfg.ack_max_retries, ACK_MAX_RETRIES_HARD_CAP);
        clear_env();
    }

    #[test]
    fn available_roles_are_canonicalized() {
        clear_env();
        unsafe {
            env::set_var("SQUIDRUN_DEVICE_ID", "D1");
            env::set_var("SQUIDRUN_RELAY_URL", "ws://localhost:8788/ws/v1/relay");
            env::set_var("SQUIDRUN_RELAY_SECRET", "s3cr3t");
            env::set_var("SQUIDRUN_AVAILABLE_ROLES", "Architect, Builder,builder");
        }
        let cfg = BridgeConfig::from_env();
        assert_eq!(cfg.available_roles, vec!["architect".to_string(), "builder".to_string()]);
        clear_env();
    }
}
