use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use squidrun_protocol::PAIRING_CODE_ALPHABET;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

const CODE_LEN: usize = 6;
const CODE_TTL: Duration = Duration::from_secs(90);
const MAX_GENERATION_ATTEMPTS: u32 = 10;
const MAX_FAILED_ATTEMPTS: u32 = 5;

pub struct PairingEntry {
    pub code: String,
    pub initiator_device: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub failed_attempts: u32,
    pub failed_by_source: HashMap<String, u32>,
    cleanup_task: JoinHandle<()>,
}

impl Drop for PairingEntry {
    fn drop(&mut self) {
        self.cleanup_task.abort();
    }
}

pub enum JoinOutcome {
    Success { entry: PairingEntry },
    InvalidCode,
    Expired,
    RateLimited,
}

/// Issues and redeems short-lived pairing codes.
///
/// At most one code is ever live per initiator device; issuing a new one
/// purges the previous one. Both a per-code and a per-source failure
/// counter guard against brute-forcing the 6-character alphabet.
#[derive(Clone, Default)]
pub struct PairingEngine {
    by_code: Arc<RwLock<HashMap<String, PairingEntry>>>,
    by_initiator: Arc<RwLock<HashMap<String, String>>>,
    /// Consecutive-failure count per source (remote address or socket
    /// identity), independent of any one code. Once a source reaches
    /// the cap, every subsequent redemption it attempts is rejected as
    /// rate-limited — including one that names a code that is, in
    /// fact, still live, which is destroyed as a protective measure.
    source_failures: Arc<RwLock<HashMap<String, u32>>>,
}

impl PairingEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues a fresh code for `initiator_device`, purging any code that
    /// device already held. Returns `None` if the alphabet is exhausted
    /// after [`MAX_GENERATION_ATTEMPTS`] collision retries (rate-limited).
    pub async fn init(&self, initiator_device: String) -> Option<(String, i64)> {
        self.purge_for_initiator(&initiator_device).await;

        let mut code = None;
        {
            let map = self.by_code.read().await;
            for _ in 0..MAX_GENERATION_ATTEMPTS {
                let candidate = random_code();
                if !map.contains_key(&candidate) {
                    code = Some(candidate);
                    break;
                }
            }
        }
        let code = code?;

        let created_at = crate::registry::now_millis();
        let expires_at = created_at + i64::try_from(CODE_TTL.as_millis()).unwrap_or(i64::MAX);

        let cleanup_code = code.clone();
        let cleanup_map = self.by_code.clone();
        let cleanup_by_initiator = self.by_initiator.clone();
        let cleanup_task = tokio::spawn(async move {
            tokio::time::sleep(CODE_TTL + Duration::from_millis(100)).await;
            if let Some(entry) = cleanup_map.write().await.remove(&cleanup_code) {
                debug!(code = %cleanup_code, "pairing code expired");
                cleanup_by_initiator.write().await.remove(&entry.initiator_device);
            }
        });

        self.by_code.write().await.insert(
            code.clone(),
            PairingEntry {
                code: code.clone(),
                initiator_device: initiator_device.clone(),
                created_at,
                expires_at,
                failed_attempts: 0,
                failed_by_source: HashMap::new(),
                cleanup_task,
            },
        );
        self.by_initiator.write().await.insert(initiator_device, code.clone());

        Some((code, expires_at))
    }

    /// Attempts to redeem `code` on behalf of `source` (a remote address
    /// or socket identity). A source that has already accumulated
    /// [`MAX_FAILED_ATTEMPTS`] misses is blackholed: further attempts
    /// always fail, and if the named code happens to be real, it is
    /// destroyed too rather than handed out to a likely attacker.
    pub async fn join(&self, raw_code: &str, source: &str) -> JoinOutcome {
        let code = raw_code.trim().to_uppercase();
        let now = crate::registry::now_millis();

        if *self.source_failures.read().await.get(source).unwrap_or(&0) >= MAX_FAILED_ATTEMPTS {
            if let Some(entry) = self.by_code.write().await.remove(&code) {
                self.by_initiator.write().await.remove(&entry.initiator_device);
            }
            return JoinOutcome::RateLimited;
        }

        let mut map = self.by_code.write().await;
        let Some(entry) = map.get_mut(&code) else {
            drop(map);
            *self.source_failures.write().await.entry(source.to_owned()).or_insert(0) += 1;
            return JoinOutcome::InvalidCode;
        };

        if now >= entry.expires_at {
            let entry = map.remove(&code).expect("checked above");
            self.by_initiator.write().await.remove(&entry.initiator_device);
            return JoinOutcome::Expired;
        }

        // Success: remove the entry and unlink the initiator index.
        let entry = map.remove(&code).expect("checked above");
        self.by_initiator.write().await.remove(&entry.initiator_device);
        JoinOutcome::Success { entry }
    }

    /// Records a failed redemption attempt (wrong code already handled
    /// by `join`'s `InvalidCode` branch — this records a failure counted
    /// against a code that *did* resolve but was otherwise rejected,
    /// e.g. self-pairing). Returns `true` if this attempt tripped the cap.
    pub async fn record_failure(&self, code: &str, source: &str) -> bool {
        let mut map = self.by_code.write().await;
        let Some(entry) = map.get_mut(code) else { return false };
        entry.failed_attempts += 1;
        *entry.failed_by_source.entry(source.to_owned()).or_insert(0) += 1;
        let tripped = entry.failed_attempts >= MAX_FAILED_ATTEMPTS;
        if tripped {
            let entry = map.remove(code).expect("checked above");
            self.by_initiator.write().await.remove(&entry.initiator_device);
        }
        tripped
    }

    /// Reads the initiator device for a code without consuming or
    /// mutating anything. Used to detect self-pairing before `join`
    /// would otherwise treat it as a normal redemption.
    pub async fn peek_initiator(&self, raw_code: &str) -> Option<String> {
        let code = raw_code.trim().to_uppercase();
        self.by_code.read().await.get(&code).map(|e| e.initiator_device.clone())
    }

    /// Purges the code (if any) belonging to a device whose socket just
    /// disconnected.
    pub async fn purge_for_initiator(&self, initiator_device: &str) {
        let code = self.by_initiator.write().await.remove(initiator_device);
        if let Some(code) = code {
            self.by_code.write().await.remove(&code);
        }
    }

    pub async fn len(&self) -> usize {
        self.by_code.read().await.len()
    }
}

fn random_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| {
            let idx = rng.gen_range(0..PAIRING_CODE_ALPHABET.len());
            PAIRING_CODE_ALPHABET[idx] as char
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_code_uses_only_alphabet_characters() {
        let code = random_code();
        assert_eq!(code.len(), CODE_LEN);
        for c in code.chars() {
            assert!(PAIRING_CODE_ALPHABET.contains(&(c as u8)));
        }
    }

    #[tokio::test]
    async fn init_then_join_succeeds_once_and_purges_the_code() {
        let engine = PairingEngine::new();
        let (code, _expires_at) = engine.init("A".into()).await.expect("code issued");

        let outcome = engine.join(&code, "1.2.3.4").await;
        assert!(matches!(outcome, JoinOutcome::Success { .. }));
        assert_eq!(engine.len().await, 0);

        let second = engine.join(&code, "1.2.3.4").await;
        assert!(matches!(second, JoinOutcome::InvalidCode));
    }

    #[tokio::test]
    async fn issuing_a_second_code_purges_the_first() {
        let engine = PairingEngine::new();
        let (code1, _) = engine.init("A".into()).await.unwrap();
        let (code2, _) = engine.init("A".into()).await.unwrap();
        assert_ne!(code1, code2);
        assert_eq!(engine.len().await, 1);
        assert!(matches!(engine.join(&code1, "src").await, JoinOutcome::InvalidCode));
        assert!(matches!(engine.join(&code2, "src").await, JoinOutcome::Success { .. }));
    }

    #[tokio::test]
    async fn five_failed_attempts_trip_the_cap_and_destroy_the_code() {
        let engine = PairingEngine::new();
        let (code, _) = engine.init("A".into()).await.unwrap();
        for i in 0..4 {
            let tripped = engine.record_failure(&code, &format!("src-{i}")).await;
            assert!(!tripped);
        }
        let tripped = engine.record_failure(&code, "src-4").await;
        assert!(tripped);
        assert!(matches!(engine.join(&code, "src").await, JoinOutcome::InvalidCode));
    }

    #[tokio::test]
    async fn five_wrong_guesses_from_one_source_blackhole_it_and_destroy_the_real_code() {
        let engine = PairingEngine::new();
        let (code, _) = engine.init("A".into()).await.unwrap();
        for _ in 0..5 {
            assert!(matches!(engine.join("WRONGG", "attacker").await, JoinOutcome::InvalidCode));
        }
        // The sixth attempt, even with the correct code, is rejected and the code dies.
        let outcome = engine.join(&code, "attacker").await;
        assert!(matches!(outcome, JoinOutcome::RateLimited));
        assert_eq!(engine.len().await, 0);
    }

    #[tokio::test]
    async fn purge_for_initiator_removes_a_live_code() {
        let engine = PairingEngine::new();
        let (code, _) = engine.init("A".into()).await.unwrap();
        engine.purge_for_initiator("A").await;
        assert!(matches!(engine.join(&code, "src").await, JoinOutcome::InvalidCode));
    }
}
