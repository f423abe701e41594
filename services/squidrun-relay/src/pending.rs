use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use squidrun_protocol::{status, WsMessage};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::registry::ServerCommand;

pub struct PendingEntry {
    pub from_device: String,
    pub to_device: String,
    pub sender_cmd_tx: mpsc::UnboundedSender<ServerCommand>,
    expiry_task: JoinHandle<()>,
}

impl Drop for PendingEntry {
    fn drop(&mut self) {
        self.expiry_task.abort();
    }
}

/// Correlates in-flight `xsend`s with their eventual `xack`.
///
/// At most one entry is ever live for a given `message_id`; a second
/// `xsend` with the same id supersedes the first.
#[derive(Clone, Default)]
pub struct PendingAckTracker {
    inner: Arc<RwLock<HashMap<String, PendingEntry>>>,
}

impl PendingAckTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a pending entry for `message_id`, superseding any
    /// existing entry with the same id by nacking its original sender
    /// first. Returns nothing: the caller is expected to have already
    /// forwarded the `xdeliver` frame before or after this call.
    pub async fn install(
        &self,
        message_id: String,
        from_device: String,
        to_device: String,
        sender_cmd_tx: mpsc::UnboundedSender<ServerCommand>,
        ttl: Duration,
    ) {
        let inner = self.inner.clone();
        let superseded = {
            let mut map = inner.write().await;
            map.remove(&message_id)
        };
        if let Some(old) = superseded {
            nack(&old.sender_cmd_tx, &message_id, &old.from_device, &old.to_device, status::SUPERSEDED);
        }

        let timer_inner = inner.clone();
        let timer_id = message_id.clone();
        let expiry_task = tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let removed = timer_inner.write().await.remove(&timer_id);
            if let Some(entry) = removed {
                debug!(message_id = %timer_id, "pending entry expired");
                nack(&entry.sender_cmd_tx, &timer_id, &entry.from_device, &entry.to_device, status::TARGET_ACK_TIMEOUT);
            }
        });

        let mut map = inner.write().await;
        map.insert(
            message_id,
            PendingEntry {
                from_device,
                to_device,
                sender_cmd_tx,
                expiry_task,
            },
        );
    }

    /// Removes and returns the entry for `message_id`, if any. Used both
    /// for ack correlation and for disconnect cleanup.
    pub async fn take(&self, message_id: &str) -> Option<PendingEntry> {
        self.inner.write().await.remove(message_id)
    }

    /// Drops every pending entry whose sender matches `cmd_tx`, with no
    /// notification — there is nobody left to notify.
    pub async fn drop_for_sender(&self, cmd_tx: &mpsc::UnboundedSender<ServerCommand>) {
        let mut map = self.inner.write().await;
        map.retain(|_, entry| !entry.sender_cmd_tx.same_channel(cmd_tx));
    }

    /// Nacks and removes every pending entry targeting `device_id`,
    /// because that device's socket just disconnected mid-flight.
    pub async fn fail_targeting(&self, device_id: &str) {
        let mut map = self.inner.write().await;
        let dead: Vec<String> = map
            .iter()
            .filter(|(_, entry)| entry.to_device == device_id)
            .map(|(id, _)| id.clone())
            .collect();
        for message_id in dead {
            if let Some(entry) = map.remove(&message_id) {
                nack(&entry.sender_cmd_tx, &message_id, &entry.from_device, &entry.to_device, status::TARGET_DISCONNECTED);
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

fn nack(cmd_tx: &mpsc::UnboundedSender<ServerCommand>, message_id: &str, from_device: &str, to_device: &str, reason: &str) {
    let _ = cmd_tx.send(ServerCommand::Deliver(WsMessage::XAck {
        message_id: message_id.to_owned(),
        ok: Some(false),
        accepted: Some(false),
        queued: Some(false),
        verified: Some(false),
        status: Some(reason.to_owned()),
        error: Some(reason.to_owned()),
        from_device: Some(from_device.to_owned()),
        to_device: Some(to_device.to_owned()),
        unknown_device: None,
        connected_devices: None,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink() -> (mpsc::UnboundedSender<ServerCommand>, mpsc::UnboundedReceiver<ServerCommand>) {
        mpsc::unbounded_channel()
    }

    #[tokio::test]
    async fn install_then_take_round_trips() {
        let tracker = PendingAckTracker::new();
        let (tx, _rx) = sink();
        tracker.install("m1".into(), "A".into(), "B".into(), tx, Duration::from_secs(5)).await;
        assert_eq!(tracker.len().await, 1);
        let entry = tracker.take("m1").await.expect("entry present");
        assert_eq!(entry.from_device, "A");
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn reusing_message_id_supersedes_the_first_entry() {
        let tracker = PendingAckTracker::new();
        let (tx, mut rx) = sink();
        tracker.install("m1".into(), "A".into(), "B".into(), tx.clone(), Duration::from_secs(5)).await;
        tracker.install("m1".into(), "A".into(), "B".into(), tx, Duration::from_secs(5)).await;

        let cmd = rx.recv().await.expect("supersede nack");
        match cmd {
            ServerCommand::Deliver(WsMessage::XAck { status: Some(s), .. }) => {
                assert_eq!(s, squidrun_protocol::status::SUPERSEDED);
            }
            _ => panic!("expected a superseded xack"),
        }
        assert_eq!(tracker.len().await, 1);
    }

    #[tokio::test]
    async fn expiry_fires_target_ack_timeout() {
        let tracker = PendingAckTracker::new();
        let (tx, mut rx) = sink();
        tracker.install("m1".into(), "A".into(), "B".into(), tx, Duration::from_millis(10)).await;

        let cmd = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.unwrap().unwrap();
        match cmd {
            ServerCommand::Deliver(WsMessage::XAck { status: Some(s), .. }) => {
                assert_eq!(s, squidrun_protocol::status::TARGET_ACK_TIMEOUT);
            }
            _ => panic!("expected a timeout xack"),
        }
        assert_eq!(tracker.len().await, 0);
    }

    #[tokio::test]
    async fn fail_targeting_nacks_only_entries_for_that_target() {
        let tracker = PendingAckTracker::new();
        let (tx_a, mut rx_a) = sink();
        let (tx_b, _rx_b) = sink();
        tracker.install("m1".into(), "A".into(), "B".into(), tx_a, Duration::from_secs(5)).await;
        tracker.install("m2".into(), "A".into(), "C".into(), tx_b, Duration::from_secs(5)).await;

        tracker.fail_targeting("B").await;
        assert_eq!(tracker.len().await, 1);
        let cmd = rx_a.recv().await.expect("disconnect nack");
        match cmd {
            ServerCommand::Deliver(WsMessage::XAck { status: Some(s), .. }) => {
                assert_eq!(s, squidrun_protocol::status::TARGET_DISCONNECTED);
            }
            _ => panic!("expected target_disconnected"),
        }
    }

    #[tokio::test]
    async fn drop_for_sender_removes_silently() {
        let tracker = PendingAckTracker::new();
        let (tx, mut rx) = sink();
        tracker.install("m1".into(), "A".into(), "B".into(), tx.clone(), Duration::from_secs(5)).await;
        tracker.drop_for_sender(&tx).await;
        assert_eq!(tracker.len().await, 0);
        assert!(rx.try_recv().is_err());
    }
}
