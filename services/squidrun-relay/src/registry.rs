use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use squidrun_protocol::{ConnectedDevice, WsMessage};
use tokio::sync::{mpsc, RwLock};

/// Instructions pushed into a connection's handler task from elsewhere in
/// the relay (the router, another connection's eviction path).
pub enum ServerCommand {
    Deliver(WsMessage),
    Close { code: u16, reason: String },
}

#[derive(Clone)]
pub struct ConnectionRecord {
    pub device_id: String,
    pub roles: Vec<String>,
    pub connected_since: i64,
    pub remote_addr: String,
    pub cmd_tx: mpsc::UnboundedSender<ServerCommand>,
}

/// Tracks the single live socket per device id.
///
/// Registration of a device that is already connected replaces the prior
/// record: the old socket is told it was replaced and closed, the new one
/// takes over the slot.
#[derive(Clone, Default)]
pub struct DeviceRegistry {
    inner: Arc<RwLock<HashMap<String, ConnectionRecord>>>,
}

impl DeviceRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs `record`, evicting and notifying any previous holder of
    /// the same device id. Returns the evicted record, if any.
    pub async fn register(&self, record: ConnectionRecord) -> Option<ConnectionRecord> {
        let mut map = self.inner.write().await;
        let previous = map.insert(record.device_id.clone(), record);
        if let Some(prev) = &previous {
            let _ = prev.cmd_tx.send(ServerCommand::Deliver(WsMessage::Info {
                status: Some("replaced_by_new_connection".into()),
            }));
            let _ = prev.cmd_tx.send(ServerCommand::Close {
                code: 1000,
                reason: "replaced".into(),
            });
        }
        previous
    }

    /// Removes `device_id` only if it is still bound to `cmd_tx` — guards
    /// against a disconnecting old socket evicting a newer registration
    /// that has already replaced it.
    pub async fn unregister(&self, device_id: &str, cmd_tx: &mpsc::UnboundedSender<ServerCommand>) {
        let mut map = self.inner.write().await;
        if let Some(existing) = map.get(device_id) {
            if existing.cmd_tx.same_channel(cmd_tx) {
                map.remove(device_id);
            }
        }
    }

    pub async fn lookup(&self, device_id: &str) -> Option<ConnectionRecord> {
        self.inner.read().await.get(device_id).cloned()
    }

    pub async fn contains(&self, device_id: &str) -> bool {
        self.inner.read().await.contains_key(device_id)
    }

    pub async fn list(&self) -> Vec<ConnectedDevice> {
        let map = self.inner.read().await;
        let mut devices: Vec<ConnectedDevice> = map
            .values()
            .map(|r| ConnectedDevice {
                device_id: r.device_id.clone(),
                roles: r.roles.clone(),
                connected_since: r.connected_since,
            })
            .collect();
        devices.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        devices
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(device_id: &str) -> (ConnectionRecord, mpsc::UnboundedReceiver<ServerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ConnectionRecord {
                device_id: device_id.to_owned(),
                roles: vec!["architect".into()],
                connected_since: now_millis(),
                remote_addr: "127.0.0.1:1".into(),
                cmd_tx: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn register_then_lookup_round_trips() {
        let reg = DeviceRegistry::new();
        let (rec, _rx) = record("A");
        assert!(reg.register(rec).await.is_none());
        assert!(reg.lookup("A").await.is_some());
    }

    #[tokio::test]
    async fn re_registering_same_device_evicts_previous_and_notifies_it() {
        let reg = DeviceRegistry::new();
        let (rec1, mut rx1) = record("A");
        let (rec2, _rx2) = record("A");
        assert!(reg.register(rec1).await.is_none());
        let evicted = reg.register(rec2).await;
        assert!(evicted.is_some());

        let first = rx1.recv().await.expect("info notice");
        assert!(matches!(first, ServerCommand::Deliver(WsMessage::Info { .. })));
        let second = rx1.recv().await.expect("close notice");
        assert!(matches!(second, ServerCommand::Close { code: 1000, .. }));
    }

    #[tokio::test]
    async fn unregister_is_a_noop_if_the_slot_was_already_replaced() {
        let reg = DeviceRegistry::new();
        let (rec1, _rx1) = record("A");
        let tx1 = rec1.cmd_tx.clone();
        let (rec2, _rx2) = record("A");
        reg.register(rec1).await;
        reg.register(rec2).await;

        // The old socket's disconnect path tries to unregister using its own sender.
        reg.unregister("A", &tx1).await;
        assert!(reg.lookup("A").await.is_some(), "newer registration must survive");
    }

    #[tokio::test]
    async fn list_is_sorted_by_device_id() {
        let reg = DeviceRegistry::new();
        let (rec_b, _rb) = record("B");
        let (rec_a, _ra) = record("A");
        reg.register(rec_b).await;
        reg.register(rec_a).await;
        let ids: Vec<String> = reg.list().await.into_iter().map(|d| d.device_id).collect();
        assert_eq!(ids, vec!["A".to_string(), "B".to_string()]);
    }
}
