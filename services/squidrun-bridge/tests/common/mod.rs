use std::net::SocketAddr;
use std::time::Duration;

use squidrun_relay::config::RelayConfig;
use squidrun_relay::state::AppState;

pub struct TestRelay {
    pub addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl TestRelay {
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/v1/relay", self.addr)
    }
}

pub async fn start_relay(shared_secret: &str) -> TestRelay {
    let config = RelayConfig {
        shared_secret: shared_secret.to_owned(),
        device_allowlist: None,
        pending_ttl: Duration::from_secs(20),
        public_url: None,
        host: "127.0.0.1".into(),
        port: 0,
    };
    let state = AppState::new(config);
    let router = squidrun_relay::build_router(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("local_addr");

    let task = tokio::spawn(async move {
        axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
            .await
            .expect("relay crashed");
    });

    TestRelay { addr, _task: task }
}
