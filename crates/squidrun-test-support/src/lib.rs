//! A thin real WebSocket client used by integration tests to drive a
//! relay instance bound to an ephemeral port. No part of the transport
//! is mocked: this dials a real TCP socket and speaks real WebSocket
//! framing, only the JSON payloads are typed as [`WsMessage`].

use futures_util::{SinkExt, StreamExt};
use squidrun_protocol::WsMessage;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct TestClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl TestClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send(&mut self, msg: &WsMessage) -> Result<(), Box<dyn std::error::Error>> {
        let json = msg.to_json()?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Receives the next text frame, transparently answering pings and
    /// ignoring pongs, erroring if the peer closes the connection.
    pub async fn recv(&mut self) -> Result<WsMessage, Box<dyn std::error::Error>> {
        let text = self.recv_raw().await?;
        Ok(WsMessage::from_json(&text)?)
    }

    /// Like [`Self::recv`], but returns the raw JSON text instead of a
    /// parsed frame — for tests asserting on the literal wire format
    /// rather than the Rust struct shape.
    pub async fn recv_raw(&mut self) -> Result<String, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }

    /// Drops the underlying socket immediately without a clean close
    /// handshake, simulating an abrupt disconnect.
    pub fn kill(self) {
        drop(self);
    }
}
