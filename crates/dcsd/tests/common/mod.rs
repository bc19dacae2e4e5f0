//! Shared helpers for the server-level integration tests.
//!
//! Speaks HTTP/1.1 and the WebSocket framing directly over a `TcpStream`
//! so the tests exercise exactly what a remote client sends.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dcs_core::{Capabilities, DeviceDefinition, FakeClock};
use dcs_protocol::{ClientMessage, ServerMessage, SESSION_HEADER};
use dcsd::catalog::{DeviceDirectory, StaticCatalog};
use dcsd::config::DaemonConfig;
use dcsd::registry::{spawn_registry, RegistryConfig, RegistryHandle};
use dcsd::server::DaemonServer;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ============================================================================
// Test Server
// ============================================================================

pub struct TestServer {
    pub addr: SocketAddr,
    pub registry: RegistryHandle,
    pub catalog: Arc<StaticCatalog>,
    pub clock: FakeClock,
    pub cancel_token: CancellationToken,
}

pub fn test_devices() -> Vec<DeviceDefinition> {
    vec![
        DeviceDefinition::from_catalog("D1", "EpicsMotor", "ophyd", Capabilities::new(true, true, false)),
        DeviceDefinition::from_catalog("D2", "EpicsMotor", "ophyd", Capabilities::new(true, true, false)),
        DeviceDefinition::from_catalog("det1", "SimDetector", "ophyd.sim", Capabilities::new(true, false, false)),
    ]
}

impl TestServer {
    pub async fn spawn() -> Self {
        let catalog = Arc::new(StaticCatalog::new(test_devices()));
        let directory = DeviceDirectory::load(catalog.clone()).expect("load catalog");
        let clock = FakeClock::new();
        let registry = spawn_registry(
            RegistryConfig::default(),
            directory.clone(),
            Arc::new(clock.clone()),
        );
        let cancel_token = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let server = DaemonServer::new(
            registry.clone(),
            directory,
            DaemonConfig::default(),
            cancel_token.clone(),
        );
        tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            addr,
            registry,
            catalog,
            clock,
            cancel_token,
        }
    }

    pub fn http(&self) -> HttpClient {
        HttpClient::new(self.addr)
    }

    pub async fn request(
        &self,
        method: &str,
        path: &str,
        session: Option<&str>,
        body: &str,
    ) -> (u16, Value) {
        self.http().request(method, path, session, body).await
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        self.http().get(path).await
    }

    pub async fn post(&self, path: &str, session: Option<&str>, body: &str) -> (u16, Value) {
        self.http().post(path, session, body).await
    }

    pub async fn ws(&self) -> WsClient {
        WsClient::open(self.addr).await
    }

    /// Opens a WebSocket and completes the `connect` handshake.
    pub async fn ws_session(&self, client_id: Option<&str>) -> (WsClient, String) {
        let mut client = self.ws().await;
        client
            .send(&ClientMessage::connect(client_id.map(Into::into)))
            .await;
        match client.recv().await {
            Some(ServerMessage::Connected { session_id, .. }) => {
                (client, session_id.as_str().to_string())
            }
            other => panic!("expected connected, got {other:?}"),
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

// ============================================================================
// HTTP Client
// ============================================================================

/// One-request-per-connection HTTP/1.1 client.
#[derive(Debug, Clone, Copy)]
pub struct HttpClient {
    addr: SocketAddr,
}

impl HttpClient {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Sends one HTTP request and returns the status and JSON body.
    pub async fn request(
        &self,
        method: &str,
        path: &str,
        session: Option<&str>,
        body: &str,
    ) -> (u16, Value) {
        let mut stream = TcpStream::connect(self.addr).await.expect("connect");
        let session_line = session
            .map(|id| format!("{SESSION_HEADER}: {id}\r\n"))
            .unwrap_or_default();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\nContent-Type: application/json\r\nContent-Length: {}\r\n{session_line}\r\n{body}",
            self.addr,
            body.len(),
        );
        stream.write_all(request.as_bytes()).await.expect("write request");

        let mut raw = Vec::new();
        timeout(RECV_TIMEOUT, stream.read_to_end(&mut raw))
            .await
            .expect("response timeout")
            .expect("read response");
        let text = String::from_utf8(raw).expect("utf8 response");

        let (head, body) = text.split_once("\r\n\r\n").expect("header terminator");
        let status = head
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse().ok())
            .expect("status code");
        let json = if body.trim().is_empty() {
            Value::Null
        } else {
            serde_json::from_str(body).expect("JSON body")
        };
        (status, json)
    }

    pub async fn get(&self, path: &str) -> (u16, Value) {
        self.request("GET", path, None, "").await
    }

    pub async fn post(&self, path: &str, session: Option<&str>, body: &str) -> (u16, Value) {
        self.request("POST", path, session, body).await
    }
}

// ============================================================================
// WebSocket Client
// ============================================================================

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;

/// Minimal RFC 6455 client: masked frames out, unmasked frames in.
pub struct WsClient {
    stream: TcpStream,
}

impl WsClient {
    pub async fn open(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "GET /api/v1/ws HTTP/1.1\r\nHost: {addr}\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.expect("write upgrade");

        // Read the response head byte by byte so no frame bytes are consumed
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            let byte = timeout(RECV_TIMEOUT, stream.read_u8())
                .await
                .expect("upgrade timeout")
                .expect("read upgrade");
            head.push(byte);
        }
        let head = String::from_utf8(head).expect("utf8 head");
        assert!(head.starts_with("HTTP/1.1 101"), "upgrade failed: {head}");

        Self { stream }
    }

    pub async fn send(&mut self, msg: &ClientMessage) {
        let json = serde_json::to_string(msg).expect("serialize");
        self.send_text(&json).await;
    }

    pub async fn send_text(&mut self, text: &str) {
        self.send_frame(OP_TEXT, text.as_bytes()).await;
    }

    pub async fn send_binary(&mut self, data: &[u8]) {
        self.send_frame(OP_BINARY, data).await;
    }

    /// Writes one masked frame; write errors are ignored so tests can
    /// observe the server's reaction instead.
    pub async fn send_frame(&mut self, opcode: u8, payload: &[u8]) {
        let mask = [0x12u8, 0x34, 0x56, 0x78];
        let mut frame = vec![0x80 | opcode];
        let len = payload.len();
        if len < 126 {
            frame.push(0x80 | len as u8);
        } else if len <= usize::from(u16::MAX) {
            frame.push(0x80 | 126);
            frame.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            frame.push(0x80 | 127);
            frame.extend_from_slice(&(len as u64).to_be_bytes());
        }
        frame.extend_from_slice(&mask);
        frame.extend(payload.iter().zip(mask.iter().cycle()).map(|(b, m)| b ^ m));
        let _ = self.stream.write_all(&frame).await;
    }

    pub async fn close(mut self) {
        self.send_frame(OP_CLOSE, &[]).await;
        let _ = self.stream.shutdown().await;
    }

    /// Next server message; `None` on close, EOF, read error or timeout.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        timeout(RECV_TIMEOUT, self.read_message()).await.ok().flatten()
    }

    /// Receives messages until one matches, skipping the rest.
    pub async fn recv_until<F>(&mut self, mut matches: F) -> ServerMessage
    where
        F: FnMut(&ServerMessage) -> bool,
    {
        loop {
            match self.recv().await {
                Some(msg) if matches(&msg) => return msg,
                Some(_) => continue,
                None => panic!("connection ended before the expected message"),
            }
        }
    }

    async fn read_message(&mut self) -> Option<ServerMessage> {
        loop {
            let (opcode, payload) = self.read_frame().await?;
            match opcode {
                OP_TEXT => return serde_json::from_slice(&payload).ok(),
                OP_CLOSE => return None,
                OP_PING => self.send_frame(0xA, &payload).await,
                _ => continue,
            }
        }
    }

    async fn read_frame(&mut self) -> Option<(u8, Vec<u8>)> {
        let b0 = self.stream.read_u8().await.ok()?;
        let b1 = self.stream.read_u8().await.ok()?;
        let masked = b1 & 0x80 != 0;
        let len = match b1 & 0x7f {
            126 => u64::from(self.stream.read_u16().await.ok()?),
            127 => self.stream.read_u64().await.ok()?,
            n => u64::from(n),
        };
        let mut mask = [0u8; 4];
        if masked {
            self.stream.read_exact(&mut mask).await.ok()?;
        }
        let mut payload = vec![0u8; usize::try_from(len).ok()?];
        self.stream.read_exact(&mut payload).await.ok()?;
        if masked {
            for (b, m) in payload.iter_mut().zip(mask.iter().cycle()) {
                *b ^= m;
            }
        }
        Some((b0 & 0x0f, payload))
    }
}
