// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright 2026 Edgecast Cloud LLC.

//! The console tunnel: browser WebSocket on one side, raw TCP to a VM's
//! console port on the other, gated by a sealed session token.
//!
//! The relay proper ([`run_relay`]) is a small state machine
//! (awaiting-token -> connecting-tcp -> relaying -> closed) driven over
//! plain channels, so tests exercise it without a WebSocket; the axum
//! glue ([`serve_socket`]) adapts a real socket onto those channels.
//!
//! Two ordering rules matter here. Inbound browser frames are consumed
//! from the very first poll and buffered (bounded) while the TCP leg
//! comes up, so nothing typed during the connect race is lost. And token
//! validation happens before any TCP work: a missing or invalid token
//! closes the browser side with a policy-violation code having opened
//! zero connections.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vmgrid_auth::ConsoleTokenCodec;

/// WebSocket close codes the relay uses.
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// What the browser side feeds the relay.
#[derive(Debug)]
pub enum ClientEvent {
    Data(Vec<u8>),
    Closed,
}

/// What the relay sends back toward the browser.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    Data(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    /// Cap on bytes buffered while the TCP leg is still connecting.
    /// Overflow is fatal for the connection.
    pub buffer_max: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            buffer_max: 1024 * 1024,
        }
    }
}

/// Sends the close event toward the browser at most once; writes after
/// teardown are dropped.
struct CloseOnce {
    tx: mpsc::Sender<ServerEvent>,
    closed: bool,
}

impl CloseOnce {
    fn new(tx: mpsc::Sender<ServerEvent>) -> Self {
        Self { tx, closed: false }
    }

    async fn data(&self, bytes: Vec<u8>) -> bool {
        if self.closed {
            return false;
        }
        self.tx.send(ServerEvent::Data(bytes)).await.is_ok()
    }

    async fn close(&mut self, code: u16, reason: &str) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self
            .tx
            .send(ServerEvent::Close {
                code,
                reason: reason.to_string(),
            })
            .await;
    }
}

/// Run one tunnel to completion.
pub async fn run_relay(
    codec: Arc<ConsoleTokenCodec>,
    token: Option<String>,
    mut from_client: mpsc::Receiver<ClientEvent>,
    to_client: mpsc::Sender<ServerEvent>,
    config: RelayConfig,
) {
    let mut out = CloseOnce::new(to_client);

    // AwaitingToken.
    let Some(token) = token else {
        out.close(CLOSE_POLICY_VIOLATION, "missing token").await;
        return;
    };
    let claims = match codec.open(&token) {
        Ok(claims) => claims,
        Err(e) => {
            // Detail stays in the log; the browser only learns the code.
            warn!(error = %e, "console token rejected");
            out.close(CLOSE_POLICY_VIOLATION, "invalid token").await;
            return;
        }
    };
    info!(vm = claims.vm, sub = %claims.sub, target = %claims.target_host, "console tunnel opening");

    // ConnectingTcp: keep consuming browser frames while the connect is
    // in flight, buffering them up to the cap.
    let connect = TcpStream::connect((claims.target_host.as_str(), claims.target_port));
    tokio::pin!(connect);
    let mut buffered: Vec<Vec<u8>> = Vec::new();
    let mut buffered_bytes = 0usize;
    let stream = loop {
        tokio::select! {
            res = &mut connect => match res {
                Ok(stream) => break stream,
                Err(e) => {
                    warn!(error = %e, target = %claims.target_host, "console target unreachable");
                    out.close(CLOSE_INTERNAL_ERROR, "console target unreachable").await;
                    return;
                }
            },
            ev = from_client.recv() => match ev {
                Some(ClientEvent::Data(bytes)) => {
                    buffered_bytes += bytes.len();
                    if buffered_bytes > config.buffer_max {
                        warn!(buffered_bytes, "pre-connect buffer overflow");
                        out.close(CLOSE_POLICY_VIOLATION, "buffer overflow").await;
                        return;
                    }
                    buffered.push(bytes);
                }
                Some(ClientEvent::Closed) | None => {
                    debug!("browser left before console connected");
                    return;
                }
            },
        }
    };

    // Interactive terminal traffic: no send-delay batching.
    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "set_nodelay failed");
    }
    let (mut tcp_rx, mut tcp_tx) = stream.into_split();

    // Flush the pre-connect buffer in arrival order, then pass through.
    for chunk in buffered.drain(..) {
        if let Err(e) = tcp_tx.write_all(&chunk).await {
            warn!(error = %e, "console write failed during flush");
            out.close(CLOSE_INTERNAL_ERROR, "console write failed").await;
            return;
        }
    }

    // Relaying.
    let mut read_buf = vec![0u8; 8192];
    loop {
        tokio::select! {
            ev = from_client.recv() => match ev {
                Some(ClientEvent::Data(bytes)) => {
                    if let Err(e) = tcp_tx.write_all(&bytes).await {
                        warn!(error = %e, "console write failed");
                        out.close(CLOSE_INTERNAL_ERROR, "console write failed").await;
                        return;
                    }
                }
                Some(ClientEvent::Closed) | None => {
                    let _ = tcp_tx.shutdown().await;
                    debug!("browser closed console tunnel");
                    return;
                }
            },
            res = tcp_rx.read(&mut read_buf) => match res {
                Ok(0) => {
                    out.close(CLOSE_NORMAL, "console closed").await;
                    return;
                }
                Ok(n) => {
                    if !out.data(read_buf[..n].to_vec()).await {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "console read failed");
                    out.close(CLOSE_INTERNAL_ERROR, "console read failed").await;
                    return;
                }
            },
        }
    }
}

/// Adapt a live WebSocket onto the relay's channels. The inbound
/// forwarder starts before the relay does any asynchronous work, so no
/// early frame is dropped.
pub async fn serve_socket(socket: WebSocket, codec: Arc<ConsoleTokenCodec>, token: Option<String>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (client_tx, client_rx) = mpsc::channel::<ClientEvent>(64);
    let (server_tx, mut server_rx) = mpsc::channel::<ServerEvent>(64);

    let reader = tokio::spawn(async move {
        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Binary(bytes)) => {
                    if client_tx.send(ClientEvent::Data(bytes.to_vec())).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Text(text)) => {
                    let bytes = text.as_str().as_bytes().to_vec();
                    if client_tx.send(ClientEvent::Data(bytes)).await.is_err() {
                        break;
                    }
                }
                Ok(Message::Close(_)) | Err(_) => {
                    let _ = client_tx.send(ClientEvent::Closed).await;
                    break;
                }
                Ok(_) => {}
            }
        }
    });

    let relay = tokio::spawn(run_relay(
        codec,
        token,
        client_rx,
        server_tx,
        RelayConfig::default(),
    ));

    while let Some(ev) = server_rx.recv().await {
        match ev {
            ServerEvent::Data(bytes) => {
                if ws_tx.send(Message::Binary(bytes.into())).await.is_err() {
                    break;
                }
            }
            ServerEvent::Close { code, reason } => {
                let _ = ws_tx
                    .send(Message::Close(Some(CloseFrame {
                        code,
                        reason: reason.into(),
                    })))
                    .await;
                break;
            }
        }
    }

    let _ = relay.await;
    reader.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
    use vmgrid_auth::Clock;

    struct FakeClock(AtomicI64);

    impl Clock for FakeClock {
        fn now_unix(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    fn codec_at(t: i64, ttl: i64) -> (Arc<ConsoleTokenCodec>, Arc<FakeClock>) {
        let clock = Arc::new(FakeClock(AtomicI64::new(t)));
        let key = rsa::RsaPrivateKey::new(&mut rand_core::OsRng, 1024).unwrap();
        (
            Arc::new(ConsoleTokenCodec::from_private_key(key, clock.clone(), ttl)),
            clock,
        )
    }

    #[tokio::test]
    async fn missing_token_closes_with_policy_violation() {
        let (codec, _) = codec_at(0, 120);
        let (_client_tx, client_rx) = mpsc::channel(8);
        let (server_tx, mut server_rx) = mpsc::channel(8);

        run_relay(codec, None, client_rx, server_tx, RelayConfig::default()).await;

        match server_rx.recv().await.unwrap() {
            ServerEvent::Close { code, .. } => assert_eq!(code, CLOSE_POLICY_VIOLATION),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_token_never_opens_tcp() {
        let accepts = Arc::new(AtomicU32::new(0));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        {
            let accepts = accepts.clone();
            tokio::spawn(async move {
                while listener.accept().await.is_ok() {
                    accepts.fetch_add(1, Ordering::SeqCst);
                }
            });
        }

        let (codec, clock) = codec_at(1000, 120);
        let token = codec.seal("op@example.com", 1, "127.0.0.1", port).unwrap();
        clock.0.store(2000, Ordering::SeqCst);

        let (client_tx, client_rx) = mpsc::channel(8);
        let (server_tx, mut server_rx) = mpsc::channel(8);
        client_tx
            .send(ClientEvent::Data(b"ls\n".to_vec()))
            .await
            .unwrap();

        run_relay(codec, Some(token), client_rx, server_tx, RelayConfig::default()).await;

        match server_rx.recv().await.unwrap() {
            ServerEvent::Close { code, .. } => assert_eq!(code, CLOSE_POLICY_VIOLATION),
            other => panic!("unexpected event: {other:?}"),
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(accepts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn pre_connect_bytes_arrive_contiguous_and_in_order() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let target = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 3];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(b"hi").await.unwrap();
            buf
        });

        let (codec, _) = codec_at(1000, 120);
        let token = codec.seal("op@example.com", 1, "127.0.0.1", port).unwrap();

        let (client_tx, client_rx) = mpsc::channel(8);
        let (server_tx, mut server_rx) = mpsc::channel(8);
        // Queued before the relay even starts: they must reach the TCP
        // peer contiguous and in order.
        for chunk in [b"A", b"B", b"C"] {
            client_tx
                .send(ClientEvent::Data(chunk.to_vec()))
                .await
                .unwrap();
        }

        let relay = tokio::spawn(run_relay(
            codec,
            Some(token),
            client_rx,
            server_tx,
            RelayConfig::default(),
        ));

        assert_eq!(&target.await.unwrap(), b"ABC");
        match server_rx.recv().await.unwrap() {
            ServerEvent::Data(bytes) => assert_eq!(bytes, b"hi".to_vec()),
            other => panic!("unexpected event: {other:?}"),
        }

        client_tx.send(ClientEvent::Closed).await.unwrap();
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn pre_connect_buffer_overflow_closes_with_policy_violation() {
        let (codec, _) = codec_at(1000, 120);
        // TEST-NET-3 target: the connect stays pending while frames
        // pile up against a tiny buffer cap.
        let token = codec.seal("op@example.com", 1, "203.0.113.1", 9).unwrap();

        let (client_tx, client_rx) = mpsc::channel(16);
        let (server_tx, mut server_rx) = mpsc::channel(8);
        // 15 bytes queued against a 10-byte cap, all before the relay
        // starts so the connect race cannot drain them.
        for _ in 0..5 {
            client_tx
                .send(ClientEvent::Data(b"abc".to_vec()))
                .await
                .unwrap();
        }

        let relay = tokio::spawn(run_relay(
            codec,
            Some(token),
            client_rx,
            server_tx,
            RelayConfig { buffer_max: 10 },
        ));

        match server_rx.recv().await.unwrap() {
            ServerEvent::Close { code, reason } => {
                assert_eq!(code, CLOSE_POLICY_VIOLATION);
                assert_eq!(reason, "buffer overflow");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        // Teardown ran exactly once and the relay is gone.
        assert!(server_rx.recv().await.is_none());
        relay.await.unwrap();
    }

    #[tokio::test]
    async fn tcp_close_reaches_browser_once() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            drop(stream);
        });

        let (codec, _) = codec_at(1000, 120);
        let token = codec.seal("op@example.com", 1, "127.0.0.1", port).unwrap();
        let (_client_tx, client_rx) = mpsc::channel(8);
        let (server_tx, mut server_rx) = mpsc::channel(8);

        run_relay(codec, Some(token), client_rx, server_tx, RelayConfig::default()).await;

        match server_rx.recv().await.unwrap() {
            ServerEvent::Close { code, .. } => assert_eq!(code, CLOSE_NORMAL),
            other => panic!("unexpected event: {other:?}"),
        }
        // Teardown ran exactly once: the channel is closed with nothing
        // further queued.
        assert!(server_rx.recv().await.is_none());
    }
}
