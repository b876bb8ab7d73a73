//! Shared fixtures: a scripted native peer and a real webhook server

#![allow(dead_code)]

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use civ_bridge::config::ReconnectPolicy;
use civ_bridge::protocol::{NativeMessage, deserialize, serialize};
use civ_bridge::transport::{FrameReader, FrameWriter};
use civ_bridge::{AsyncReader, AsyncWriter, BridgeConfig, EventBatch, MemoryListener};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::broadcast;

pub fn config() -> BridgeConfig {
    BridgeConfig {
        connect_timeout: Duration::from_millis(1000),
        connect_retry_interval: Duration::from_millis(50),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            max_attempts: 0,
        },
        ..BridgeConfig::default()
    }
}

/// Stand-in for the native process
pub struct NativePeer {
    reader: FrameReader<ReadHalf<DuplexStream>>,
    writer: FrameWriter<WriteHalf<DuplexStream>>,
}

impl NativePeer {
    pub async fn accept(listener: &mut MemoryListener) -> Self {
        let stream = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("bridge never dialed")
            .expect("dialer dropped");
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: FrameReader(read_half),
            writer: FrameWriter(write_half),
        }
    }

    pub async fn recv(&mut self) -> NativeMessage {
        self.recv_within(Duration::from_secs(10))
            .await
            .expect("no message from bridge")
    }

    /// Next message, or `None` if nothing arrives in time
    pub async fn recv_within(&mut self, wait: Duration) -> Option<NativeMessage> {
        let data = tokio::time::timeout(wait, self.reader.read_message())
            .await
            .ok()?
            .expect("bridge closed the channel");
        Some(deserialize(&data).expect("bridge sent an invalid message"))
    }

    /// Skip re-registrations and other chatter until an `external_response`
    pub async fn recv_external_response(&mut self) -> NativeMessage {
        loop {
            let message = self.recv().await;
            if matches!(message, NativeMessage::ExternalResponse { .. }) {
                return message;
            }
        }
    }

    pub async fn send(&mut self, message: &NativeMessage) {
        let data = serialize(message).expect("serializable message");
        self.writer
            .write_message(&data)
            .await
            .expect("bridge closed the channel");
    }
}

/// Wait for a batch containing the named event
pub async fn wait_for_event(rx: &mut broadcast::Receiver<EventBatch>, name: &str) -> EventBatch {
    loop {
        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed");
        if batch.events.iter().any(|e| e.event == name) {
            return batch;
        }
    }
}

#[derive(Clone)]
struct WebhookState {
    delay: Duration,
    status: StatusCode,
    body: Value,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

/// HTTP endpoint an external service would register
pub struct Webhook {
    pub url: String,
    hits: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl Webhook {
    /// Serve `POST /execute` on an ephemeral port, answering after `delay`
    pub async fn spawn(delay: Duration, status: StatusCode, body: Value) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let state = WebhookState {
            delay,
            status,
            body,
            hits: hits.clone(),
            requests: requests.clone(),
        };
        let app = Router::new()
            .route("/execute", post(execute))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind webhook");
        let addr = listener.local_addr().expect("webhook address");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("webhook server");
        });

        Self {
            url: format!("http://{}/execute", addr),
            hits,
            requests,
        }
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().clone()
    }
}

async fn execute(State(state): State<WebhookState>, Json(request): Json<Value>) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    state.requests.lock().push(request);
    tokio::time::sleep(state.delay).await;
    (state.status, Json(state.body.clone()))
}

/// A loopback URL nothing is listening on
pub async fn dead_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe");
    let addr = listener.local_addr().expect("probe address");
    drop(listener);
    format!("http://{}/execute", addr)
}
