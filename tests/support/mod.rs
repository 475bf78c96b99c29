// Shared test fixtures: a scripted platform speaking the real wire protocol
// over a real WebSocket listener, so integration tests exercise the
// tokio-tungstenite path end to end.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use tether::{ActiveConfig, Envelope, SessionSender, SourceHandler};

// ---------------------------------------------------------------------------
// Scripted platform
// ---------------------------------------------------------------------------

/// What the platform does with the next connection it accepts.
#[derive(Clone)]
pub struct PlatformScript {
    pub accept_auth: bool,
    pub accept_bind: bool,
    /// Never answer the auth frame, to exercise client timeouts.
    pub mute: bool,
    /// Close the connection shortly after a successful bind.
    pub drop_after_bind: bool,
    /// Configuration document to push once bound.
    pub config_document: Option<Value>,
    /// Queries to push after the configuration, as (payload, reply_address).
    pub queries: Vec<(Value, String)>,
}

impl Default for PlatformScript {
    fn default() -> Self {
        PlatformScript {
            accept_auth: true,
            accept_bind: true,
            mute: false,
            drop_after_bind: false,
            config_document: None,
            queries: Vec::new(),
        }
    }
}

impl PlatformScript {
    pub fn accept_all() -> Self {
        Self::default()
    }

    pub fn with_config(mut self, document: Value) -> Self {
        self.config_document = Some(document);
        self
    }

    pub fn with_query(mut self, payload: Value, reply_address: &str) -> Self {
        self.queries.push((payload, reply_address.to_string()));
        self
    }
}

/// In-process platform endpoint for one test.
pub struct MockPlatform {
    addr: SocketAddr,
    script: Arc<Mutex<PlatformScript>>,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    accept_task: JoinHandle<()>,
    serve_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl MockPlatform {
    pub async fn start(script: PlatformScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script = Arc::new(Mutex::new(script));
        let connections = Arc::new(AtomicUsize::new(0));
        let received = Arc::new(Mutex::new(Vec::new()));
        let serve_tasks = Arc::new(Mutex::new(Vec::new()));

        let accept_task = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&script),
            Arc::clone(&connections),
            Arc::clone(&received),
            Arc::clone(&serve_tasks),
        ));

        MockPlatform {
            addr,
            script,
            connections,
            received,
            accept_task,
            serve_tasks,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/link", self.addr)
    }

    /// How many connections have been accepted so far.
    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every frame received from clients, in arrival order.
    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_ops(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|frame| frame["op"].as_str().map(str::to_string))
            .collect()
    }

    /// Script used for connections accepted from now on.
    pub fn set_script(&self, script: PlatformScript) {
        *self.script.lock().unwrap() = script;
    }

    /// Kill the listener and every live connection. Subsequent dials are
    /// refused.
    pub fn shut_down(&self) {
        self.accept_task.abort();
        for task in self.serve_tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

impl Drop for MockPlatform {
    fn drop(&mut self) {
        self.shut_down();
    }
}

async fn accept_loop(
    listener: TcpListener,
    script: Arc<Mutex<PlatformScript>>,
    connections: Arc<AtomicUsize>,
    received: Arc<Mutex<Vec<Value>>>,
    serve_tasks: Arc<Mutex<Vec<JoinHandle<()>>>>,
) {
    while let Ok((stream, _)) = listener.accept().await {
        connections.fetch_add(1, Ordering::SeqCst);
        let script = script.lock().unwrap().clone();
        let received = Arc::clone(&received);
        let task = tokio::spawn(serve_connection(stream, script, received));
        serve_tasks.lock().unwrap().push(task);
    }
}

async fn serve_connection(
    stream: TcpStream,
    script: PlatformScript,
    received: Arc<Mutex<Vec<Value>>>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    // Stage 1: authenticate.
    let Some(frame) = next_json(&mut ws, &received).await else {
        return;
    };
    if frame["op"] != "authenticate" {
        return;
    }
    if script.mute {
        // Keep the socket open but never answer.
        while next_json(&mut ws, &received).await.is_some() {}
        return;
    }
    let reply = if script.accept_auth {
        json!({"op": "authResult", "success": true})
    } else {
        json!({"op": "authResult", "success": false, "message": "token refused"})
    };
    if send_json(&mut ws, reply).await.is_err() {
        return;
    }
    if !script.accept_auth {
        let _ = ws.close(None).await;
        return;
    }

    // Stage 2: bind.
    let Some(frame) = next_json(&mut ws, &received).await else {
        return;
    };
    if frame["op"] != "bindSource" {
        return;
    }
    let reply = if script.accept_bind {
        json!({"op": "bindResult", "success": true})
    } else {
        json!({"op": "bindResult", "success": false, "message": "unknown source"})
    };
    if send_json(&mut ws, reply).await.is_err() {
        return;
    }
    if !script.accept_bind {
        let _ = ws.close(None).await;
        return;
    }

    if script.drop_after_bind {
        // Give the client a beat to settle before yanking the link.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = ws.close(None).await;
        return;
    }

    // Stage 3: scripted pushes.
    if let Some(document) = script.config_document {
        if send_json(&mut ws, json!({"op": "configure", "document": document}))
            .await
            .is_err()
        {
            return;
        }
    }
    for (payload, reply_address) in script.queries {
        if send_json(
            &mut ws,
            json!({"op": "query", "payload": payload, "replyAddress": reply_address}),
        )
        .await
        .is_err()
        {
            return;
        }
    }

    // Record whatever the client sends until it hangs up.
    while next_json(&mut ws, &received).await.is_some() {}
}

async fn next_json(
    ws: &mut WebSocketStream<TcpStream>,
    received: &Mutex<Vec<Value>>,
) -> Option<Value> {
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                let value: Value = serde_json::from_str(text.as_str()).ok()?;
                received.lock().unwrap().push(value.clone());
                return Some(value);
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
    None
}

async fn send_json(
    ws: &mut WebSocketStream<TcpStream>,
    value: Value,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    ws.send(Message::Text(value.to_string().into())).await
}

// ---------------------------------------------------------------------------
// Test handler
// ---------------------------------------------------------------------------

/// Records traffic and answers queries with `{"ok": <payload>}`.
pub struct RecordingHandler {
    fail_queries: AtomicBool,
    publishes: Mutex<Vec<Value>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(RecordingHandler {
            fail_queries: AtomicBool::new(false),
            publishes: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        let handler = Self::new();
        handler.fail_queries.store(true, Ordering::SeqCst);
        handler
    }

    pub fn publishes(&self) -> Vec<Value> {
        self.publishes.lock().unwrap().clone()
    }
}

#[async_trait]
impl SourceHandler for RecordingHandler {
    fn name(&self) -> &str {
        "recording"
    }

    async fn on_configure(
        &self,
        _session: SessionSender,
        _config: &ActiveConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.publishes.lock().unwrap().push(envelope.payload);
        Ok(())
    }

    async fn on_query(&self, envelope: Envelope) -> anyhow::Result<Value> {
        if self.fail_queries.load(Ordering::SeqCst) {
            anyhow::bail!("query refused");
        }
        Ok(json!({ "ok": envelope.payload }))
    }
}

// ---------------------------------------------------------------------------
// Misc
// ---------------------------------------------------------------------------

/// Poll `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() > deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
