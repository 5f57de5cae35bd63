//! Minimal DevTools protocol client over a browser WebSocket.
//!
//! One background task owns the socket: outbound commands arrive over a
//! channel, responses are matched back to callers by command id. Events are
//! ignored.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Reply = std::result::Result<Value, String>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

pub struct CdpConnection {
    outbound: mpsc::Sender<String>,
    pending: Pending,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .with_context(|| format!("DevTools connect to {} failed", ws_url))?;
        info!("[CDP] Connected to {}", ws_url);

        let (outbound, outbound_rx) = mpsc::channel(64);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));

        let task = tokio::spawn(connection_loop(
            ws_stream,
            outbound_rx,
            Arc::clone(&pending),
            Arc::clone(&alive),
        ));

        Ok(CdpConnection {
            outbound,
            pending,
            next_id: AtomicU64::new(1),
            alive,
            task,
        })
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a command and wait for its result. `session_id` targets an
    /// attached page; `None` addresses the browser itself.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
        timeout: Duration,
    ) -> Result<Value> {
        if !self.is_alive() {
            bail!("DevTools connection closed");
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut msg = json!({ "id": id, "method": method, "params": params });
        if let Some(session) = session_id {
            msg["sessionId"] = json!(session);
        }

        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        if self.outbound.send(msg.to_string()).await.is_err() {
            lock(&self.pending).remove(&id);
            bail!("DevTools connection closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(anyhow!("{} failed: {}", method, message)),
            Ok(Err(_)) => Err(anyhow!("{}: connection closed before reply", method)),
            Err(_) => {
                lock(&self.pending).remove(&id);
                Err(anyhow!("{} timed out after {:?}", method, timeout))
            }
        }
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn lock(pending: &Pending) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Reply>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn connection_loop(
    ws_stream: WsStream,
    mut outbound_rx: mpsc::Receiver<String>,
    pending: Pending,
    alive: Arc<AtomicBool>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch_reply(&text, &pending),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => {
                        warn!("[CDP] Browser closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        error!("[CDP] WS error: {}", e);
                        break;
                    }
                    None => {
                        debug!("[CDP] Stream ended");
                        break;
                    }
                    _ => {}
                }
            }
            out = outbound_rx.recv() => {
                match out {
                    Some(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            error!("[CDP] Send failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiting caller.
    lock(&pending).clear();
}

/// Route a response frame to its caller. Event frames carry no id.
fn dispatch_reply(text: &str, pending: &Pending) {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!("[CDP] Unparseable frame: {}", e);
            return;
        }
    };
    let Some(id) = frame.get("id").and_then(|v| v.as_u64()) else {
        return;
    };
    let Some(tx) = lock(pending).remove(&id) else {
        debug!("[CDP] Reply for unknown or expired id {}", id);
        return;
    };
    let reply = match frame.get("error") {
        Some(err) => Err(err["message"].as_str().unwrap_or("unknown error").to_string()),
        None => Ok(frame.get("result").cloned().unwrap_or(Value::Null)),
    };
    let _ = tx.send(reply);
}
