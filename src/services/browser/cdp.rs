//! Chrome DevTools Protocol 连接
//!
//! 在 WebSocket 之上实现请求/响应关联：每个请求分配递增 id，
//! 通过 oneshot 通道等待对应响应；没有 id 的消息作为事件广播。

use crate::error::{ApiError, ApiResult};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, trace, warn};

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value, String>>>>>;

/// 协议事件
#[derive(Debug, Clone)]
pub struct CdpEvent {
    pub method: String,
    pub params: Value,
}

pub struct CdpConnection {
    next_id: AtomicU64,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<CdpEvent>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl CdpConnection {
    pub async fn connect(ws_url: &str) -> ApiResult<Self> {
        let (stream, _) = connect_async(ws_url)
            .await
            .map_err(|e| ApiError::Browser(format!("Failed to connect to {}: {}", ws_url, e)))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("CDP writer stopped: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let (events, _) = broadcast::channel(512);

        let reader = {
            let pending = pending.clone();
            let events = events.clone();
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("CDP reader stopped: {}", e);
                            break;
                        }
                    };

                    match serde_json::from_str::<Value>(&text) {
                        Ok(value) => dispatch(&pending, &events, value),
                        Err(e) => warn!("Unparsable CDP message: {}", e),
                    }
                }

                // 连接关闭，唤醒所有等待者
                for (_, waiter) in pending.lock().drain() {
                    let _ = waiter.send(Err("connection closed".to_string()));
                }
            })
        };

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            events,
            reader,
            writer,
        })
    }

    /// 发送命令并等待响应
    pub async fn call(&self, method: &str, params: Value, timeout: Duration) -> ApiResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        // 调用方被取消或超时都会移除等待项
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = json!({ "id": id, "method": method, "params": params });
        trace!("CDP -> {}", request);
        if self.outgoing.send(Message::Text(request.to_string())).is_err() {
            return Err(ApiError::Browser(format!("{}: connection closed", method)));
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(ApiError::Browser(format!("{} failed: {}", method, message))),
            Ok(Err(_)) => Err(ApiError::Browser(format!("{}: connection closed", method))),
            Err(_) => Err(ApiError::Timeout(format!("{} timed out after {:?}", method, timeout))),
        }
    }

    #[cfg(test)]
    fn pending_calls(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CdpEvent> {
        self.events.subscribe()
    }
}

struct PendingGuard<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

impl Drop for CdpConnection {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}

fn dispatch(pending: &Pending, events: &broadcast::Sender<CdpEvent>, value: Value) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(waiter) = pending.lock().remove(&id) else {
            return;
        };
        let outcome = match value.get("error") {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string()),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = waiter.send(outcome);
        return;
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        let event = CdpEvent {
            method: method.to_string(),
            params: value.get("params").cloned().unwrap_or(Value::Null),
        };
        // 没有订阅者时忽略
        let _ = events.send(event);
    }
}
