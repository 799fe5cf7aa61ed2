//! Realtime change feed over WebSocket with reconnect backoff.
//!
//! Speaks the Phoenix channel protocol used by hosted Postgres realtime
//! services: join `realtime:{schema}:{table}` asking for `postgres_changes`,
//! heartbeat on the `phoenix` topic, and decode each row change into a
//! [`RemoteChange`]. Older servers deliver `INSERT`/`UPDATE`/`DELETE` as the
//! event name with `record`/`old_record` in the payload; both shapes are
//! accepted.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{Sink, SinkExt, StreamExt};
use satchel_core::{ChangeKind, ReconnectConfig, RemoteChange, RemoteError, SyncConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

/// Connection settings for the realtime socket.
#[derive(Debug, Clone)]
pub struct RealtimeOptions {
    pub url: String,
    pub schema: String,
    pub table: String,
    pub heartbeat: Duration,
    pub reconnect: ReconnectConfig,
}

impl RealtimeOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            url: config.realtime_url(),
            schema: "public".to_string(),
            table: config.table.clone(),
            heartbeat: Duration::from_millis(config.realtime.heartbeat_ms),
            reconnect: config.realtime.reconnect.clone(),
        }
    }

    /// Channel topic for the table.
    pub fn topic(&self) -> String {
        format!("realtime:{}:{}", self.schema, self.table)
    }
}

/// Handle to the background realtime task. Dropping it stops the task.
#[derive(Debug)]
pub struct RealtimeHandle {
    task: JoinHandle<()>,
}

impl RealtimeHandle {
    pub fn stop(self) {
        drop(self);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RealtimeHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Phoenix channel frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    msg_ref: Option<String>,
}

impl PhoenixMessage {
    fn join(topic: &str, schema: &str, table: &str, msg_ref: u64) -> Self {
        Self {
            topic: topic.to_string(),
            event: "phx_join".to_string(),
            payload: json!({
                "config": {
                    "broadcast": { "self": false },
                    "presence": { "key": "" },
                    "postgres_changes": [
                        { "event": "*", "schema": schema, "table": table }
                    ]
                }
            }),
            msg_ref: Some(msg_ref.to_string()),
        }
    }

    fn heartbeat(msg_ref: u64) -> Self {
        Self {
            topic: "phoenix".to_string(),
            event: "heartbeat".to_string(),
            payload: json!({}),
            msg_ref: Some(msg_ref.to_string()),
        }
    }
}

/// Spawn the realtime manager.
///
/// Decoded changes go to `sender`. The task reconnects forever with jittered
/// exponential backoff until the returned handle is dropped.
pub fn spawn_realtime(
    options: RealtimeOptions,
    sender: broadcast::Sender<RemoteChange>,
) -> RealtimeHandle {
    let task = tokio::spawn(async move {
        let mut backoff = Backoff::new(options.reconnect.clone());
        loop {
            match connect(&options).await {
                Ok(stream) => {
                    backoff.reset();
                    match run_session(stream, &options, &sender).await {
                        Ok(()) => info!(topic = %options.topic(), "Realtime connection closed"),
                        Err(err) => {
                            warn!(topic = %options.topic(), error = %err, "Realtime connection lost")
                        }
                    }
                }
                Err(err) => {
                    warn!(topic = %options.topic(), error = %err, "Realtime connection failed");
                }
            }

            let delay = jittered_backoff(backoff.advance(), options.reconnect.jitter_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    });
    RealtimeHandle { task }
}

/// Reconnect delay that grows while connecting fails.
#[derive(Debug, Clone)]
struct Backoff {
    config: ReconnectConfig,
    current_ms: u64,
}

impl Backoff {
    fn new(config: ReconnectConfig) -> Self {
        let current_ms = config.initial_ms;
        Self { config, current_ms }
    }

    /// Back to the initial delay. Called once a connection is established.
    fn reset(&mut self) {
        self.current_ms = self.config.initial_ms;
    }

    /// Delay to wait now; the next one is larger, up to `max_ms`.
    fn advance(&mut self) -> u64 {
        let delay = self.current_ms;
        let next = (self.current_ms as f64 * self.config.multiplier) as u64;
        self.current_ms = next.min(self.config.max_ms);
        delay
    }
}

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(options: &RealtimeOptions) -> Result<Socket, RemoteError> {
    let (stream, _response) = tokio_tungstenite::connect_async(options.url.as_str())
        .await
        .map_err(|e| RemoteError::Realtime {
            reason: e.to_string(),
        })?;
    Ok(stream)
}

/// One connection lifetime: join, then pump frames until the socket ends.
async fn run_session(
    stream: Socket,
    options: &RealtimeOptions,
    sender: &broadcast::Sender<RemoteChange>,
) -> Result<(), RemoteError> {
    let (mut sink, mut source) = stream.split();

    let topic = options.topic();
    let mut msg_ref: u64 = 1;
    let join = PhoenixMessage::join(&topic, &options.schema, &options.table, msg_ref);
    send_frame(&mut sink, &join).await?;
    info!(topic = %topic, "Realtime channel join sent");

    let mut heartbeat = tokio::time::interval(options.heartbeat);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = heartbeat.tick() => {
                msg_ref += 1;
                send_frame(&mut sink, &PhoenixMessage::heartbeat(msg_ref)).await?;
            }
            message = source.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => match decode_frame(&text) {
                        Ok(Some(change)) => {
                            debug!(key = %change.key, kind = change.kind.as_str(), "Realtime change");
                            // No subscribers is fine.
                            let _ = sender.send(change);
                        }
                        Ok(None) => {}
                        Err(err) => warn!(error = %err, "Undecodable realtime frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        return Err(RemoteError::Realtime {
                            reason: err.to_string(),
                        })
                    }
                }
            }
        }
    }
}

async fn send_frame<S>(sink: &mut S, frame: &PhoenixMessage) -> Result<(), RemoteError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let text = serde_json::to_string(frame).map_err(|e| RemoteError::Realtime {
        reason: e.to_string(),
    })?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| RemoteError::Realtime {
            reason: e.to_string(),
        })
}

/// Decode one text frame.
///
/// Returns `Ok(None)` for frames that carry no row change (replies,
/// heartbeats, presence, system messages).
pub fn decode_frame(text: &str) -> Result<Option<RemoteChange>, RemoteError> {
    let frame: PhoenixMessage =
        serde_json::from_str(text).map_err(|e| RemoteError::decode("realtime", e))?;

    match frame.event.as_str() {
        "postgres_changes" => {
            let data = frame.payload.get("data").ok_or_else(|| {
                RemoteError::decode("realtime", "postgres_changes without data")
            })?;
            let kind_name = data
                .get("type")
                .or_else(|| data.get("eventType"))
                .and_then(Value::as_str)
                .ok_or_else(|| RemoteError::decode("realtime", "change without type"))?;
            decode_row_change(kind_name, data).map(Some)
        }
        "INSERT" | "UPDATE" | "DELETE" => decode_row_change(&frame.event, &frame.payload).map(Some),
        "phx_reply" => {
            if frame.payload.get("status").and_then(Value::as_str) == Some("error") {
                warn!(topic = %frame.topic, payload = %frame.payload, "Realtime join rejected");
            }
            Ok(None)
        }
        "phx_error" => Err(RemoteError::Realtime {
            reason: format!("channel error on {}", frame.topic),
        }),
        _ => Ok(None),
    }
}

fn decode_row_change(kind_name: &str, data: &Value) -> Result<RemoteChange, RemoteError> {
    let kind = ChangeKind::from_wire(kind_name).ok_or_else(|| {
        RemoteError::decode("realtime", format!("unknown change type {}", kind_name))
    })?;

    let record = data.get("record").filter(|r| !r.is_null());
    let old_record = data.get("old_record").filter(|r| !r.is_null());

    let row = match kind {
        ChangeKind::Delete => old_record.or(record),
        ChangeKind::Insert | ChangeKind::Update => record,
    };
    let key = row
        .and_then(|r| r.get("key"))
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::decode("realtime", "row change without key"))?;

    let json_column = matches!(value_column_type(data), Some("json" | "jsonb"));
    let new_value = match kind {
        ChangeKind::Delete => None,
        _ => row
            .and_then(|r| r.get("value"))
            .and_then(|value| value_text(value, json_column)),
    };

    Ok(RemoteChange::upsert(kind, key, new_value))
}

/// Declared type of the `value` column, from the payload's `columns` list.
fn value_column_type(data: &Value) -> Option<&str> {
    data.get("columns")?
        .as_array()?
        .iter()
        .find(|column| column.get("name").and_then(Value::as_str) == Some("value"))?
        .get("type")
        .and_then(Value::as_str)
}

/// Render a `value` cell as the JSON text the cache stores.
///
/// A text column already holds JSON text. A `json`/`jsonb` column arrives
/// decoded, so strings are quoted again.
fn value_text(value: &Value, json_column: bool) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if !json_column => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_nanos(0))
        .subsec_nanos() as u64;
    let jitter = nanos % jitter_ms;
    base_ms.saturating_add(jitter)
}
