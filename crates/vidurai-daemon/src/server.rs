//! IPC Server
//!
//! Accepts sensor and consumer connections on a Unix domain socket,
//! speaking the NDJSON frame protocol. Each connection starts with a
//! handshake (version gate), then streams event frames and requests.
//! Back-pressure from the intake queue surfaces as a `busy` error frame
//! so sensors retry with backoff instead of dropping silently.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use vidurai_core::oracle::Audience;
use vidurai_core::{
    ContextRequest, Engine, EngineError, Event, FocusState, IngressError, PinTarget, RecallQuery,
};

use crate::protocol::{ErrorCode, Frame, FrameType, PinBody, RequestBody, PROTOCOL_VERSION};

/// Run the daemon server until the shutdown signal flips
pub async fn run(
    engine: Arc<Engine>,
    socket_path: PathBuf,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    if socket_path.exists() {
        let _ = std::fs::remove_file(&socket_path);
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "daemon listening");

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            accept = listener.accept() => {
                let (stream, _) = accept?;
                let engine = Arc::clone(&engine);
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, engine, shutdown).await {
                        debug!(?err, "connection closed with error");
                    }
                });
            }
        }
    }

    let _ = std::fs::remove_file(&socket_path);
    info!("daemon stopped accepting connections");
    Ok(())
}

async fn handle_connection(
    stream: UnixStream,
    engine: Arc<Engine>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    // First frame must be a handshake with a matching version
    if reader.read_line(&mut line).await? == 0 {
        return Ok(());
    }
    match serde_json::from_str::<Frame>(line.trim()) {
        Ok(frame) if frame.frame_type == FrameType::Handshake => {
            if frame.v != PROTOCOL_VERSION {
                send(
                    &mut write_half,
                    &Frame::error(
                        frame.id,
                        ErrorCode::UnsupportedVersion,
                        format!("daemon speaks v{PROTOCOL_VERSION}, sensor sent v{}", frame.v),
                    ),
                )
                .await?;
                return Ok(());
            }
            send(&mut write_half, &Frame::handshake()).await?;
        }
        Ok(frame) => {
            send(
                &mut write_half,
                &Frame::error(frame.id, ErrorCode::BadRequest, "handshake required first"),
            )
            .await?;
            return Ok(());
        }
        Err(e) => {
            send(
                &mut write_half,
                &Frame::error(None, ErrorCode::BadRequest, format!("unparseable frame: {e}")),
            )
            .await?;
            return Ok(());
        }
    }

    loop {
        line.clear();
        let read = tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
            read = reader.read_line(&mut line) => read?,
        };
        if read == 0 {
            break;
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let frame: Frame = match serde_json::from_str(trimmed) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "dropping unparseable frame");
                send(
                    &mut write_half,
                    &Frame::error(None, ErrorCode::BadRequest, format!("unparseable frame: {e}")),
                )
                .await?;
                continue;
            }
        };

        if let Some(reply) = dispatch(&engine, frame).await {
            send(&mut write_half, &reply).await?;
        }
    }

    Ok(())
}

async fn send(write_half: &mut tokio::net::unix::OwnedWriteHalf, frame: &Frame) -> Result<()> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await?;
    write_half.flush().await?;
    Ok(())
}

/// Handle one frame; None means no reply (heartbeats)
async fn dispatch(engine: &Arc<Engine>, frame: Frame) -> Option<Frame> {
    match frame.frame_type {
        FrameType::Ping => Some(Frame::pong(frame.id)),
        FrameType::Heartbeat => None,
        FrameType::Pong | FrameType::Ack | FrameType::Response | FrameType::Handshake => {
            // Peer-to-daemon only; ignore echoes
            None
        }
        FrameType::Error => {
            warn!(data = ?frame.data, "peer reported error");
            None
        }
        t if t.is_event() => Some(handle_event(engine, frame)),
        FrameType::Pin => Some(handle_pin(engine, frame, true).await),
        FrameType::Unpin => Some(handle_pin(engine, frame, false).await),
        FrameType::Request => Some(handle_request(engine, frame).await),
        // is_event covers the remaining variants; the guard above keeps
        // the compiler honest
        _ => None,
    }
}

fn handle_event(engine: &Arc<Engine>, frame: Frame) -> Frame {
    let Some(data) = frame.data else {
        return Frame::error(frame.id, ErrorCode::BadEvent, "event frame without data");
    };
    let event: Event = match serde_json::from_value(data) {
        Ok(event) => event,
        Err(e) => {
            return Frame::error(frame.id, ErrorCode::BadEvent, format!("bad event: {e}"));
        }
    };

    match engine.ingest_event_nowait(event) {
        Ok(()) => Frame::ack(frame.id),
        Err(EngineError::BadEvent(IngressError::Busy)) => {
            Frame::error(frame.id, ErrorCode::Busy, "intake queue full, retry with backoff")
        }
        Err(EngineError::BadEvent(e)) => Frame::error(frame.id, ErrorCode::BadEvent, e.to_string()),
        Err(e) => {
            error!(error = %e, "ingest failed");
            Frame::error(frame.id, ErrorCode::Internal, e.to_string())
        }
    }
}

async fn handle_pin(engine: &Arc<Engine>, frame: Frame, pin: bool) -> Frame {
    let body: PinBody = match frame.data.map(serde_json::from_value).transpose() {
        Ok(Some(body)) => body,
        Ok(None) => return Frame::error(frame.id, ErrorCode::BadRequest, "pin frame without data"),
        Err(e) => return Frame::error(frame.id, ErrorCode::BadRequest, format!("bad pin body: {e}")),
    };

    let target = match body.target.parse::<i64>() {
        Ok(id) => PinTarget::Memory(id),
        Err(_) => PinTarget::Path(body.target.clone()),
    };

    let result = if pin {
        engine
            .pin(
                target,
                body.reason.as_deref().unwrap_or("pinned via ipc"),
                body.pinned_by.as_deref().unwrap_or("user"),
            )
            .await
    } else {
        engine.unpin(target).await
    };

    match result {
        Ok(()) => Frame::ack(frame.id),
        Err(e) => Frame::error(frame.id, ErrorCode::BadRequest, e.to_string()),
    }
}

async fn handle_request(engine: &Arc<Engine>, frame: Frame) -> Frame {
    let body: RequestBody = match frame.data.clone().map(serde_json::from_value).transpose() {
        Ok(Some(body)) => body,
        Ok(None) => {
            return Frame::error(frame.id, ErrorCode::BadRequest, "request frame without data")
        }
        Err(e) => {
            return Frame::error(frame.id, ErrorCode::BadRequest, format!("bad request body: {e}"))
        }
    };

    match serve_method(engine, &body).await {
        Ok(data) => Frame::response(frame.id, data),
        Err(ServeError::BadRequest(msg)) => Frame::error(frame.id, ErrorCode::BadRequest, msg),
        Err(ServeError::Engine(e)) => {
            error!(method = %body.method, error = %e, "request failed");
            Frame::error(frame.id, ErrorCode::Internal, e.to_string())
        }
    }
}

enum ServeError {
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for ServeError {
    fn from(e: EngineError) -> Self {
        ServeError::Engine(e)
    }
}

async fn serve_method(
    engine: &Arc<Engine>,
    body: &RequestBody,
) -> std::result::Result<serde_json::Value, ServeError> {
    let params = &body.params;
    match body.method.as_str() {
        // The canonical Oracle call
        "get_context" => {
            let request = ContextRequest {
                audience: params
                    .get("audience")
                    .map(|a| serde_json::from_value::<Audience>(a.clone()))
                    .transpose()
                    .map_err(|e| ServeError::BadRequest(format!("bad audience: {e}")))?
                    .unwrap_or_default(),
                max_tokens: params
                    .get("maxTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0) as u32,
                query: params
                    .get("query")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                focus: parse_focus(params),
                project_path: params
                    .get("projectPath")
                    .and_then(|v| v.as_str())
                    .map(String::from),
            };
            let response = engine.get_context(request)?;
            Ok(serde_json::to_value(response)
                .map_err(|e| ServeError::BadRequest(e.to_string()))?)
        }
        "recall" => {
            let project_id = match params.get("projectPath").and_then(|v| v.as_str()) {
                Some(path) => engine
                    .store()
                    .find_project(path)
                    .map_err(EngineError::from)?
                    .map(|p| p.id),
                None => None,
            };
            let query = RecallQuery {
                project_id,
                text: params
                    .get("query")
                    .and_then(|v| v.as_str())
                    .map(String::from),
                focus: parse_focus(params),
                limit: params.get("limit").and_then(|v| v.as_u64()).unwrap_or(10) as usize,
            };
            let hits = engine.recall(query).await?;
            let memories: Vec<_> = hits
                .into_iter()
                .map(|h| serde_json::json!({ "memory": h.memory, "score": h.score }))
                .collect();
            Ok(serde_json::json!({ "results": memories }))
        }
        "stats" => {
            let stats = engine.stats()?;
            Ok(serde_json::to_value(stats).map_err(|e| ServeError::BadRequest(e.to_string()))?)
        }
        "get_pinned" => {
            let pins = engine.pins()?;
            let memories = engine.pinned_memories()?;
            Ok(serde_json::json!({ "pins": pins, "memories": memories }))
        }
        "set_config" => {
            engine.set_config(params.clone())?;
            Ok(serde_json::json!({ "applied": "next_tick_boundary" }))
        }
        "resolve_path" => {
            let path = params
                .get("path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| ServeError::BadRequest("resolve_path needs a path".into()))?;
            match engine.resolve_path(path)? {
                Some((project, relative)) => Ok(serde_json::json!({
                    "project": project,
                    "relativePath": relative,
                })),
                None => Ok(serde_json::json!({ "project": null })),
            }
        }
        "get_focus" => {
            let session = params.get("sessionId").and_then(|v| v.as_str());
            match engine.current_focus(session) {
                Some(focus) => Ok(serde_json::json!({
                    "filePath": focus.file_path,
                    "line": focus.line,
                })),
                None => Ok(serde_json::json!({ "filePath": null })),
            }
        }
        other => Err(ServeError::BadRequest(format!("unknown method '{other}'"))),
    }
}

fn parse_focus(params: &serde_json::Value) -> Option<FocusState> {
    let focus = params.get("focus")?;
    Some(FocusState {
        file_path: focus.get("filePath")?.as_str()?.to_string(),
        line: focus.get("line").and_then(|v| v.as_u64()).map(|l| l as u32),
    })
}

/// Default socket path under the engine's data directory
pub fn default_socket_path(data_dir: &Path) -> PathBuf {
    data_dir.join("vidurai.sock")
}

// ============================================================================
// TESTS
// ============================================================================
