//! WebSocket handler for editor connections.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use vbox_protocol::{ClientCommand, ClientMessage, FileNode, RejectReason, Reply, ServerEvent};

use crate::api::{ApiError, AppState};
use crate::codegen::{CodegenError, GenerateRequest};
use crate::session::{SessionError, SessionHandle, SessionResult};

use super::Gateway;
use super::auth::{Authorized, HandshakeQuery, authenticate};
use super::connections::ConnectionRecord;
use super::ratelimit::Operation;
use super::terminal::TerminalError;

/// How long a replaced connection may take to flush its last frames.
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// WebSocket upgrade handler.
///
/// GET /socket?userId=..&virtualboxId=..
pub async fn socket_handler(
    State(state): State<AppState>,
    Query(query): Query<HandshakeQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let gateway = state.gateway.clone();
    let auth = authenticate(query, &gateway.guard, gateway.identity.as_ref()).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, gateway, auth)))
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!("Failed to serialize event: {}", e);
            None
        }
    }
}

async fn handle_socket(socket: WebSocket, gateway: Arc<Gateway>, auth: Authorized) {
    let (mut sender, mut receiver) = socket.split();
    let (conn, mut events) =
        gateway
            .connections
            .register(&auth.user_id, &auth.project_id, auth.is_owner);
    info!(
        "Socket {} connected: user {} project {} (owner: {})",
        conn.socket_id, conn.user_id, conn.project_id, conn.is_owner
    );

    let session = if !conn.is_owner && !gateway.connections.owner_connected(&conn.project_id) {
        info!("Owner of {} is not connected; access disabled", conn.project_id);
        conn.disable("The virtualbox owner is not connected.");
        None
    } else {
        match gateway.sessions.open(&conn.project_id).await {
            Ok(session) => {
                let loaded = ServerEvent::Loaded {
                    files: session.tree().await,
                };
                if let Some(msg) = encode(&loaded) {
                    if sender.send(msg).await.is_err() {
                        gateway.connections.unregister(&conn);
                        return;
                    }
                }
                Some(session)
            }
            Err(e) => {
                error!("Failed to load project {}: {}", conn.project_id, e);
                let failure = ServerEvent::Error {
                    message: format!("Failed to load project: {e}"),
                };
                if let Some(msg) = encode(&failure) {
                    let _ = sender.send(msg).await;
                }
                let _ = sender.send(Message::Close(None)).await;
                gateway.connections.unregister(&conn);
                return;
            }
        }
    };

    let shutdown = conn.shutdown_token().clone();
    let ping_every = gateway.config.ping_interval();
    let socket_id = conn.socket_id;
    let mut send_task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + ping_every;
        let mut ping_interval = tokio::time::interval_at(start, ping_every);
        loop {
            tokio::select! {
                biased;

                Some(event) = events.recv() => {
                    let Some(msg) = encode(&event) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }

                _ = shutdown.cancelled() => {
                    debug!("Closing socket {}", socket_id);
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }

                _ = ping_interval.tick() => {
                    let Some(msg) = encode(&ServerEvent::Ping) else { continue };
                    if sender.send(msg).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    loop {
        let msg = tokio::select! {
            msg = receiver.next() => msg,
            _ = conn.shutdown_token().cancelled() => break,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => {
                        let reply =
                            handle_command(&gateway, &conn, session.as_deref(), msg.command).await;
                        if let (Some(request_id), Some(result)) = (msg.request_id, reply) {
                            conn.send(ServerEvent::Reply { request_id, result });
                        }
                    }
                    Err(e) => {
                        warn!("Failed to parse command from socket {}: {}", conn.socket_id, e);
                        conn.send(ServerEvent::Error {
                            message: format!("Invalid message: {e}"),
                        });
                    }
                }
            }
            Some(Ok(Message::Binary(_))) => {
                debug!("Received binary message from socket {}, ignoring", conn.socket_id);
            }
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
            Some(Ok(Message::Close(_))) | None => {
                info!("Socket {} closed by client", conn.socket_id);
                break;
            }
            Some(Err(e)) => {
                warn!("WebSocket error on socket {}: {}", conn.socket_id, e);
                break;
            }
        }
    }

    if conn.shutdown_token().is_cancelled() {
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await;
    }
    send_task.abort();

    if gateway.connections.unregister(&conn) {
        if conn.is_owner && !gateway.connections.owner_connected(&conn.project_id) {
            gateway.owner_left(&conn.project_id);
        }
    } else {
        debug!("Socket {} was replaced before it closed", conn.socket_id);
    }
    info!("Socket {} disconnected", conn.socket_id);
    gateway.schedule_idle_notice(&conn.project_id);
}

/// Refuse the call and push the matching `rateLimit` notice.
fn limited(conn: &ConnectionRecord, reason: RejectReason, message: String) -> Reply {
    conn.send(ServerEvent::RateLimit {
        message: message.clone(),
    });
    Reply::rejected(reason, message)
}

fn consume(gateway: &Gateway, conn: &ConnectionRecord, op: Operation) -> Result<(), Reply> {
    gateway.limiter.consume(op, &conn.user_id).map_err(|_| {
        limited(
            conn,
            RejectReason::RateLimited,
            format!("Rate limited: {}. Please slow down.", op.label()),
        )
    })
}

fn session_rejection(conn: &ConnectionRecord, err: SessionError) -> Reply {
    match err {
        SessionError::NotFound(id) => Reply::rejected(RejectReason::NotFound, format!("Not found: {id}")),
        SessionError::AlreadyExists(id) => {
            Reply::rejected(RejectReason::AlreadyExists, format!("Already exists: {id}"))
        }
        SessionError::InvalidName(name) => {
            Reply::rejected(RejectReason::InvalidRequest, format!("Invalid name: {name}"))
        }
        SessionError::QuotaExceeded { .. } => limited(
            conn,
            RejectReason::QuotaExceeded,
            "Rate limited: project size exceeded. Please delete some files.".to_string(),
        ),
        SessionError::FileTooLarge { .. } => limited(
            conn,
            RejectReason::FileTooLarge,
            "Rate limited: file size too large. Please reduce the file size.".to_string(),
        ),
        SessionError::Storage(e) => {
            error!("Storage failure on socket {}: {}", conn.socket_id, e);
            Reply::rejected(RejectReason::Internal, "Storage error")
        }
    }
}

fn tree_reply(result: SessionResult<Vec<FileNode>>, conn: &ConnectionRecord) -> Reply {
    match result {
        Ok(files) => Reply::Ack {
            success: true,
            files: Some(files),
        },
        Err(e) => session_rejection(conn, e),
    }
}

/// Terminal ids are shared process-wide; only touch those of this project.
fn owns_terminal(gateway: &Gateway, conn: &ConnectionRecord, id: &str) -> bool {
    gateway
        .terminals
        .info(id)
        .is_some_and(|t| t.project_id == conn.project_id)
}

/// Run one command. `None` means the command has no reply.
async fn handle_command(
    gateway: &Arc<Gateway>,
    conn: &ConnectionRecord,
    session: Option<&SessionHandle>,
    cmd: ClientCommand,
) -> Option<Reply> {
    if matches!(cmd, ClientCommand::Pong) {
        return None;
    }
    let session = match session {
        Some(session) if !conn.access_disabled() => session,
        _ => {
            debug!("Socket {} is read-only; refusing {}", conn.socket_id, cmd.name());
            return Some(Reply::rejected(
                RejectReason::AccessDisabled,
                "The virtualbox owner is not connected.",
            ));
        }
    };

    let reply = match cmd {
        ClientCommand::GetFile { file_id } => Reply::Content {
            content: session.get_file(&file_id).await,
        },

        ClientCommand::SaveFile { file_id, body } => {
            if let Err(reply) = consume(gateway, conn, Operation::Save) {
                return Some(reply);
            }
            if body.len() as u64 > gateway.max_file_bytes {
                return Some(limited(
                    conn,
                    RejectReason::FileTooLarge,
                    "Rate limited: file size too large. Please reduce the file size.".to_string(),
                ));
            }
            match session.save_file(&file_id, body).await {
                Ok(()) => Reply::Ack {
                    success: true,
                    files: None,
                },
                Err(e) => session_rejection(conn, e),
            }
        }

        ClientCommand::CreateFile { name } => {
            if let Err(reply) = consume(gateway, conn, Operation::CreateFile) {
                return Some(reply);
            }
            tree_reply(session.create_file(&name).await.map(|(_, tree)| tree), conn)
        }

        ClientCommand::CreateFolder { name } => {
            if let Err(reply) = consume(gateway, conn, Operation::CreateFolder) {
                return Some(reply);
            }
            tree_reply(session.create_folder(&name).await.map(|(_, tree)| tree), conn)
        }

        ClientCommand::DeleteFile { file_id } => {
            if let Err(reply) = consume(gateway, conn, Operation::Delete) {
                return Some(reply);
            }
            tree_reply(session.delete_file(&file_id).await, conn)
        }

        ClientCommand::DeleteFolder { folder_id } => {
            if let Err(reply) = consume(gateway, conn, Operation::Delete) {
                return Some(reply);
            }
            tree_reply(session.delete_folder(&folder_id).await, conn)
        }

        ClientCommand::RenameFile { file_id, new_name } => {
            if let Err(reply) = consume(gateway, conn, Operation::Rename) {
                return Some(reply);
            }
            tree_reply(session.rename_file(&file_id, &new_name).await, conn)
        }

        ClientCommand::RenameFolder {
            old_folder_id,
            new_folder_id,
        } => {
            if let Err(reply) = consume(gateway, conn, Operation::Rename) {
                return Some(reply);
            }
            tree_reply(
                session.rename_folder(&old_folder_id, &new_folder_id).await,
                conn,
            )
        }

        ClientCommand::MoveFile { file_id, folder_id } => {
            if let Err(reply) = consume(gateway, conn, Operation::Rename) {
                return Some(reply);
            }
            tree_reply(session.move_file(&file_id, &folder_id).await, conn)
        }

        ClientCommand::GetFolder { folder_id } => match session.get_folder(&folder_id).await {
            Ok(ids) => Reply::Ids { ids },
            Err(e) => session_rejection(conn, e),
        },

        ClientCommand::CreateTerminal { id } => {
            match gateway.terminals.create(&id, &conn.project_id, &conn.user_id) {
                Ok(created) => Reply::Terminal { created },
                Err(TerminalError::LimitReached(max)) => {
                    info!("Max terminals reached ({})", max);
                    Reply::rejected(
                        RejectReason::TerminalLimit,
                        format!("Maximum of {max} terminals reached"),
                    )
                }
                Err(e) => {
                    error!("Error creating terminal {}: {}", id, e);
                    Reply::Terminal { created: false }
                }
            }
        }

        ClientCommand::CloseTerminal { id } => {
            let closed = owns_terminal(gateway, conn, &id)
                && gateway.terminals.close(&id).unwrap_or_else(|e| {
                    error!("Error closing terminal {}: {}", id, e);
                    false
                });
            Reply::Ack {
                success: closed,
                files: None,
            }
        }

        ClientCommand::TerminalData { id, data } => {
            if !owns_terminal(gateway, conn, &id) {
                debug!("Terminal not found: {}", id);
                return None;
            }
            if let Err(e) = gateway.terminals.write(&id, &data) {
                warn!("Error writing to terminal {}: {}", id, e);
            }
            return None;
        }

        ClientCommand::TerminalResize { id, cols, rows } => {
            if owns_terminal(gateway, conn, &id) {
                if let Err(e) = gateway.terminals.resize(&id, cols, rows) {
                    warn!("Error resizing terminal {}: {}", id, e);
                }
            }
            return None;
        }

        ClientCommand::ResizeTerminal { cols, rows } => {
            if let Err(e) = gateway.terminals.resize_project(&conn.project_id, cols, rows) {
                warn!("Error resizing terminals: {}", e);
            }
            return None;
        }

        ClientCommand::GenerateCode {
            file_name,
            code,
            line,
            instructions,
        } => {
            let request = GenerateRequest {
                file_name: &file_name,
                code: &code,
                line,
                instructions: &instructions,
            };
            let (usage, generated) = tokio::join!(
                gateway.identity.record_generation(&conn.user_id),
                gateway.codegen.generate(&request),
            );
            if let Err(e) = usage {
                warn!("Failed to record code generation for {}: {}", conn.user_id, e);
            }
            match generated {
                Ok(data) => Reply::Generated { data },
                Err(CodegenError::Disabled) => {
                    Reply::rejected(RejectReason::Unavailable, "Code generation is not configured")
                }
                Err(e) => {
                    error!("generateCode failed: {}", e);
                    Reply::rejected(RejectReason::Internal, "Internal server error")
                }
            }
        }

        ClientCommand::Pong => return None,
    };
    Some(reply)
}
