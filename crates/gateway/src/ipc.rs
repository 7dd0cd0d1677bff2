//! Control-plane IPC server (§4.8): a local admin socket for out-of-band
//! session control — status queries, kills, restarts, model swaps, and
//! direct prompt injection — without going through a messaging backend.
//!
//! `[AMBIENT, implementation-level resolution]`: "local datagram socket" is
//! implemented as a `tokio::net::UnixListener` stream socket with a
//! per-connection accept loop, not `UnixDatagram` — a datagram socket has no
//! notion of a reply path back to a specific caller, and the command set
//! here is fundamentally request/response. Each connection reads and
//! answers newline-delimited JSON requests one at a time; many connections
//! may be open concurrently.

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use sa_domain::chat_id::ChatId;
use sa_domain::config::IpcConfig;
use sa_domain::error::{Error, Result};
use sa_domain::message::Message;
use sa_domain::tier::Tier;

use crate::orchestrator::{Orchestrator, SessionInfo};

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum Request {
    Status,
    KillSession {
        chat_id: String,
    },
    KillAllSessions,
    RestartSession {
        chat_id: String,
    },
    SetModel {
        chat_id: String,
        model: String,
    },
    Inject {
        chat_id: String,
        prompt: String,
        #[serde(default)]
        sms: bool,
        #[serde(default)]
        admin: bool,
        #[serde(default)]
        bg: bool,
        contact_name: Option<String>,
        tier: Option<Tier>,
        source: Option<String>,
        reply_to: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Response {
    Ok { ok: bool, data: serde_json::Value },
    Err { ok: bool, error: String },
}

fn ok(data: serde_json::Value) -> Response {
    Response::Ok { ok: true, data }
}

fn err(message: impl std::fmt::Display) -> Response {
    Response::Err {
        ok: false,
        error: message.to_string(),
    }
}

pub struct IpcServer {
    orchestrator: Arc<Orchestrator>,
    config: IpcConfig,
}

impl IpcServer {
    pub fn new(orchestrator: Arc<Orchestrator>, config: IpcConfig) -> Self {
        Self { orchestrator, config }
    }

    /// Bind the socket, removing a stale file left behind by a prior crash,
    /// and spawn the accept loop as a detached task.
    pub async fn spawn(self: Arc<Self>) -> Result<()> {
        let path = &self.config.socket_path;
        if path.exists() {
            std::fs::remove_file(path).map_err(Error::Io)?;
        }
        let listener = UnixListener::bind(path).map_err(Error::Io)?;
        set_socket_permissions(path)?;

        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _addr)) => {
                        let server = self.clone();
                        tokio::spawn(async move {
                            server.handle_connection(stream).await;
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "ipc: accept failed");
                    }
                }
            }
        });
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (read_half, mut write_half) = stream.into_split();
        let mut lines = BufReader::new(read_half).lines();

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "ipc: connection read failed");
                    return;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Request>(&line) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => err(format!("bad request: {e}")),
            };

            let mut payload = match serde_json::to_vec(&response) {
                Ok(bytes) => bytes,
                Err(e) => {
                    tracing::warn!(error = %e, "ipc: response serialization failed");
                    return;
                }
            };
            payload.push(b'\n');
            if write_half.write_all(&payload).await.is_err() {
                return;
            }
        }
    }

    async fn dispatch(&self, request: Request) -> Response {
        match request {
            Request::Status => {
                let sessions = self.orchestrator.get_all_sessions().await;
                ok(serde_json::json!({ "sessions": sessions }))
            }
            Request::KillSession { chat_id } => {
                let chat_id = ChatId::from_canonical(chat_id);
                let killed = self.orchestrator.kill_session(&chat_id).await;
                ok(serde_json::json!({ "killed": killed }))
            }
            Request::KillAllSessions => {
                let count = self.orchestrator.kill_all_sessions().await;
                ok(serde_json::json!({ "killed": count }))
            }
            Request::RestartSession { chat_id } => {
                let chat_id = ChatId::from_canonical(chat_id);
                match self.orchestrator.restart_session(&chat_id, None).await {
                    Ok(Some(info)) => ok(session_info_json(&info)),
                    Ok(None) => err("no registry entry for chat_id"),
                    Err(e) => err(e),
                }
            }
            Request::SetModel { chat_id, model } => {
                let chat_id = ChatId::from_canonical(chat_id);
                if let Err(e) = self.orchestrator.registry().update_model(&chat_id, model) {
                    return err(e);
                }
                match self.orchestrator.restart_session(&chat_id, None).await {
                    Ok(Some(info)) => ok(session_info_json(&info)),
                    Ok(None) => err("no registry entry for chat_id"),
                    Err(e) => err(e),
                }
            }
            Request::Inject {
                chat_id,
                prompt,
                sms,
                admin,
                bg,
                contact_name,
                tier,
                source,
                reply_to,
            } => self.dispatch_inject(chat_id, prompt, sms, admin, bg, contact_name, tier, source, reply_to).await,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch_inject(
        &self,
        chat_id: String,
        prompt: String,
        sms: bool,
        admin: bool,
        bg: bool,
        contact_name: Option<String>,
        tier: Option<Tier>,
        source: Option<String>,
        reply_to: Option<String>,
    ) -> Response {
        let chat_id = ChatId::from_canonical(chat_id);

        if bg {
            let name = contact_name.as_deref().unwrap_or("admin");
            return match self.orchestrator.inject_consolidation(name, &chat_id).await {
                Ok(()) => ok(serde_json::json!({ "injected": true })),
                Err(e) => err(e),
            };
        }

        if admin {
            let admin_id = contact_name.clone().unwrap_or_else(|| chat_id.as_str().to_string());
            return match self.orchestrator.inject_master_prompt(&admin_id, &prompt).await {
                Ok(()) => ok(serde_json::json!({ "injected": true })),
                Err(e) => err(e),
            };
        }

        let sender = contact_name.clone().unwrap_or_else(|| chat_id.as_str().to_string());
        let message = Message {
            chat_id,
            source: source.unwrap_or_else(|| if sms { "sms".into() } else { "ipc".into() }),
            sender,
            tier: tier.unwrap_or(Tier::Admin),
            display_name: contact_name,
            text: prompt,
            attachments: vec![],
            is_group: false,
            group_name: None,
            audio_transcription: None,
            reply_to_guid: reply_to,
            received_at: chrono::Utc::now(),
            native_id: None,
        };

        match self.orchestrator.inject_message(&message).await {
            Ok(()) => ok(serde_json::json!({ "injected": true })),
            Err(e) => err(e),
        }
    }
}

fn session_info_json(info: &SessionInfo) -> serde_json::Value {
    serde_json::to_value(info).unwrap_or(serde_json::Value::Null)
}

#[cfg(unix)]
fn set_socket_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = std::fs::Permissions::from_mode(0o600);
    std::fs::set_permissions(path, permissions).map_err(Error::Io)
}

#[cfg(not(unix))]
fn set_socket_permissions(_path: &Path) -> Result<()> {
    Ok(())
}
