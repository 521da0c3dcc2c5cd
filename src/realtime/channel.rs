//! Channel (C6): one authenticated duplex connection. Grounded on the
//! teacher's `router::websocket::handler::handle_socket`, which split the
//! socket and ran a `tokio::select!` over the reader and a handful of
//! broadcast subscriptions; here the select widens to a per-channel
//! outbound queue fed by N per-session workers instead of a couple of
//! fixed sinks.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::docker::traits::{ContainerRuntime, DockerError};
use crate::executor::{self, AgentProfile, ClaudeProfile, CodexProfile, CursorProfile};
use crate::pool::{ContainerPool, UserContext};
use crate::registry::{new_session, AgentKind, SessionRegistry, SessionState};

use super::wire::{Inbound, Outbound, SessionSummary, ShedPriority};

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("authentication failed: {0}")]
    Unauthorized(&'static str),
}

/// Heartbeat/backpressure knobs, lifted from `RealtimeConfiguration`.
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_queue_bound: usize,
}

struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    notify: Notify,
    bound: usize,
}

impl OutboundQueue {
    fn new(bound: usize) -> Self {
        Self { items: Mutex::new(VecDeque::new()), notify: Notify::new(), bound }
    }

    /// Applies the §4.6 shedding policy: coalesce consecutive `status` for
    /// the same session, then if still over the bound, evict the oldest
    /// droppable entry before admitting a new one.
    fn push(&self, msg: Outbound) {
        let mut items = self.items.lock();

        if let Some(key) = msg.coalesce_key() {
            if let Some(slot) = items.iter_mut().rev().find(|m| m.coalesce_key().as_deref() == Some(key)) {
                *slot = msg;
                drop(items);
                self.notify.notify_one();
                return;
            }
        }

        if items.len() >= self.bound {
            if let Some(pos) = items.iter().position(|m| m.shed_priority() == ShedPriority::Droppable) {
                items.remove(pos);
            } else if msg.shed_priority() == ShedPriority::Droppable {
                return;
            }
        }

        items.push_back(msg);
        drop(items);
        self.notify.notify_one();
    }

    async fn pop(&self) -> Outbound {
        loop {
            if let Some(msg) = self.items.lock().pop_front() {
                return msg;
            }
            self.notify.notified().await;
        }
    }
}

/// Serves one upgraded WebSocket for `user_id` until it disconnects, a
/// liveness timeout fires, or the writer can't keep the outbound queue
/// drained.
#[instrument(skip(socket, pool, registry, settings), fields(user_id = %user.user_id))]
pub async fn serve<R: ContainerRuntime + 'static>(
    socket: WebSocket,
    user: UserContext,
    pool: Arc<ContainerPool<R>>,
    registry: Arc<SessionRegistry>,
    settings: ChannelSettings,
) {
    let (mut sink, mut stream) = socket.split();
    let queue = Arc::new(OutboundQueue::new(settings.outbound_queue_bound));
    let channel_cancel = CancellationToken::new();
    let last_activity = Arc::new(Mutex::new(Utc::now()));

    info!("channel opened for user {}", user.user_id);

    let heartbeat = {
        let queue = queue.clone();
        let cancel = channel_cancel.clone();
        let interval = settings.heartbeat_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => queue.push(Outbound::Pong),
                }
            }
        })
    };

    let writer = {
        let queue = queue.clone();
        let cancel = channel_cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    msg = queue.pop() => {
                        let text = serde_json::to_string(&msg).unwrap_or_default();
                        let sent = tokio::time::timeout(Duration::from_secs(10), sink.send(Message::Text(text))).await;
                        match sent {
                            Ok(Ok(())) => {}
                            _ => {
                                warn!("channel writer could not drain queue, closing");
                                cancel.cancel();
                                return;
                            }
                        }
                    }
                }
            }
        })
    };

    loop {
        let idle_deadline = tokio::time::sleep(settings.idle_timeout);

        tokio::select! {
            _ = channel_cancel.cancelled() => break,

            _ = idle_deadline => {
                let idle_for = Utc::now() - *last_activity.lock();
                if idle_for.to_std().unwrap_or_default() >= settings.idle_timeout {
                    debug!("channel idle timeout for user {}", user.user_id);
                    break;
                }
            }

            frame = stream.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        *last_activity.lock() = Utc::now();
                        handle_inbound(&text, &user, &pool, &registry, &queue, &channel_cancel).await;
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        *last_activity.lock() = Utc::now();
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("channel read error for user {}: {}", user.user_id, e);
                        break;
                    }
                }
            }
        }
    }

    channel_cancel.cancel();
    heartbeat.abort();
    writer.abort();
    info!("channel closed for user {}", user.user_id);
}

async fn handle_inbound<R: ContainerRuntime + 'static>(
    text: &str,
    user: &UserContext,
    pool: &Arc<ContainerPool<R>>,
    registry: &Arc<SessionRegistry>,
    queue: &Arc<OutboundQueue>,
    channel_cancel: &CancellationToken,
) {
    let inbound: Inbound = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            queue.push(Outbound::Error { message: format!("malformed frame: {e}") });
            return;
        }
    };

    let _ = pool.mark_active(&user.user_id).await;

    match inbound {
        Inbound::Ping => queue.push(Outbound::Pong),

        Inbound::ListSessions => {
            let sessions = registry
                .list_for_user(&user.user_id)
                .into_iter()
                .map(|s| SessionSummary {
                    server_id: s.server_id,
                    agent_id: s.agent_id,
                    agent: s.agent.label().to_string(),
                    state: s.state.label().to_string(),
                    project_path: s.project_path,
                })
                .collect();
            queue.push(Outbound::ActiveSessions { sessions });
        }

        Inbound::Status { session_id } => {
            let ids: Vec<String> = match session_id {
                Some(id) => vec![id],
                None => registry.list_for_user(&user.user_id).into_iter().map(|s| s.server_id).collect(),
            };
            for id in ids {
                if let Some(session) = registry.get(&id) {
                    queue.push(Outbound::SessionStatus { server_id: session.server_id, state: session.state.label().to_string() });
                }
            }
        }

        Inbound::Abort { session_id } => {
            match registry.abort(&session_id) {
                Ok(()) => queue.push(Outbound::SessionStatus { server_id: session_id, state: "aborted".to_string() }),
                Err(e) => queue.push(Outbound::Error { message: e.to_string() }),
            }
        }

        Inbound::Run { agent, command, options, temp_session_id } => {
            let user = user.clone();
            let pool = pool.clone();
            let registry = registry.clone();
            let queue = queue.clone();
            let channel_cancel = channel_cancel.clone();

            tokio::spawn(async move {
                run_session(user, pool, registry, queue, channel_cancel, agent, command, options, temp_session_id).await;
            });
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_session<R: ContainerRuntime + 'static>(
    user: UserContext,
    pool: Arc<ContainerPool<R>>,
    registry: Arc<SessionRegistry>,
    queue: Arc<OutboundQueue>,
    channel_cancel: CancellationToken,
    agent: AgentKind,
    command: String,
    options: crate::executor::AgentOptions,
    temp_session_id: String,
) {
    let handle = match pool.get_or_create(&user).await {
        Ok(h) => h,
        Err(e) => {
            queue.push(Outbound::Error { message: format!("container unavailable: {e}") });
            return;
        }
    };

    let server_id = uuid::Uuid::new_v4().to_string();
    let project_path = "/workspace".to_string();
    let session = new_session(server_id.clone(), user.user_id.clone(), handle.container_id.clone(), agent, project_path);
    let cancel_token = session.cancel_token.clone();
    registry.register(session);

    queue.push(Outbound::SessionCreated { temp_session_id: Some(temp_session_id), server_id: server_id.clone(), agent_id: None });

    let _ = registry.activate(&server_id);

    let profile: Arc<dyn AgentProfile> = match agent {
        AgentKind::Claude => Arc::new(ClaudeProfile),
        AgentKind::Cursor => Arc::new(CursorProfile),
        AgentKind::Codex => Arc::new(CodexProfile),
    };

    // A channel-level close cancels every session it started; the session
    // itself is unaffected by the channel closing otherwise.
    let session_cancel = cancel_token.clone();
    let linked = tokio::spawn({
        let channel_cancel = channel_cancel.clone();
        async move { channel_cancel.cancelled().await; session_cancel.cancel(); }
    });

    let mut rx = match executor::run(pool.runtime(), registry.clone(), handle.container_id.clone(), server_id.clone(), profile, command, options, cancel_token).await {
        Ok(rx) => rx,
        Err(e) => {
            // The container died under us between get_or_create and this
            // exec — forget it now so the next run recreates instead of
            // repeatedly hitting the same dead container_id.
            if matches!(e, executor::ExecutorError::Docker(DockerError::NotRunning(_))) {
                if let Err(forget_err) = pool.mark_failed_and_forget(&user.user_id).await {
                    warn!("failed to demote dead container record for user {}: {}", user.user_id, forget_err);
                }
            }
            queue.push(Outbound::Message { server_id: server_id.clone(), agent_id: None, payload: executor::ExecutionMessage::Error { reason: e.to_string(), aborted: false } });
            let _ = registry.mark_terminal(&server_id, SessionState::Failed);
            if !registry.has_in_flight(&user.user_id) {
                queue.push(Outbound::ServerEvent { event: "projects_changed".to_string() });
            }
            linked.abort();
            return;
        }
    };

    let mut final_state = SessionState::Completed;
    while let Some(message) = rx.recv().await {
        registry.touch(&server_id);

        if let executor::ExecutionMessage::SessionCreated { ref agent_id } = message {
            let _ = queue_session_created(&queue, &registry, &server_id, agent_id);
        }

        let terminal = message.is_terminal();
        if terminal {
            final_state = match &message {
                executor::ExecutionMessage::Error { aborted: true, .. } => SessionState::Aborted,
                executor::ExecutionMessage::Error { .. } => SessionState::Failed,
                _ => SessionState::Completed,
            };
        }

        let agent_id = registry.get(&server_id).and_then(|s| s.agent_id);
        queue.push(Outbound::Message { server_id: server_id.clone(), agent_id, payload: message });

        if terminal {
            break;
        }
    }

    let _ = registry.mark_terminal(&server_id, final_state);
    if !registry.has_in_flight(&user.user_id) {
        queue.push(Outbound::ServerEvent { event: "projects_changed".to_string() });
    }
    linked.abort();
}

fn queue_session_created(queue: &Arc<OutboundQueue>, registry: &Arc<SessionRegistry>, server_id: &str, agent_id: &str) -> Option<()> {
    let _ = registry;
    queue.push(Outbound::SessionCreated { temp_session_id: None, server_id: server_id.to_string(), agent_id: Some(agent_id.to_string()) });
    Some(())
}
