//! Realtime websocket client
//!
//! Every channel runs in its own task holding a long-lived websocket
//! connection. The task joins the channel, forwards row changes to the sink,
//! sends heartbeats, and reconnects with exponential backoff when the
//! connection drops. Dropping the `ChannelHandle` sends `phx_leave` and ends
//! the task.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::message::{Frame, ServerFrame};
use crate::channel::{ChannelCommand, ChannelHandle, ChannelSpec, ChannelState, ChannelStatus};
use crate::config::Config;
use crate::error::{SyncError, SyncResult};
use crate::provider::{ChangeEvent, RealtimeProvider};

/// Supplies the current access token for channel joins
pub type TokenSource = Arc<dyn Fn() -> Option<String> + Send + Sync>;

/// Configuration for realtime connections
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Websocket endpoint, e.g. `wss://host/realtime/v1`
    pub url: String,
    /// Public API key
    pub api_key: String,
    pub heartbeat_interval: Duration,
    /// Initial reconnect delay
    pub initial_reconnect_delay: Duration,
    /// Maximum reconnect delay
    pub max_reconnect_delay: Duration,
    /// How long to wait for the join reply
    pub join_timeout: Duration,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            heartbeat_interval: Duration::from_secs(25),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(30),
            join_timeout: Duration::from_secs(10),
        }
    }
}

impl RealtimeConfig {
    /// Build from application config; None when no backend is configured
    pub fn from_config(config: &Config) -> Option<Self> {
        Some(Self {
            url: config.realtime_endpoint()?,
            api_key: config.anon_key.clone()?,
            heartbeat_interval: config.heartbeat_interval(),
            initial_reconnect_delay: Duration::from_millis(config.reconnect_initial_ms.max(1)),
            max_reconnect_delay: Duration::from_millis(config.reconnect_max_ms.max(1)),
            ..Default::default()
        })
    }

    /// Websocket URL with the API key and protocol version
    pub fn socket_url(&self) -> String {
        format!(
            "{}/websocket?apikey={}&vsn=1.0.0",
            self.url.trim_end_matches('/'),
            self.api_key
        )
    }
}

/// Realtime provider over the Phoenix websocket protocol
#[derive(Clone)]
pub struct RealtimeClient {
    config: RealtimeConfig,
    token: TokenSource,
}

impl RealtimeClient {
    pub fn new(config: RealtimeConfig, token: TokenSource) -> Self {
        Self { config, token }
    }
}

#[async_trait]
impl RealtimeProvider for RealtimeClient {
    async fn subscribe(
        &self,
        spec: ChannelSpec,
        sink: mpsc::Sender<ChangeEvent>,
    ) -> SyncResult<ChannelHandle> {
        if self.config.url.is_empty() {
            return Err(SyncError::Network("realtime endpoint not configured".into()));
        }

        let (status, state_rx) = ChannelStatus::new(&spec.name);
        let (command_tx, command_rx) = mpsc::channel(4);
        let name = spec.name.clone();

        tokio::spawn(channel_task_loop(
            self.config.clone(),
            spec,
            self.token.clone(),
            sink,
            status,
            command_rx,
        ));

        Ok(ChannelHandle::new(&name, command_tx, state_rx))
    }
}

/// How a connection ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// Unsubscribed or the sink went away; stop for good
    Shutdown,
    /// Connection closed by the server; reconnect
    Closed {
        /// The join was acknowledged before the close
        joined: bool,
    },
}

/// Exponential reconnect delay
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay before the next attempt; doubles up to the maximum
    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Only a connection that reached `Active` counts as healthy
    fn record(&mut self, exit: Exit) {
        if exit == (Exit::Closed { joined: true }) {
            self.reset();
        }
    }
}

/// Main channel loop with reconnection
async fn channel_task_loop(
    config: RealtimeConfig,
    spec: ChannelSpec,
    token: TokenSource,
    sink: mpsc::Sender<ChangeEvent>,
    status: ChannelStatus,
    mut command_rx: mpsc::Receiver<ChannelCommand>,
) {
    let mut backoff = Backoff::new(config.initial_reconnect_delay, config.max_reconnect_delay);
    status.advance(ChannelState::Subscribing);

    loop {
        match connect_and_listen(&config, &spec, &token, &sink, &status, &mut command_rx).await {
            Ok(Exit::Shutdown) => break,
            Ok(exit @ Exit::Closed { joined }) => {
                if !joined {
                    debug!("Realtime channel {} closed before join", spec.name);
                }
                backoff.record(exit);
            }
            Err(e) => {
                warn!("Realtime channel {}: {:#}", spec.name, e);
            }
        }

        if sink.is_closed() {
            break;
        }
        status.advance(ChannelState::Reconnecting);

        // Wait before reconnecting, but honor an unsubscribe meanwhile
        tokio::select! {
            _ = tokio::time::sleep(backoff.next_delay()) => {}
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ChannelCommand::Unsubscribe) | None => break,
                }
            }
        }
    }

    status.advance(ChannelState::Terminated);
    info!("Realtime channel {} terminated", spec.name);
}

/// Connect, join and forward events until disconnection or unsubscribe
async fn connect_and_listen(
    config: &RealtimeConfig,
    spec: &ChannelSpec,
    token: &TokenSource,
    sink: &mpsc::Sender<ChangeEvent>,
    status: &ChannelStatus,
    command_rx: &mut mpsc::Receiver<ChannelCommand>,
) -> Result<Exit> {
    let (ws_stream, _) = connect_async(config.socket_url())
        .await
        .context("Failed to connect to realtime service")?;
    let (mut write, mut read) = ws_stream.split();

    let mut next_ref: u64 = 0;
    let mut make_ref = || {
        next_ref += 1;
        next_ref.to_string()
    };

    let topic = spec.topic();
    let join_ref = make_ref();
    let join = Frame::join(spec, token().as_deref(), &join_ref);
    write.send(Message::Text(join.encode()?)).await?;
    debug!("Realtime channel {}: join sent", spec.name);

    let mut joined = false;
    let join_deadline = tokio::time::sleep(config.join_timeout);
    tokio::pin!(join_deadline);

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    // First tick completes immediately
    heartbeat.tick().await;

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(ChannelCommand::Unsubscribe) | None => {
                        let leave = Frame::leave(&topic, &make_ref());
                        write.send(Message::Text(leave.encode()?)).await.ok();
                        write.close().await.ok();
                        return Ok(Exit::Shutdown);
                    }
                }
            }

            _ = heartbeat.tick() => {
                let frame = Frame::heartbeat(&make_ref());
                write.send(Message::Text(frame.encode()?)).await?;
            }

            _ = &mut join_deadline, if !joined => {
                anyhow::bail!("Timeout waiting for join reply on {}", topic);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame = match Frame::decode(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Realtime channel {}: undecodable frame: {}", spec.name, e);
                                continue;
                            }
                        };
                        if frame.topic != topic {
                            continue;
                        }
                        match ServerFrame::from_frame(frame) {
                            Ok(ServerFrame::Reply { reference, ok, response }) => {
                                if reference.as_deref() != Some(join_ref.as_str()) {
                                    continue;
                                }
                                if !ok {
                                    anyhow::bail!("Join rejected on {}: {}", topic, response);
                                }
                                joined = true;
                                status.advance(ChannelState::Active);
                                info!("Realtime channel {} active", spec.name);
                            }
                            Ok(ServerFrame::Change(event)) => {
                                if !spec.wants(event.event_type) {
                                    continue;
                                }
                                if sink.send(event).await.is_err() {
                                    // Nobody is listening anymore
                                    let leave = Frame::leave(&topic, &make_ref());
                                    write.send(Message::Text(leave.encode()?)).await.ok();
                                    return Ok(Exit::Shutdown);
                                }
                            }
                            Ok(ServerFrame::Closed { reason }) => {
                                warn!("Realtime channel {} closed by server ({})", spec.name, reason);
                                return Ok(Exit::Closed { joined });
                            }
                            Ok(ServerFrame::System(payload)) => {
                                debug!("Realtime channel {} system: {}", spec.name, payload);
                            }
                            Ok(ServerFrame::Other(event)) => {
                                debug!("Realtime channel {}: ignoring {}", spec.name, event);
                            }
                            Err(e) => {
                                warn!("Realtime channel {}: dropping frame: {}", spec.name, e);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Ok(Exit::Closed { joined });
                    }
                    Some(Err(e)) => {
                        return Err(e.into());
                    }
                    _ => {}
                }
            }
        }
    }
}
