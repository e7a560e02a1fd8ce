//! WebSocket server loop
//!
//! Task-per-connection: each accepted socket gets a reader task (feeding the
//! dispatcher) and a writer task (draining the connection's outbound
//! channel, so frames to one client stay FIFO). Housekeeping runs on two
//! timers: a 5-minute tick for challenges and rendezvous entries, an hourly
//! tick for message-store and media retention.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::{frame::coding::CloseCode, CloseFrame, Message};
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    connection::ConnectionManager,
    dispatch::Dispatcher,
    media::MediaStore,
    rate_limit::{hash_ip, RateAction, RateLimiter, WINDOW_MS},
    sink::{ChannelSink, FrameSink, Outbound},
    store::MessageStore,
};

const HOUSEKEEPING_INTERVAL: Duration = Duration::from_secs(5 * 60);
const RETENTION_INTERVAL: Duration = Duration::from_secs(60 * 60);

pub struct Server {
    pub config: ServerConfig,
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<MessageStore>,
    pub rate_limiter: Arc<RateLimiter>,
    pub media: Option<Arc<MediaStore>>,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        let manager = Arc::new(ConnectionManager::new(config.verify_challenge_signatures));
        let store = Arc::new(MessageStore::new());
        let rate_limiter = Arc::new(RateLimiter::new(config.enable_rate_limiting));
        let media = config
            .enable_media_storage
            .then(|| Arc::new(MediaStore::new()));

        let dispatcher = Arc::new(Dispatcher::new(
            manager.clone(),
            store.clone(),
            rate_limiter.clone(),
            media.clone(),
            config.clone(),
        ));

        Arc::new(Self { config, manager, store, rate_limiter, media, dispatcher })
    }

    /// Bind and serve until the listener task is aborted or `stop` is called.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");

        self.clone().spawn_housekeeping();

        loop {
            let (stream, peer) = listener.accept().await?;
            let server = self.clone();
            tokio::spawn(async move {
                if let Err(err) = server.accept_connection(stream, peer).await {
                    debug!(%peer, %err, "connection ended with error");
                }
            });
        }
    }

    fn spawn_housekeeping(self: Arc<Self>) {
        let server = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(HOUSEKEEPING_INTERVAL);
            loop {
                tick.tick().await;
                server.manager.housekeeping();
            }
        });
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(RETENTION_INTERVAL);
            loop {
                tick.tick().await;
                let pruned = self.store.prune_expired();
                if pruned > 0 {
                    info!(pruned, "retention pass removed messages");
                }
                if let Some(media) = &self.media {
                    media.prune_expired();
                }
            }
        });
    }

    async fn accept_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ip_hash = hash_ip(&peer.ip().to_string(), &self.config.rate_limit_salt);

        if self.rate_limiter.is_rate_limited(
            &ip_hash,
            RateAction::Connection,
            self.config.max_connections_per_ip,
            WINDOW_MS,
        ) {
            debug!(ip_hash, "connection rate limited");
            return Ok(());
        }

        let websocket = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sink, mut ws_stream) = websocket.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let sink = Arc::new(ChannelSink::new(out_tx));
        let client_id = self.manager.add_connection(sink.clone(), ip_hash);
        info!(client_id, "client connected");

        // Writer: sole owner of the socket's send half.
        let writer_sink = sink.clone();
        let writer = tokio::spawn(async move {
            while let Some(outbound) = out_rx.recv().await {
                let result = match outbound {
                    Outbound::Text(text) => ws_sink.send(Message::Text(text)).await,
                    Outbound::Close(code) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: "".into(),
                        };
                        let _ = ws_sink.send(Message::Close(Some(frame))).await;
                        break;
                    }
                };
                if result.is_err() {
                    writer_sink.mark_closed();
                    break;
                }
            }
        });

        // Keepalive: WS ping on the configured interval, and an idle cutoff
        // for sockets that stop answering past the ping timeout.
        let ping_sink = sink.clone();
        let ping_manager = self.manager.clone();
        let ping_client_id = client_id.clone();
        let ping_interval = Duration::from_millis(self.config.ws_ping_interval_ms);
        let idle_cutoff_ms =
            (self.config.ws_ping_interval_ms + self.config.ws_ping_timeout_ms) as i64;
        let pinger = tokio::spawn(async move {
            let mut tick = tokio::time::interval(ping_interval);
            tick.tick().await; // immediate first tick
            loop {
                tick.tick().await;
                if !ping_sink.is_open() {
                    break;
                }
                let now = chrono::Utc::now().timestamp_millis();
                match ping_manager.last_activity_of(&ping_client_id) {
                    Some(last) if now - last > idle_cutoff_ms => {
                        debug!(client_id = %ping_client_id, "idle past ping timeout");
                        ping_sink.close(crate::sink::CLOSE_NORMAL);
                        break;
                    }
                    None => break,
                    Some(_) => {}
                }
                // Application-level ping frame; the reader treats the pong
                // (or any traffic) as activity.
                if !ping_sink.send_text(
                    pm_proto::Frame::new(
                        pm_proto::FrameType::Ping,
                        uuid::Uuid::new_v4().to_string(),
                        serde_json::json!({}),
                    )
                    .to_json(),
                ) {
                    break;
                }
            }
        });

        // Reader: drives the dispatcher until the socket closes.
        while let Some(message) = ws_stream.next().await {
            match message {
                Ok(Message::Text(text)) => self.dispatcher.handle_text(&client_id, &text),
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {
                    self.manager.touch(&client_id);
                }
                Ok(Message::Close(_)) => break,
                Ok(_) => {
                    // Binary frames are not part of the protocol.
                    warn!(client_id, "ignoring non-text frame");
                }
                Err(err) => {
                    debug!(client_id, %err, "read error");
                    break;
                }
            }
        }

        info!(client_id, "client disconnected");
        sink.mark_closed();
        self.manager.remove_connection(&client_id);
        pinger.abort();
        writer.abort();
        Ok(())
    }

    /// Graceful shutdown: close every socket with 1001 and clear state.
    pub fn stop(&self) {
        self.manager.stop();
    }
}
