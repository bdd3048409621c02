//! Signaling gateway
//!
//! Terminates one WebSocket per publisher. Each connection runs a read loop
//! driving its [`Session`], plus two helper tasks: a heartbeat pinging the peer
//! and a watcher for the process wide shutdown notification. Both helpers end
//! the connection by cancelling its token, and so does the loss of the
//! session's transport; teardown then happens in one place.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{Sink, SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::WebRtcEngine;
use crate::model::message::{Command, ProtocolError, SignalMessage};
use crate::rtmp::PipelineBackend;
use crate::session::{Session, SessionSettings};

type WsSink = Arc<Mutex<SplitSink<WebSocketStream<TcpStream>, Message>>>;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("websocket: {0}")]
    WebSocket(#[from] tungstenite::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Only upgrades on this path are accepted
    pub path: String,
    pub heartbeat: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        GatewayOptions {
            path: "/magicmirror".to_string(),
            heartbeat: Duration::from_secs(30),
        }
    }
}

pub struct Gateway {
    engine: Arc<dyn WebRtcEngine>,
    pipelines: Arc<dyn PipelineBackend>,
    settings: Arc<SessionSettings>,
    options: GatewayOptions,
    shutdown: broadcast::Sender<()>,
}

impl Gateway {
    pub fn new(
        engine: Arc<dyn WebRtcEngine>,
        pipelines: Arc<dyn PipelineBackend>,
        settings: Arc<SessionSettings>,
        options: GatewayOptions,
    ) -> Gateway {
        let (shutdown, _) = broadcast::channel(4);
        Gateway {
            engine,
            pipelines,
            settings,
            options,
            shutdown,
        }
    }

    /// Sending on this closes every open connection.
    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown.clone()
    }

    /// Accepts connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), GatewayError> {
        info!(
            "Signaling on ws://{}{}",
            listener.local_addr()?,
            self.options.path
        );

        loop {
            let (stream, addr) = listener.accept().await?;
            let gateway = self.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, addr).await {
                    warn!("Connection from {} ended with error: {}", addr, e);
                }
            });
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), GatewayError> {
        let path = self.options.path.clone();
        let ws = accept_hdr_async(stream, move |req: &Request, res: Response| {
            if req.uri().path() == path {
                Ok(res)
            } else {
                let mut res = ErrorResponse::new(Some("not found".to_string()));
                *res.status_mut() = StatusCode::NOT_FOUND;
                Err(res)
            }
        })
        .await?;

        let (sink, mut source) = ws.split();
        let sink: WsSink = Arc::new(Mutex::new(sink));
        let closed = CancellationToken::new();

        let heartbeat = tokio::spawn(heartbeat(
            sink.clone(),
            closed.clone(),
            self.options.heartbeat,
        ));
        let watcher = tokio::spawn(watch_shutdown(self.shutdown.subscribe(), closed.clone()));

        let mut session = Session::new(
            self.engine.clone(),
            self.pipelines.clone(),
            self.settings.clone(),
        );
        info!("Session({}) opened for {}", session.id(), addr);

        let result = loop {
            let transport = session.transport_closed();
            let next = tokio::select! {
                _ = closed.cancelled() => break Ok(()),
                _ = transport_lost(transport) => {
                    warn!("Session({}) lost its transport, closing {}", session.id(), addr);
                    break Ok(());
                }
                next = source.next() => next,
            };

            let bytes = match next {
                None => break Ok(()),
                Some(Err(e)) => break Err(e.into()),
                Some(Ok(Message::Text(text))) => text.into_bytes(),
                Some(Ok(Message::Binary(data))) => data,
                Some(Ok(Message::Close(_))) => break Ok(()),
                Some(Ok(_)) => continue,
            };

            if let Err(e) = self.dispatch(&bytes, &mut session, &sink).await {
                break Err(e);
            }
        };

        closed.cancel();
        heartbeat.abort();
        watcher.abort();

        tokio::task::block_in_place(|| session.close());
        if let Err(e) = sink.lock().await.close().await {
            debug!("Closing websocket to {} failed: {}", addr, e);
        }
        info!("Connection from {} closed", addr);

        result
    }

    async fn dispatch(
        &self,
        bytes: &[u8],
        session: &mut Session,
        sink: &WsSink,
    ) -> Result<(), GatewayError> {
        let Command::Start { offer, key } = SignalMessage::decode(bytes)?.into_command()?;

        let answer = match tokio::task::block_in_place(|| session.start(&offer, &key)) {
            Ok(answer) => answer,
            Err(e) => {
                // No answer: the peer times out and may retry.
                warn!("Session({}) rejected start: {}", session.id(), e);
                return Ok(());
            }
        };

        let reply = SignalMessage::start_response(answer.into_sdp()).encode()?;
        sink.lock().await.send(Message::Text(reply)).await?;
        info!("Session({}) answered", session.id());
        Ok(())
    }
}

async fn transport_lost(closed: Option<CancellationToken>) {
    match closed {
        Some(closed) => closed.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Pings the peer every `period`; a failed ping closes the connection.
async fn heartbeat<S>(sink: Arc<Mutex<S>>, closed: CancellationToken, period: Duration)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = closed.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = sink.lock().await.send(Message::Ping(vec![])).await {
            warn!("Ping failed, dropping peer: {}", e);
            closed.cancel();
            return;
        }
    }
}

async fn watch_shutdown(mut shutdown: broadcast::Receiver<()>, closed: CancellationToken) {
    tokio::select! {
        _ = closed.cancelled() => {}
        _ = shutdown.recv() => {
            info!("Forced shutdown, closing connection");
            closed.cancel();
        }
    }
}

/// Turns a broken pipe into a forced shutdown of every connection.
#[cfg(unix)]
pub async fn forward_broken_pipe(shutdown: broadcast::Sender<()>) -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut pipe = signal(SignalKind::pipe())?;
    while pipe.recv().await.is_some() {
        warn!("SIGPIPE received");
        if shutdown.send(()).is_err() {
            debug!("No open connections to shut down");
        }
    }
    error!("SIGPIPE listener ended");
    Ok(())
}
