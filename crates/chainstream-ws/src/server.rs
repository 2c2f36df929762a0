//! WebSocket accept loop and per-connection tasks.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chainstream_core::{ConnectionId, QueryExecutor, StreamConfig, StreamEngine, StreamError};

use crate::outbound::{Outgoing, WsOutbound};
use crate::protocol::{parse_inbound, Inbound};

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Engine(#[from] StreamError),
}

/// A [`StreamEngine`] wired to WebSocket clients.
pub struct WsServer {
    engine: Arc<StreamEngine>,
    outbound: Arc<WsOutbound>,
}

impl WsServer {
    pub fn new(config: StreamConfig, executor: Arc<dyn QueryExecutor>) -> Result<Self, ServerError> {
        let outbound = Arc::new(WsOutbound::new());
        let engine = StreamEngine::new(config, executor, outbound.clone())?;
        Ok(Self { engine, outbound })
    }

    pub fn engine(&self) -> &Arc<StreamEngine> {
        &self.engine
    }

    pub fn outbound(&self) -> &Arc<WsOutbound> {
        &self.outbound
    }

    pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
        TcpListener::bind(addr).await.map_err(|source| ServerError::Bind { addr, source })
    }

    /// Accept connections until `shutdown` resolves, then close every open
    /// connection.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "WebSocket server listening");
        }
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let engine = Arc::clone(&self.engine);
                        let outbound = Arc::clone(&self.outbound);
                        tokio::spawn(handle_connection(stream, peer, engine, outbound));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
            }
        }

        info!(open = self.outbound.connection_count(), "WebSocket server shutting down");
        self.outbound.close_all();
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    engine: Arc<StreamEngine>,
    outbound: Arc<WsOutbound>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!(%peer, error = %e, "WebSocket handshake failed");
            return;
        }
    };

    let connection = ConnectionId::from(Uuid::new_v4().to_string());
    info!(connection = %connection, %peer, "connection opened");
    let rx = outbound.register(connection.clone());

    run_connection(ws, &connection, &engine, rx).await;

    engine.disconnect(&connection);
    outbound.unregister(&connection);
    info!(connection = %connection, %peer, "connection closed");
}

async fn run_connection<S>(
    ws: tokio_tungstenite::WebSocketStream<S>,
    connection: &ConnectionId,
    engine: &StreamEngine,
    mut rx: mpsc::Receiver<Outgoing>,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = ws.split();

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => match parse_inbound(&text) {
                    Inbound::Subscribe(payload) => {
                        // Rejections are reported to the client by the engine.
                        let _ = engine.subscribe(connection, &payload);
                    }
                    Inbound::Ignored(event) => {
                        debug!(connection = %connection, %event, "ignoring event");
                    }
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(connection = %connection, error = %e, "WebSocket receive error");
                    break;
                }
                Some(Ok(_)) => {}
            },
            outgoing = rx.recv() => match outgoing {
                Some(Outgoing::Text(text)) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(Outgoing::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
        }
    }
}
