//! TCP accept loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::conn::serve_connection;
use super::frame::FrameLimits;
use crate::handlers::{Context, Dispatcher};

pub struct Listener {
    listener: TcpListener,
    ctx: Arc<Context>,
    dispatcher: Arc<Dispatcher>,
    limits: FrameLimits,
}

impl Listener {
    pub async fn bind(addr: SocketAddr, ctx: Arc<Context>, limits: FrameLimits) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let dispatcher = Arc::new(Dispatcher::new(ctx.registry.clone()));
        Ok(Self {
            listener,
            ctx,
            dispatcher,
            limits,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` fires. Each connection runs in
    /// its own task and observes the same token.
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            tracing::info!("Listening on {}", addr);
        }
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("set_nodelay failed for {}: {}", peer, e);
                    }
                    tokio::spawn(serve_connection(
                        stream,
                        Some(peer),
                        self.ctx.clone(),
                        self.dispatcher.clone(),
                        self.limits,
                        shutdown.clone(),
                    ));
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
        tracing::info!("Listener stopped");
    }
}
