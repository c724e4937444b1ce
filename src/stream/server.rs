//! WebSocket listener. Connections are served one at a time against a
//! single shared render invoker.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex as AsyncMutex;
use tokio_tungstenite::tungstenite::Message;

use super::protocol::FrameSink;
use super::render_loop::LoopOptions;
use super::session::Session;
use crate::render::RenderInvoker;
use crate::settings::Settings;
use crate::util::Result;

pub struct Server {
    listener: TcpListener,
    invoker: Arc<AsyncMutex<RenderInvoker>>,
    options: LoopOptions,
    frame_size: (u32, u32),
}

impl Server {
    /// Bind the listening socket described by `settings`.
    pub async fn bind(settings: &Settings, invoker: RenderInvoker) -> Result<Self> {
        settings.validate()?;
        let listener = TcpListener::bind(settings.address()).await?;
        tracing::info!(
            addr = %listener.local_addr()?,
            backend = invoker.backend_name(),
            "listening"
        );
        Ok(Self {
            listener,
            invoker: Arc::new(AsyncMutex::new(invoker)),
            options: settings.loop_options(),
            frame_size: (settings.width, settings.height),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until Ctrl-C.
    pub async fn run(self) -> Result<()> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves. A connection in progress is closed
    /// cleanly before returning.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        loop {
            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(error = %e, "accept failed");
                    continue;
                }
            };

            let served = tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!(%peer, "shutting down with a client connected");
                    break;
                }
                served = self.serve(stream, peer) => served,
            };
            if let Err(e) = served {
                tracing::warn!(%peer, error = %e, "connection ended with error");
            }
        }

        // leave the context released even if a connection was cut short
        self.invoker.lock().await.release();
        tracing::info!("server stopped");
        Ok(())
    }

    #[tracing::instrument(name = "connection", skip_all, fields(%peer))]
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let ws = tokio_tungstenite::accept_async(stream).await?;
        tracing::info!("client connected");
        let (sink, mut incoming) = ws.split();
        let (width, height) = self.frame_size;
        let mut session = Session::new(Arc::clone(&self.invoker), sink, self.options, width, height);

        let mut result = Ok(());
        while let Some(message) = incoming.next().await {
            match message {
                Ok(Message::Text(text)) => dispatch(&mut session, text.as_str()),
                Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                    Ok(text) => dispatch(&mut session, text),
                    Err(_) => tracing::warn!(len = data.len(), "dropping non-UTF-8 binary message"),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    result = Err(e.into());
                    break;
                }
            }
        }

        session.close().await;
        tracing::info!("client disconnected");
        result
    }
}

fn dispatch<S: FrameSink + 'static>(session: &mut Session<S>, text: &str) {
    match session.handle_message(text) {
        Ok(generation) => tracing::debug!(generation, "parameters updated"),
        Err(e) => tracing::warn!(error = %e, "dropping client message"),
    }
}
