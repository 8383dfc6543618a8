use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tracing::info;

use crate::buffer::BufferPool;
use crate::config::{Backend, Config};
use crate::server::{echo::EchoSession, handshake};
use crate::stream::Upgrader;
use crate::transport::{ChannelTransport, PipelineTransport, TransportAdapter};

pub async fn run(cfg: &Config) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&cfg.server.listen_addr).await?;
    info!("Listening on {}", cfg.server.listen_addr);

    let upgrader = Upgrader::new(cfg.stream.clone(), BufferPool::new());

    loop {
        let (socket, peer) = listener.accept().await?;
        info!("Accepted connection from {}", peer);

        let upgrader = upgrader.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(socket, upgrader).await {
                tracing::error!("Connection error from {}: {}", peer, e);
            }
        });
    }
}

/// Answer the upgrade on `socket` and echo the upgraded stream
pub async fn serve(mut socket: TcpStream, upgrader: Upgrader) -> anyhow::Result<()> {
    let Some(request) = handshake::accept(&mut socket).await? else {
        return Ok(());
    };

    let settings = upgrader.settings();
    info!(protocol = %request.protocol, path = %request.path, backend = ?settings.backend, "Switching protocols");

    let transport: Arc<dyn TransportAdapter> = match settings.backend {
        Backend::Pipeline => Arc::new(PipelineTransport::new(
            socket,
            Handle::current(),
            settings.probe_wait(),
        )),
        Backend::Channel => {
            Arc::new(ChannelTransport::new(socket.into_std()?)?)
        }
    };

    let conn = upgrader.acquire(transport);
    tokio::task::spawn_blocking(move || EchoSession::start(conn)).await??;
    Ok(())
}
