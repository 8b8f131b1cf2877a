use std::net::SocketAddr;
use tokio::net::{lookup_host, TcpListener, TcpSocket, TcpStream};
use tokio::signal;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::EnvFilter;

use crate::codec::RequestCodec;
use crate::commands;
use crate::config::Config;
use crate::connection::Connection;
use crate::store::Store;
use crate::Error;

pub async fn run(config: Config) -> Result<(), Error> {
    init_tracing(&config.log_level);

    let listener = bind(&config).await?;
    let store = Store::new();

    info!("Redis server listening on {}", listener.local_addr()?);

    tokio::select! {
        res = serve(listener, store, RequestCodec::new(config.max_frame_size)) => res,
        _ = signal::ctrl_c() => {
            info!("Shutting down");
            Ok(())
        }
    }
}

/// Creates the listening socket, honouring the configured backlog.
pub async fn bind(config: &Config) -> Result<TcpListener, Error> {
    let addr = lookup_host((config.host.as_str(), config.port))
        .await?
        .next()
        .ok_or_else(|| format!("could not resolve {}", config.host))?;

    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;

    Ok(socket.listen(config.backlog)?)
}

/// Accepts connections forever, each one served by its own task over the shared store.
pub async fn serve(listener: TcpListener, store: Store, codec: RequestCodec) -> Result<(), Error> {
    loop {
        let (socket, client_address) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                // Usually running out of file descriptors, the listener itself is fine.
                error!("Failed to accept connection: {}", e);
                continue;
            }
        };
        let store = store.clone();
        let codec = codec.clone();
        info!("Accepted connection from {:?}", client_address);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(socket, client_address, store, codec).await {
                warn!("Connection terminated: {}", e);
            }
        });
    }
}

#[instrument(
    name = "connection",
    skip(stream, store, codec),
    fields(connection_id, client_address)
)]
async fn handle_connection(
    stream: TcpStream,
    client_address: SocketAddr,
    store: Store,
    codec: RequestCodec,
) -> Result<(), Error> {
    stream.set_nodelay(true)?;
    let mut conn = Connection::with_codec(stream, codec);

    tracing::Span::current()
        .record("connection_id", conn.id.to_string())
        .record("client_address", client_address.to_string());

    while let Some(request) = conn.read_request().await? {
        debug!("Received request from client: {:?}", request);
        let res = commands::dispatch(request, &store);
        debug!("Sending response to client: {}", res);

        conn.write_frame(res).await?;
    }

    info!("Connection closed");
    Ok(())
}

fn init_tracing(log_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .try_init()
        .map_err(|e| debug!("Failed to initialize global tracing: {}", e));
}
