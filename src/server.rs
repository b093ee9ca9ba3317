//! Listener construction and the serving loop.
//!
//! The address decides the listener: `host:port` binds TCP, `unix:/path`
//! a UNIX socket, and `sd-listen-fd:NAME` adopts a named socket inherited
//! from the service manager. Every WebDAV verb is routed to the front-end
//! through a single fallback route. SIGINT/SIGTERM close the listener and
//! drain in-flight requests.

use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::connect_info::ConnectInfo;
use axum::extract::Request;
use axum::{Extension, Router};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use dav_server::body::Body as DavBody;
use http::Response;
use tokio::signal;
use tracing::info;

use crate::config::Config;
use crate::cors::cors_layer;
use crate::handler::Handler;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("unknown sd-listen-fd address {0:?}")]
    UnknownSocketName(String),
    #[error("socket activation: {0}")]
    Activation(String),
    #[error("TLS is not supported on unix sockets")]
    TlsOverUnix,
}

enum Listener {
    Tcp(StdTcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// Runs the server until a termination signal arrives.
pub async fn serve(config: Config) -> Result<(), ServerError> {
    let handler = Arc::new(Handler::new(&config));

    let mut app = Router::new().fallback(dispatch).layer(Extension(handler));
    if config.cors.enabled {
        app = app.layer(cors_layer(&config.cors));
    }

    match build_listener(&config.address, config.port)? {
        Listener::Tcp(listener) => {
            let address = listener.local_addr()?;
            info!(address = %address, "listening");

            let handle = Handle::new();
            tokio::spawn(shutdown_signal(handle.clone()));
            let service = app.into_make_service_with_connect_info::<SocketAddr>();

            if config.tls {
                let tls = RustlsConfig::from_pem_file(&config.cert, &config.key).await?;
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(handle)
                    .serve(service)
                    .await?;
            } else {
                axum_server::from_tcp(listener)
                    .handle(handle)
                    .serve(service)
                    .await?;
            }
        }
        #[cfg(unix)]
        Listener::Unix(listener) => {
            if config.tls {
                return Err(ServerError::TlsOverUnix);
            }
            info!(address = %config.address, "listening");

            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    wait_for_signal().await;
                    info!("caught signal, shutting down");
                })
                .await?;
        }
    }

    Ok(())
}

// Every method and path reaches the front-end; the remote address rides
// along for logging when the listener provides one.
async fn dispatch(
    Extension(handler): Extension<Arc<Handler>>,
    req: Request,
) -> Response<DavBody> {
    let remote = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    handler.handle(req, remote).await
}

fn build_listener(address: &str, port: u16) -> Result<Listener, ServerError> {
    if let Some(name) = address.strip_prefix("sd-listen-fd:") {
        #[cfg(target_os = "linux")]
        {
            return Ok(Listener::Tcp(systemd_listener(name)?));
        }
        #[cfg(not(target_os = "linux"))]
        {
            let _ = name;
            return Err(ServerError::Activation(
                "socket activation is only supported on linux".to_string(),
            ));
        }
    }

    if let Some(path) = address.strip_prefix("unix:") {
        #[cfg(unix)]
        {
            return Ok(Listener::Unix(tokio::net::UnixListener::bind(path)?));
        }
        #[cfg(not(unix))]
        {
            let _ = path;
            return Err(ServerError::Activation(
                "unix sockets are not supported on this platform".to_string(),
            ));
        }
    }

    let listener = StdTcpListener::bind(format!("{address}:{port}"))?;
    listener.set_nonblocking(true)?;
    Ok(Listener::Tcp(listener))
}

#[cfg(target_os = "linux")]
fn systemd_listener(name: &str) -> Result<StdTcpListener, ServerError> {
    use std::os::fd::{FromRawFd, IntoRawFd};

    let descriptors = libsystemd::activation::receive_descriptors_with_names(false)
        .map_err(|err| ServerError::Activation(err.to_string()))?;

    for (descriptor, descriptor_name) in descriptors {
        if descriptor_name == name {
            // The service manager transferred ownership of this
            // descriptor to us.
            let listener = unsafe { StdTcpListener::from_raw_fd(descriptor.into_raw_fd()) };
            listener.set_nonblocking(true)?;
            return Ok(listener);
        }
    }

    Err(ServerError::UnknownSocketName(name.to_string()))
}

async fn shutdown_signal(handle: Handle) {
    wait_for_signal().await;
    info!("caught signal, shutting down");
    handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
}

async fn wait_for_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
