use std::{
    future::Future,
    net::{IpAddr, SocketAddr},
    pin::Pin,
    sync::Arc,
};

use http_body_util::{BodyExt, Full};
use hyper::{
    body::{Bytes, Incoming},
    server::conn::http1::Builder as HyperHttpBuilder,
    service::service_fn,
    Request, Response, StatusCode,
};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::{
    builder::BuildError,
    router::{EdgeRouter, RemoteAddr},
};

/// Convenience type for the future that runs the edge server.
pub type ServerFuture = Pin<Box<dyn Future<Output = Result<(), ServerError>> + Send + 'static>>;

/// Errors that stop the edge server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The bound listener could not be registered with the runtime.
    #[error("failed to register listener with the runtime: {0}")]
    Listener(#[from] std::io::Error),
}

struct EdgeServer {
    router: Arc<EdgeRouter>,
}

impl EdgeServer {
    async fn serve(&self, listener: std::net::TcpListener) -> Result<(), ServerError> {
        let listener = TcpListener::from_std(listener)?;
        if let Ok(local) = listener.local_addr() {
            info!(address = %local, "edge listener started");
        }

        loop {
            let stream = match listener.accept().await {
                Ok((stream, _)) => stream,
                Err(e) => {
                    warn!("Error accepting connection. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            let remote_addr = match stream.peer_addr() {
                Ok(remote_address) => remote_address.ip(),
                Err(e) => {
                    warn!("Error obtaining remote address. Ignoring request. Error: {:?}", e);
                    continue;
                }
            };

            self.process_stream(stream, remote_addr);
        }
    }

    fn process_stream(&self, stream: TcpStream, remote_address: IpAddr) {
        let router = self.router.clone();
        let service = service_fn(move |req: Request<Incoming>| {
            let router = router.clone();
            async move {
                let response = Self::handle_http_request(&router, remote_address, req).await;
                Ok::<_, hyper::Error>(response)
            }
        });

        tokio::task::spawn(async move {
            if let Err(err) =
                HyperHttpBuilder::new().serve_connection(TokioIo::new(stream), service).await
            {
                warn!("Error serving connection. Error: {:?}", err);
            };
        });
    }

    async fn handle_http_request(
        router: &EdgeRouter,
        remote_address: IpAddr,
        req: Request<Incoming>,
    ) -> Response<Full<Bytes>> {
        let (mut parts, body) = req.into_parts();
        let body = match body.collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                debug!(remote = %remote_address, error = %e, "failed to read request body");
                return Self::new_bad_request_response();
            }
        };

        parts.extensions.insert(RemoteAddr(remote_address));
        router.route(Request::from_parts(parts, Full::new(body))).await
    }

    fn new_bad_request_response() -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::<Bytes>::default());
        *response.status_mut() = StatusCode::BAD_REQUEST;
        response
    }
}

/// Creates a `ServerFuture` that serves `router` over HTTP/1 on `listen_address`.
///
/// # Errors
/// Will return Err if it cannot bind to the listen address
pub(crate) fn new_http_listener(
    router: Arc<EdgeRouter>,
    listen_address: SocketAddr,
) -> Result<ServerFuture, BuildError> {
    let listener = std::net::TcpListener::bind(listen_address)
        .and_then(|listener| {
            listener.set_nonblocking(true)?;
            Ok(listener)
        })
        .map_err(|e| BuildError::FailedToCreateHTTPListener(e.to_string()))?;

    let server = EdgeServer { router };

    Ok(Box::pin(async move { server.serve(listener).await }))
}
