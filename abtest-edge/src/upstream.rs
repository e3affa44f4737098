//! Forwarding requests to the origin.
use std::{future::Future, pin::Pin, time::Duration};

use http_body_util::{BodyExt, Full};
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING},
    http::uri::{Authority, Scheme},
    Request, Response, Uri,
};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioTimer},
};
use thiserror::Error;

/// Errors that can occur while forwarding a request to the origin.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The origin address or the forwarded request URI is invalid.
    #[error("invalid upstream uri: {0}")]
    InvalidUri(String),

    /// The request to the origin failed.
    #[error("upstream request failed: {0}")]
    Request(String),

    /// The response body from the origin could not be read.
    #[error("failed to read upstream response body: {0}")]
    Body(String),
}

/// Future returned by [`Upstream::forward`].
pub type UpstreamFuture =
    Pin<Box<dyn Future<Output = Result<Response<Full<Bytes>>, UpstreamError>> + Send + 'static>>;

/// Something that can forward a request and return the response.
pub trait Upstream: Send + Sync {
    /// Forwards `request`, resolving to the response.
    ///
    /// The request URI is in origin form (path and query only); implementations decide where it
    /// is sent.
    fn forward(&self, request: Request<Full<Bytes>>) -> UpstreamFuture;
}

impl<F> Upstream for F
where
    F: Fn(Request<Full<Bytes>>) -> UpstreamFuture + Send + Sync,
{
    fn forward(&self, request: Request<Full<Bytes>>) -> UpstreamFuture {
        self(request)
    }
}

/// Forwards requests to an HTTP origin.
#[derive(Clone)]
pub struct HttpUpstream {
    scheme: Scheme,
    authority: Authority,
    client: Client<HttpConnector, Full<Bytes>>,
}

impl HttpUpstream {
    /// Creates a new `HttpUpstream` sending requests to `origin`.
    ///
    /// Only the scheme and authority of `origin` are used.
    ///
    /// # Errors
    ///
    /// If `origin` has no scheme or authority, or uses a scheme other than `http`, an error is
    /// returned.
    pub fn new(origin: &Uri) -> Result<Self, UpstreamError> {
        let scheme = origin
            .scheme()
            .cloned()
            .ok_or_else(|| UpstreamError::InvalidUri(format!("{origin}: missing scheme")))?;
        if scheme != Scheme::HTTP {
            return Err(UpstreamError::InvalidUri(format!("{origin}: only http is supported")));
        }
        let authority = origin
            .authority()
            .cloned()
            .ok_or_else(|| UpstreamError::InvalidUri(format!("{origin}: missing authority")))?;

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_timer(TokioTimer::new())
            .build(HttpConnector::new());

        Ok(Self { scheme, authority, client })
    }


    fn target_uri(&self, uri: &Uri) -> Result<Uri, UpstreamError> {
        let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| UpstreamError::InvalidUri(e.to_string()))
    }
}

impl Upstream for HttpUpstream {
    fn forward(&self, request: Request<Full<Bytes>>) -> UpstreamFuture {
        let this = self.clone();
        Box::pin(async move {
            let (mut parts, body) = request.into_parts();
            parts.uri = this.target_uri(&parts.uri)?;
            let host = HeaderValue::from_str(this.authority.as_str())
                .map_err(|e| UpstreamError::InvalidUri(e.to_string()))?;
            parts.headers.insert(HOST, host);
            parts.headers.remove(CONNECTION);

            let response = this
                .client
                .request(Request::from_parts(parts, body))
                .await
                .map_err(|e| UpstreamError::Request(e.to_string()))?;

            let (mut parts, body) = response.into_parts();
            let body = body.collect().await.map_err(|e| UpstreamError::Body(e.to_string()))?;
            // The body is re-framed by our own connection.
            parts.headers.remove(TRANSFER_ENCODING);
            parts.headers.remove(CONNECTION);

            Ok(Response::from_parts(parts, Full::new(body.to_bytes())))
        })
    }
}

#[cfg(test)]
mod tests {
    use hyper::Uri;

    use super::{HttpUpstream, UpstreamError};

    #[tokio::test]
    async fn test_target_uri_keeps_path_and_query() {
        let upstream = HttpUpstream::new(&"http://origin.internal:8080".parse().unwrap()).unwrap();

        let uri = upstream.target_uri(&"/abtest/control?ref=home".parse::<Uri>().unwrap()).unwrap();
        assert_eq!(uri, "http://origin.internal:8080/abtest/control?ref=home");

        let uri = upstream.target_uri(&Uri::default()).unwrap();
        assert_eq!(uri, "http://origin.internal:8080/");
    }

    #[tokio::test]
    async fn test_rejects_incomplete_origin() {
        let missing_scheme = HttpUpstream::new(&"/just/a/path".parse().unwrap());
        assert!(matches!(missing_scheme, Err(UpstreamError::InvalidUri(_))));

        let tls = HttpUpstream::new(&"https://origin.internal".parse().unwrap());
        assert!(matches!(tls, Err(UpstreamError::InvalidUri(_))));
    }
}
