use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::PathBuf,
    sync::Arc,
    thread,
    time::Duration,
};

use abtest_store::{
    CounterRegistry, CounterStorage, FileStorage, MemoryStorage, DEFAULT_STORAGE_TIMEOUT,
};
use hyper::{header::HeaderValue, Uri};
use ipnet::IpNet;
use thiserror::Error;
use tracing::info;

use crate::{
    assignment::{GroupSource, ThreadRngSource},
    experiment::Experiment,
    listener::{new_http_listener, ServerFuture},
    router::{EdgeRouter, DEFAULT_COOKIE_MAX_AGE},
    upstream::{HttpUpstream, Upstream},
};

/// Default address the edge listens on.
pub const DEFAULT_LISTEN_ADDRESS: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0)), 8787);

/// Errors that could occur while building or installing the edge service.
#[derive(Debug, Error)]
pub enum BuildError {
    /// No upstream origin was configured.
    #[error("no upstream origin configured")]
    MissingUpstream,

    /// The upstream origin could not be parsed or is unsupported.
    #[error("invalid upstream origin: {0}")]
    InvalidUpstream(String),

    /// The action redirect target is not a valid location.
    #[error("invalid action redirect: {0}")]
    InvalidActionRedirect(String),

    /// The given address could not be parsed as an IP address or subnet.
    #[error("invalid allowlist address: {0}")]
    InvalidAllowlistAddress(String),

    /// Binding the HTTP listener did not succeed.
    #[error("failed to create HTTP listener: {0}")]
    FailedToCreateHTTPListener(String),

    /// The counter storage could not be opened.
    #[error("failed to open counter storage: {0}")]
    FailedToOpenStorage(String),

    /// Creating the background runtime or its thread did not succeed.
    #[error("failed to create Tokio runtime: {0}")]
    FailedToCreateRuntime(String),
}

enum StorageConfig {
    InMemory,
    Path(PathBuf),
}

/// Builder for creating and installing the A/B-testing edge service.
pub struct EdgeBuilder {
    listen_address: SocketAddr,
    upstream: Option<Arc<dyn Upstream>>,
    storage: StorageConfig,
    write_timeout: Duration,
    cookie_max_age: Duration,
    action_redirect: HeaderValue,
    allowed_addresses: Option<Vec<IpNet>>,
    group_source: Arc<dyn GroupSource>,
}

impl EdgeBuilder {
    /// Creates a new [`EdgeBuilder`].
    pub fn new() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS,
            upstream: None,
            storage: StorageConfig::InMemory,
            write_timeout: DEFAULT_STORAGE_TIMEOUT,
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
            action_redirect: HeaderValue::from_static("/"),
            allowed_addresses: None,
            group_source: Arc::new(ThreadRngSource),
        }
    }

    /// Sets the address the HTTP listener binds to.
    ///
    /// Defaults to `0.0.0.0:8787`.
    #[must_use]
    pub fn with_http_listener(mut self, addr: impl Into<SocketAddr>) -> Self {
        self.listen_address = addr.into();
        self
    }

    /// Sets the origin that pages and pass-through requests are forwarded to.
    ///
    /// Only plain `http` origins are supported, e.g. `http://127.0.0.1:8080`.
    ///
    /// ## Errors
    ///
    /// If the given origin cannot be parsed into a valid URI, or is missing a scheme or host, an
    /// error variant will be returned describing the error.
    pub fn with_upstream<T>(mut self, origin: T) -> Result<Self, BuildError>
    where
        T: AsRef<str>,
    {
        let origin = Uri::try_from(origin.as_ref())
            .map_err(|e| BuildError::InvalidUpstream(e.to_string()))?;
        let upstream =
            HttpUpstream::new(&origin).map_err(|e| BuildError::InvalidUpstream(e.to_string()))?;
        self.upstream = Some(Arc::new(upstream));

        Ok(self)
    }

    /// Sets a custom upstream to forward requests to.
    ///
    /// Replaces any origin set earlier with [`with_upstream`][Self::with_upstream].
    #[must_use]
    pub fn with_upstream_service<U>(mut self, upstream: U) -> Self
    where
        U: Upstream + 'static,
    {
        self.upstream = Some(Arc::new(upstream));
        self
    }

    /// Persists counters as files under `path`.
    ///
    /// The directory is created if it does not exist.
    ///
    /// Defaults to in-memory storage, which does not survive a restart.
    #[must_use]
    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage = StorageConfig::Path(path.into());
        self
    }

    /// Keeps counters in memory only.
    #[must_use]
    pub fn with_in_memory_storage(mut self) -> Self {
        self.storage = StorageConfig::InMemory;
        self
    }

    /// Sets the bound on how long a single counter read or write may take before it is abandoned.
    ///
    /// Defaults to 5 seconds.
    #[must_use]
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Sets the lifetime of the assignment and dedup cookies.
    ///
    /// Defaults to 365 days.
    #[must_use]
    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Sets where the action endpoint redirects visitors to.
    ///
    /// Defaults to `/`.
    ///
    /// ## Errors
    ///
    /// If the location is not a valid URI reference, or cannot be used as a header value, an
    /// error variant will be returned describing the error.
    pub fn with_action_redirect<T>(mut self, location: T) -> Result<Self, BuildError>
    where
        T: AsRef<str>,
    {
        let location = location.as_ref();
        Uri::try_from(location).map_err(|e| BuildError::InvalidActionRedirect(e.to_string()))?;
        self.action_redirect = HeaderValue::from_str(location)
            .map_err(|e| BuildError::InvalidActionRedirect(e.to_string()))?;

        Ok(self)
    }

    /// Adds an IP address or subnet to the allowlist for the result endpoint.
    ///
    /// If an allowlist is configured, only clients with an IP address within it may read the
    /// experiment results. Everyone else receives `403 Forbidden`.
    ///
    /// Defaults to allowing every client.
    ///
    /// ## Errors
    ///
    /// If the given address cannot be parsed into an IP address or subnet, an error variant will be
    /// returned describing the error.
    pub fn add_allowed_address<A>(mut self, address: A) -> Result<Self, BuildError>
    where
        A: AsRef<str>,
    {
        let address = parse_allowed_address(address.as_ref())?;
        self.allowed_addresses.get_or_insert(vec![]).push(address);

        Ok(self)
    }

    /// Sets how newly-arrived visitors are assigned to a group.
    ///
    /// Defaults to an even split using the thread-local random number generator.
    #[must_use]
    pub fn with_group_source<G>(mut self, source: G) -> Self
    where
        G: GroupSource + 'static,
    {
        self.group_source = Arc::new(source);
        self
    }

    /// Builds the router without starting a listener.
    ///
    /// ## Errors
    ///
    /// If no upstream is configured, or the counter storage cannot be opened, an error variant
    /// will be returned describing the error.
    pub fn build_router(self) -> Result<EdgeRouter, BuildError> {
        let upstream = self.upstream.ok_or(BuildError::MissingUpstream)?;

        let storage: Arc<dyn CounterStorage> = match self.storage {
            StorageConfig::InMemory => Arc::new(MemoryStorage::new()),
            StorageConfig::Path(path) => {
                let storage = FileStorage::open(&path)
                    .map_err(|e| BuildError::FailedToOpenStorage(e.to_string()))?;
                info!(path = %path.display(), "persisting counters to disk");
                Arc::new(storage)
            }
        };

        let registry = CounterRegistry::new(storage).with_storage_timeout(self.write_timeout);
        let experiment = Experiment::new(registry, self.group_source);

        Ok(EdgeRouter::new(experiment, upstream)
            .with_cookie_max_age(self.cookie_max_age)
            .with_action_redirect(self.action_redirect)
            .with_allowed_addresses(self.allowed_addresses))
    }

    /// Builds the router and the HTTP listener and returns them both.
    ///
    /// In most cases, users should prefer to use [`install`][EdgeBuilder::install] to start the
    /// listener automatically. If the caller needs to schedule the server in a particular way,
    /// this method, or [`build_router`][EdgeBuilder::build_router], should be used.
    ///
    /// The listener is bound immediately; the returned future must be polled on a Tokio runtime.
    ///
    /// ## Errors
    ///
    /// If there is an error while building the router or binding the listener, an error variant
    /// will be returned describing the error.
    pub fn build(self) -> Result<(Arc<EdgeRouter>, ServerFuture), BuildError> {
        let listen_address = self.listen_address;
        let router = Arc::new(self.build_router()?);
        let server = new_http_listener(router.clone(), listen_address)?;

        Ok((router, server))
    }

    /// Builds the router and the HTTP listener, and starts serving in the background.
    ///
    /// If called from within a Tokio runtime, the server is spawned onto it. Otherwise, a new
    /// single-threaded runtime is created on a background thread and the server runs there.
    ///
    /// ## Errors
    ///
    /// If there is an error while building the router, binding the listener, or creating the
    /// background runtime, an error variant will be returned describing the error.
    pub fn install(self) -> Result<Arc<EdgeRouter>, BuildError> {
        use tokio::runtime;

        let router = if let Ok(handle) = runtime::Handle::try_current() {
            let (router, server) = {
                let _g = handle.enter();
                self.build()?
            };

            handle.spawn(server);

            router
        } else {
            let runtime = runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            let (router, server) = {
                let _g = runtime.enter();
                self.build()?
            };

            thread::Builder::new()
                .name("abtest-edge-http-listener".to_owned())
                .spawn(move || runtime.block_on(server))
                .map_err(|e| BuildError::FailedToCreateRuntime(e.to_string()))?;

            router
        };

        Ok(router)
    }
}

impl Default for EdgeBuilder {
    fn default() -> Self {
        EdgeBuilder::new()
    }
}

fn parse_allowed_address(address: &str) -> Result<IpNet, BuildError> {
    // Bare addresses are accepted as single-host networks.
    address
        .parse::<IpNet>()
        .or_else(|_| address.parse::<IpAddr>().map(IpNet::from))
        .map_err(|e| BuildError::InvalidAllowlistAddress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use std::{
        net::{IpAddr, SocketAddr},
        sync::Arc,
        time::Duration,
    };

    use http_body_util::{BodyExt, Empty, Full};
    use hyper::{
        body::Bytes,
        header::{COOKIE, LOCATION, SET_COOKIE},
        Request, Response, StatusCode, Uri,
    };
    use hyper_util::{
        client::legacy::{connect::HttpConnector, Client},
        rt::TokioExecutor,
    };

    use crate::{
        assignment::{FixedSource, Group, Visitor},
        router::RemoteAddr,
        upstream::UpstreamFuture,
    };

    use super::{parse_allowed_address, BuildError, EdgeBuilder};

    fn echo_path(request: Request<Full<Bytes>>) -> UpstreamFuture {
        let target = request.uri().to_string();
        Box::pin(async move { Ok(Response::new(Full::new(Bytes::from(target)))) })
    }

    fn get(path: &str) -> Request<Full<Bytes>> {
        Request::get(path).body(Full::default()).unwrap()
    }

    fn available_address() -> SocketAddr {
        let listener = std::net::TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0))).unwrap();
        listener.local_addr().unwrap()
    }

    async fn read_result(address: SocketAddr) -> (StatusCode, String) {
        let client = Client::builder(TokioExecutor::new()).build(HttpConnector::new());
        let uri = format!("http://{address}/abtest/result").parse::<Uri>().unwrap();
        let request = Request::get(uri).body(Empty::<Bytes>::new()).unwrap();

        let response = client.request(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[test]
    fn test_missing_upstream() {
        let result = EdgeBuilder::new().build_router();
        assert!(matches!(result, Err(BuildError::MissingUpstream)));
    }

    #[test]
    fn test_invalid_configuration() {
        let cases = vec!["", "not a uri", "/relative/only", "https://tls.example.com"];
        for origin in cases {
            let result = EdgeBuilder::new().with_upstream(origin);
            assert!(matches!(result, Err(BuildError::InvalidUpstream(_))), "origin {origin:?}");
        }

        let result = EdgeBuilder::new().with_action_redirect("/thanks\n");
        assert!(matches!(result, Err(BuildError::InvalidActionRedirect(_))));

        let result = EdgeBuilder::new().add_allowed_address("10.0.0.0/33");
        assert!(matches!(result, Err(BuildError::InvalidAllowlistAddress(_))));
    }

    #[test]
    fn test_parse_allowed_address() {
        let cases = vec![
            ("10.0.0.0/8", "10.20.30.40", true),
            ("10.0.0.0/8", "11.0.0.1", false),
            ("127.0.0.1", "127.0.0.1", true),
            ("127.0.0.1", "127.0.0.2", false),
            ("::1", "::1", true),
            ("fd00::/8", "fd12::1", true),
        ];

        for (allowed, remote, expected) in cases {
            let net = parse_allowed_address(allowed).unwrap();
            let remote = remote.parse::<IpAddr>().unwrap();
            assert_eq!(net.contains(&remote), expected, "{allowed} contains {remote}");
        }
    }

    #[tokio::test]
    async fn test_valid_upstream() {
        let builder = EdgeBuilder::new().with_upstream("http://127.0.0.1:8080").unwrap();
        assert!(builder.build_router().is_ok());
    }

    #[tokio::test]
    async fn test_builder_settings_reach_router() {
        let router = EdgeBuilder::new()
            .with_upstream_service(echo_path)
            .with_group_source(FixedSource(Group::Control))
            .with_cookie_max_age(Duration::from_secs(3_600))
            .with_action_redirect("https://example.com/thanks")
            .unwrap()
            .add_allowed_address("127.0.0.1")
            .unwrap()
            .build_router()
            .unwrap();

        let response = router.route(get("/abtest")).await;
        assert_eq!(
            response.headers().get(SET_COOKIE).unwrap(),
            "cloudflare_ab_test=control; Path=/; Max-Age=3600"
        );

        let mut action = get("/abtest/action");
        action.headers_mut().insert(COOKIE, "cloudflare_ab_test=control".parse().unwrap());
        let response = router.route(action).await;
        assert_eq!(response.headers().get(LOCATION).unwrap(), "https://example.com/thanks");

        let response = router.route(get("/abtest/result")).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let mut local = get("/abtest/result");
        local.extensions_mut().insert(RemoteAddr(IpAddr::from([127, 0, 0, 1])));
        assert_eq!(router.route(local).await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_file_storage_survives_rebuild() {
        let dir = tempfile::tempdir().unwrap();

        for expected in 1..=3 {
            let router = EdgeBuilder::new()
                .with_upstream_service(echo_path)
                .with_group_source(FixedSource(Group::Variant))
                .with_storage_path(dir.path())
                .build_router()
                .unwrap();

            router.route(get("/abtest")).await;
            let results = router.experiment().results().await.unwrap();
            assert_eq!(results.variant_show, expected);
        }
    }

    #[tokio::test]
    async fn test_build_binds_listener() {
        let address = SocketAddr::from(([127, 0, 0, 1], 0));
        let (router, server) = EdgeBuilder::new()
            .with_http_listener(address)
            .with_upstream_service(echo_path)
            .build()
            .unwrap();

        assert_eq!(Arc::strong_count(&router), 2);
        drop(server);
        assert_eq!(Arc::strong_count(&router), 1);
    }

    #[tokio::test]
    async fn test_install_inside_runtime() {
        let address = available_address();
        let router = EdgeBuilder::new()
            .with_http_listener(address)
            .with_upstream_service(echo_path)
            .with_group_source(FixedSource(Group::Control))
            .install()
            .unwrap();
        router.experiment().page(&Visitor::default()).await;

        let (status, body) = read_result(address).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            r#"{"controlShow":1,"controlAction":0,"variantShow":0,"variantAction":0}"#
        );
    }

    #[test]
    fn test_install_without_runtime() {
        let address = available_address();
        let router = EdgeBuilder::new()
            .with_http_listener(address)
            .with_upstream_service(echo_path)
            .install()
            .unwrap();

        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        runtime.block_on(async {
            router.experiment().action(&Visitor::new(Some(Group::Variant), false)).await;

            let (status, body) = read_result(address).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(
                body,
                r#"{"controlShow":0,"controlAction":0,"variantShow":0,"variantAction":1}"#
            );
        });
    }
}
