//! Path dispatch for the edge service.
use std::{net::IpAddr, sync::Arc, time::Duration};

use http_body_util::Full;
use hyper::{
    body::Bytes,
    header::{HeaderValue, CONTENT_TYPE, LOCATION, SET_COOKIE},
    Request, Response, StatusCode, Uri,
};
use ipnet::IpNet;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::{
    assignment::{ActionOutcome, Group, PageOutcome, Visitor},
    cookies::{SetCookie, ASSIGNMENT_COOKIE, COUNTED_COOKIE, COUNTED_VALUE},
    experiment::Experiment,
    upstream::Upstream,
};

/// Default lifetime of the cookies set by the router.
pub const DEFAULT_COOKIE_MAX_AGE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// The address of the client that sent a request.
///
/// The listener inserts this as a request extension. It is consulted by the result endpoint
/// allowlist.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RemoteAddr(pub IpAddr);

/// What a request path refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    /// The experiment entry point: assign, count, and serve the group page.
    Entry,

    /// A group page requested directly. Forwarded as-is, without assignment or counting.
    Page(Group),

    /// The action endpoint: count once and redirect.
    Action,

    /// The result endpoint: report all four counters as JSON.
    Result,

    /// Anything else, forwarded untouched.
    Passthrough,
}

impl Route {
    /// Classifies a request path.
    ///
    /// The entry point matches exactly (with or without a trailing slash). The other experiment
    /// paths match whole path segments, so `/abtest/action/confirm` is an action but
    /// `/abtest/actions` is not.
    pub fn from_path(path: &str) -> Self {
        match path {
            "/abtest" | "/abtest/" => Route::Entry,
            p if matches_segment(p, "/abtest/action") => Route::Action,
            p if matches_segment(p, "/abtest/result") => Route::Result,
            p if matches_segment(p, Group::Control.page_path()) => Route::Page(Group::Control),
            p if matches_segment(p, Group::Variant.page_path()) => Route::Page(Group::Variant),
            _ => Route::Passthrough,
        }
    }
}

fn matches_segment(path: &str, prefix: &str) -> bool {
    path.strip_prefix(prefix).is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

/// Routes requests through the experiment and on to the origin.
pub struct EdgeRouter {
    experiment: Experiment,
    upstream: Arc<dyn Upstream>,
    cookie_max_age: Duration,
    action_redirect: HeaderValue,
    allowed_addresses: Option<Vec<IpNet>>,
}

impl EdgeRouter {
    /// Creates a new `EdgeRouter`.
    ///
    /// Cookies last for [`DEFAULT_COOKIE_MAX_AGE`], actions redirect to `/`, and the result
    /// endpoint is open to every client.
    pub fn new(experiment: Experiment, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            experiment,
            upstream,
            cookie_max_age: DEFAULT_COOKIE_MAX_AGE,
            action_redirect: HeaderValue::from_static("/"),
            allowed_addresses: None,
        }
    }

    /// Sets the lifetime of the cookies set by this router.
    #[must_use]
    pub fn with_cookie_max_age(mut self, max_age: Duration) -> Self {
        self.cookie_max_age = max_age;
        self
    }

    /// Sets where the action endpoint redirects to.
    #[must_use]
    pub fn with_action_redirect(mut self, location: HeaderValue) -> Self {
        self.action_redirect = location;
        self
    }

    /// Restricts the result endpoint to clients within `addresses`.
    ///
    /// `None` allows every client.
    #[must_use]
    pub fn with_allowed_addresses(mut self, addresses: Option<Vec<IpNet>>) -> Self {
        self.allowed_addresses = addresses;
        self
    }

    /// Gets the experiment this router counts into.
    pub fn experiment(&self) -> &Experiment {
        &self.experiment
    }

    /// Routes a single request, producing the response to send to the client.
    ///
    /// This never fails: counting errors are logged and swallowed, and upstream errors become a
    /// `502 Bad Gateway`.
    pub async fn route(&self, request: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let route = Route::from_path(request.uri().path());
        debug!(method = %request.method(), path = request.uri().path(), ?route, "routing request");

        match route {
            Route::Entry => self.entry(request).await,
            Route::Page(_) | Route::Passthrough => self.forward(request).await,
            Route::Action => self.action(&request).await,
            Route::Result => self.result(&request).await,
        }
    }

    async fn entry(&self, mut request: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let visitor = Visitor::from_headers(request.headers());
        let outcome = self.experiment.page(&visitor).await;

        match rewrite_path(request.uri(), outcome.group().page_path()) {
            Ok(uri) => *request.uri_mut() = uri,
            Err(e) => {
                warn!(error = %e, "failed to rewrite entry request");
                return status_response(StatusCode::BAD_REQUEST);
            }
        }

        let mut response = self.forward(request).await;
        if let PageOutcome::Assigned(group) = outcome {
            self.set_cookie(&mut response, ASSIGNMENT_COOKIE, group.as_str());
        }
        response
    }

    async fn action(&self, request: &Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let visitor = Visitor::from_headers(request.headers());
        let outcome = self.experiment.action(&visitor).await;

        let mut response = status_response(StatusCode::FOUND);
        response.headers_mut().insert(LOCATION, self.action_redirect.clone());
        if let ActionOutcome::Count(_) = outcome {
            self.set_cookie(&mut response, COUNTED_COOKIE, COUNTED_VALUE);
        }
        response
    }

    async fn result(&self, request: &Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        if !self.is_allowed(request) {
            return status_response(StatusCode::FORBIDDEN);
        }

        match self.experiment.results().await {
            Ok(results) => json_response(StatusCode::OK, &results),
            Err(e) => {
                error!(error = %e, "failed to read experiment results");
                let body = ErrorBody { error: e.to_string() };
                json_response(StatusCode::INTERNAL_SERVER_ERROR, &body)
            }
        }
    }

    async fn forward(&self, request: Request<Full<Bytes>>) -> Response<Full<Bytes>> {
        let path = request.uri().path().to_owned();
        match self.upstream.forward(request).await {
            Ok(response) => response,
            Err(e) => {
                error!(%path, error = %e, "failed to forward request upstream");
                status_response(StatusCode::BAD_GATEWAY)
            }
        }
    }

    fn is_allowed(&self, request: &Request<Full<Bytes>>) -> bool {
        let Some(addresses) = &self.allowed_addresses else {
            return true;
        };
        match request.extensions().get::<RemoteAddr>() {
            Some(RemoteAddr(remote)) => addresses.iter().any(|address| address.contains(remote)),
            None => false,
        }
    }

    fn set_cookie(&self, response: &mut Response<Full<Bytes>>, name: &str, value: &str) {
        match SetCookie::new(name, value, self.cookie_max_age).to_header_value() {
            Ok(header) => {
                response.headers_mut().append(SET_COOKIE, header);
            }
            Err(e) => warn!(cookie = name, error = %e, "failed to encode cookie"),
        }
    }
}

fn rewrite_path(uri: &Uri, path: &str) -> Result<Uri, hyper::http::uri::InvalidUri> {
    match uri.query() {
        Some(query) => format!("{path}?{query}").parse(),
        None => path.parse(),
    }
}

fn status_response(status: StatusCode) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::default());
    *response.status_mut() = status;
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            *response.status_mut() = status;
            let content_type = HeaderValue::from_static("application/json");
            response.headers_mut().insert(CONTENT_TYPE, content_type);
            response
        }
        Err(e) => {
            error!(error = %e, "failed to serialize response body");
            status_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
