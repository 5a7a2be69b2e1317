//! Lifecycle hook registry.
//!
//! Hooks let the embedding application observe and steer every stage of the
//! proxy. All hook points are optional. They run synchronously, in-line, on
//! the task handling the connection, in this order:
//!
//! | Stage            | Signature                                              |
//! |------------------|--------------------------------------------------------|
//! | `before_start`   | `(&mut ProxyOptions)`                                  |
//! | `after_start`    | `()`                                                   |
//! | `before_connect` | `(&ConnectTarget) -> bool`                             |
//! | `before_request` | `(&RequestHead, &mut ForwardOptions, &mut Responder) -> bool` |
//! | `after_request`  | `(&RequestHead, &mut UpstreamResponse, &mut Responder) -> bool` |
//! | `before_response`| `(&RequestHead, &mut UpstreamResponse, &mut Responder) -> bool` |
//! | `after_response` | `(&RequestHead, &ResponseBody) -> bool`                |
//! | `before_close`   | `()`                                                   |
//! | `after_close`    | `()`                                                   |
//!
//! For `before_connect`, `true` means "intercept this tunnel". For the
//! request hooks, `true` means the hook has taken over the exchange: the
//! engine skips its default action and sends whatever the hook put into the
//! [`Responder`]. The return value of `after_response` is advisory only.
//!
//! # Example
//!
//! ```ignore
//! use fast_proxy::proxy::{Hooks, full_body};
//!
//! let hooks = Hooks::new()
//!     .on_before_connect(|target| target.host.ends_with(".example.com"))
//!     .on_before_request(|_head, options, responder| {
//!         if options.path == "/blocked" {
//!             responder.respond(hyper::Response::new(full_body("nope")));
//!             return true;
//!         }
//!         options.headers.remove("cookie");
//!         false
//!     });
//! ```

use super::body::{ProxyBody, ResponseBody};
use super::server::ProxyOptions;
use hyper::header::{HOST, HeaderMap};
use hyper::http::response::Parts;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use std::fmt;
use std::sync::Arc;

/// Which listener a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    /// Plain HTTP on the proxy port.
    Http,
    /// Decrypted HTTPS from the interception terminator.
    Https,
}

impl Scheme {
    /// Port used when the request names none.
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Host and port named by a CONNECT request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Host name or IP literal (IPv6 without brackets).
    pub host: String,
    /// Target port.
    pub port: u16,
}

impl ConnectTarget {
    /// `https://host:port` form of the target.
    pub fn url(&self) -> String {
        if self.host.contains(':') {
            format!("https://[{}]:{}", self.host, self.port)
        } else {
            format!("https://{}:{}", self.host, self.port)
        }
    }
}

/// Snapshot of an inbound request line and headers.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target as received.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Request headers as received.
    pub headers: HeaderMap,
    /// Listener the request arrived on.
    pub scheme: Scheme,
}

impl RequestHead {
    /// Capture the head of `req`.
    pub fn from_request<B>(req: &Request<B>, scheme: Scheme) -> Self {
        Self {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            scheme,
        }
    }
}

/// Where and how a request is forwarded. Hooks may edit it in place.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardOptions {
    /// Upstream host.
    pub hostname: String,
    /// Path and query sent upstream.
    pub path: String,
    /// Method sent upstream.
    pub method: Method,
    /// Headers sent upstream.
    pub headers: HeaderMap,
    /// Upstream port.
    pub port: u16,
}

impl ForwardOptions {
    /// `Host` header value for these options.
    pub fn authority(&self, scheme: Scheme) -> String {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        if self.port == scheme.default_port() {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Ensure a `Host` header is present, deriving it from the target.
    pub(crate) fn fill_host(&mut self, scheme: Scheme) {
        if !self.headers.contains_key(HOST)
            && let Ok(value) = self.authority(scheme).parse()
        {
            self.headers.insert(HOST, value);
        }
    }
}

/// Upstream response handed to `after_request` and `before_response`.
///
/// Hooks may rewrite the status or headers, or take the body to relay it
/// themselves through the [`Responder`].
pub struct UpstreamResponse {
    parts: Parts,
    body: Option<ProxyBody>,
}

impl UpstreamResponse {
    /// Wrap an upstream response.
    pub fn new(response: Response<ProxyBody>) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            parts,
            body: Some(body),
        }
    }

    /// Response status.
    pub fn status(&self) -> StatusCode {
        self.parts.status
    }

    /// Replace the response status.
    pub fn set_status(&mut self, status: StatusCode) {
        self.parts.status = status;
    }

    /// Response headers.
    pub fn headers(&self) -> &HeaderMap {
        &self.parts.headers
    }

    /// Mutable response headers.
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.parts.headers
    }

    /// Upstream HTTP version.
    pub fn version(&self) -> Version {
        self.parts.version
    }

    /// Take the upstream body. Returns `None` once taken.
    pub fn take_body(&mut self) -> Option<ProxyBody> {
        self.body.take()
    }

    pub(crate) fn into_parts(self) -> (Parts, Option<ProxyBody>) {
        (self.parts, self.body)
    }
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.parts.status)
            .field("headers", &self.parts.headers)
            .field("body_taken", &self.body.is_none())
            .finish()
    }
}

/// Slot through which a hook that takes over a request answers the client.
#[derive(Default)]
pub struct Responder {
    response: Option<Response<ProxyBody>>,
}

impl Responder {
    /// Create an empty responder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Send `response` to the client instead of the default action.
    pub fn respond(&mut self, response: Response<ProxyBody>) {
        self.response = Some(response);
    }

    /// Whether a response has been supplied.
    pub fn has_response(&self) -> bool {
        self.response.is_some()
    }

    pub(crate) fn take(&mut self) -> Option<Response<ProxyBody>> {
        self.response.take()
    }
}

impl fmt::Debug for Responder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Responder")
            .field("has_response", &self.has_response())
            .finish()
    }
}

type StartHook = Arc<dyn Fn(&mut ProxyOptions) + Send + Sync>;
type NotifyHook = Arc<dyn Fn() + Send + Sync>;
type ConnectHook = Arc<dyn Fn(&ConnectTarget) -> bool + Send + Sync>;
type RequestHook =
    Arc<dyn Fn(&RequestHead, &mut ForwardOptions, &mut Responder) -> bool + Send + Sync>;
type ResponseHook =
    Arc<dyn Fn(&RequestHead, &mut UpstreamResponse, &mut Responder) -> bool + Send + Sync>;
type BodyHook = Arc<dyn Fn(&RequestHead, &ResponseBody) -> bool + Send + Sync>;

/// Registered lifecycle hooks.
#[derive(Clone, Default)]
pub struct Hooks {
    before_start: Option<StartHook>,
    after_start: Option<NotifyHook>,
    before_connect: Option<ConnectHook>,
    before_request: Option<RequestHook>,
    after_request: Option<ResponseHook>,
    before_response: Option<ResponseHook>,
    after_response: Option<BodyHook>,
    before_close: Option<NotifyHook>,
    after_close: Option<NotifyHook>,
}

impl Hooks {
    /// Create a registry with no hooks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run before listeners bind; may adjust the options.
    pub fn on_before_start(mut self, f: impl Fn(&mut ProxyOptions) + Send + Sync + 'static) -> Self {
        self.before_start = Some(Arc::new(f));
        self
    }

    /// Run once the listeners are bound.
    pub fn on_after_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_start = Some(Arc::new(f));
        self
    }

    /// Decide per CONNECT whether to intercept (`true`) or pass through.
    pub fn on_before_connect(
        mut self,
        f: impl Fn(&ConnectTarget) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_connect = Some(Arc::new(f));
        self
    }

    /// Inspect or redirect a request before it is forwarded.
    pub fn on_before_request(
        mut self,
        f: impl Fn(&RequestHead, &mut ForwardOptions, &mut Responder) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_request = Some(Arc::new(f));
        self
    }

    /// Inspect the upstream response as soon as its head arrives.
    pub fn on_after_request(
        mut self,
        f: impl Fn(&RequestHead, &mut UpstreamResponse, &mut Responder) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.after_request = Some(Arc::new(f));
        self
    }

    /// Last chance to rewrite the response head before it reaches the client.
    pub fn on_before_response(
        mut self,
        f: impl Fn(&RequestHead, &mut UpstreamResponse, &mut Responder) -> bool
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.before_response = Some(Arc::new(f));
        self
    }

    /// Receive the full response body after it was relayed to the client.
    pub fn on_after_response(
        mut self,
        f: impl Fn(&RequestHead, &ResponseBody) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.after_response = Some(Arc::new(f));
        self
    }

    /// Run before connections and listeners are torn down.
    pub fn on_before_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_close = Some(Arc::new(f));
        self
    }

    /// Run after everything has been torn down.
    pub fn on_after_close(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.after_close = Some(Arc::new(f));
        self
    }

    /// Overlay `other` onto `self`: hooks set in `other` replace ours,
    /// hooks it leaves unset are kept.
    pub fn merge(&mut self, other: Hooks) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        overlay!(
            before_start,
            after_start,
            before_connect,
            before_request,
            after_request,
            before_response,
            after_response,
            before_close,
            after_close
        );
    }

    pub(crate) fn before_start(&self, options: &mut ProxyOptions) {
        if let Some(f) = &self.before_start {
            f(options);
        }
    }

    pub(crate) fn after_start(&self) {
        if let Some(f) = &self.after_start {
            f();
        }
    }

    pub(crate) fn before_connect(&self, target: &ConnectTarget) -> bool {
        self.before_connect.as_ref().is_some_and(|f| f(target))
    }

    pub(crate) fn before_request(
        &self,
        head: &RequestHead,
        options: &mut ForwardOptions,
        responder: &mut Responder,
    ) -> bool {
        self.before_request
            .as_ref()
            .is_some_and(|f| f(head, options, responder))
    }

    pub(crate) fn after_request(
        &self,
        head: &RequestHead,
        upstream: &mut UpstreamResponse,
        responder: &mut Responder,
    ) -> bool {
        self.after_request
            .as_ref()
            .is_some_and(|f| f(head, upstream, responder))
    }

    pub(crate) fn before_response(
        &self,
        head: &RequestHead,
        upstream: &mut UpstreamResponse,
        responder: &mut Responder,
    ) -> bool {
        self.before_response
            .as_ref()
            .is_some_and(|f| f(head, upstream, responder))
    }

    pub(crate) fn after_response(&self, head: &RequestHead, body: &ResponseBody) -> bool {
        self.after_response.as_ref().is_some_and(|f| f(head, body))
    }

    pub(crate) fn before_close(&self) {
        if let Some(f) = &self.before_close {
            f();
        }
    }

    pub(crate) fn after_close(&self) {
        if let Some(f) = &self.after_close {
            f();
        }
    }

    /// Whether any `after_response` hook is registered.
    pub(crate) fn wants_response_body(&self) -> bool {
        self.after_response.is_some()
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("before_start", &self.before_start.is_some())
            .field("after_start", &self.after_start.is_some())
            .field("before_connect", &self.before_connect.is_some())
            .field("before_request", &self.before_request.is_some())
            .field("after_request", &self.after_request.is_some())
            .field("before_response", &self.before_response.is_some())
            .field("after_response", &self.after_response.is_some())
            .field("before_close", &self.before_close.is_some())
            .field("after_close", &self.after_close.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::body::{empty_body, full_body};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn head() -> RequestHead {
        let req = Request::builder()
            .uri("http://example.com/path")
            .body(())
            .unwrap();
        RequestHead::from_request(&req, Scheme::Http)
    }

    fn options() -> ForwardOptions {
        ForwardOptions {
            hostname: "example.com".to_string(),
            path: "/path".to_string(),
            method: Method::GET,
            headers: HeaderMap::new(),
            port: 80,
        }
    }

    #[test]
    fn test_unset_hooks_do_not_take_over() {
        let hooks = Hooks::new();
        let target = ConnectTarget {
            host: "example.com".to_string(),
            port: 443,
        };
        assert!(!hooks.before_connect(&target));
        assert!(!hooks.before_request(&head(), &mut options(), &mut Responder::new()));
        assert!(!hooks.after_response(&head(), &ResponseBody::default()));
    }

    #[test]
    fn test_before_request_redirects_in_place() {
        let hooks = Hooks::new().on_before_request(|_, options, _| {
            options.hostname = "mirror.test".to_string();
            options.port = 8080;
            false
        });

        let mut options = options();
        assert!(!hooks.before_request(&head(), &mut options, &mut Responder::new()));
        assert_eq!(options.hostname, "mirror.test");
        assert_eq!(options.port, 8080);
    }

    #[test]
    fn test_handled_request_supplies_response() {
        let hooks = Hooks::new().on_before_request(|_, _, responder| {
            responder.respond(Response::new(full_body("local")));
            true
        });

        let mut responder = Responder::new();
        assert!(hooks.before_request(&head(), &mut options(), &mut responder));
        assert!(responder.has_response());
    }

    #[test]
    fn test_merge_overrides_only_supplied_hooks() {
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));
        let closed = Arc::new(AtomicUsize::new(0));

        let (f, c) = (first.clone(), closed.clone());
        let mut hooks = Hooks::new()
            .on_after_start(move || {
                f.fetch_add(1, Ordering::SeqCst);
            })
            .on_after_close(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });

        let s = second.clone();
        hooks.merge(Hooks::new().on_after_start(move || {
            s.fetch_add(1, Ordering::SeqCst);
        }));

        hooks.after_start();
        hooks.after_close();
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_upstream_response_editing() {
        let response = Response::builder()
            .status(StatusCode::OK)
            .header("x-upstream", "1")
            .body(empty_body())
            .unwrap();
        let mut upstream = UpstreamResponse::new(response);

        upstream.set_status(StatusCode::ACCEPTED);
        upstream.headers_mut().remove("x-upstream");
        assert_eq!(upstream.status(), StatusCode::ACCEPTED);
        assert!(upstream.headers().is_empty());
        assert!(upstream.take_body().is_some());
        assert!(upstream.take_body().is_none());
    }

    #[test]
    fn test_connect_target_url() {
        let target = ConnectTarget {
            host: "example.com".to_string(),
            port: 443,
        };
        assert_eq!(target.url(), "https://example.com:443");

        let v6 = ConnectTarget {
            host: "::1".to_string(),
            port: 8443,
        };
        assert_eq!(v6.url(), "https://[::1]:8443");
    }

    #[test]
    fn test_forward_options_authority() {
        let mut opts = options();
        assert_eq!(opts.authority(Scheme::Http), "example.com");
        opts.port = 8080;
        assert_eq!(opts.authority(Scheme::Http), "example.com:8080");
        opts.port = 443;
        assert_eq!(opts.authority(Scheme::Https), "example.com");
    }

    #[test]
    fn test_fill_host_keeps_existing_header() {
        let mut opts = options();
        opts.fill_host(Scheme::Http);
        assert_eq!(opts.headers[HOST], "example.com");

        opts.hostname = "other.test".to_string();
        opts.fill_host(Scheme::Http);
        assert_eq!(opts.headers[HOST], "example.com");
    }
}
