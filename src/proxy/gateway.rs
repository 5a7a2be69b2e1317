//! Request gateway.
//!
//! Forwards plain HTTP requests, and requests decrypted by the interception
//! terminator, to their target and streams the answer back. Request and
//! response bodies are streamed frame by frame with hyper's flow control;
//! neither is buffered whole.
//!
//! Hooks run in this order for each request:
//!
//! ```text
//! before_request ─► dial + send ─► after_request ─► before_response ─► stream body ─► after_response
//! ```
//!
//! Any of the first three may take over the exchange, in which case the
//! remaining stages are skipped.

use super::body::{ProxyBody, ResponseBody, TeeBody, empty_body};
use super::connect::{dial, parse_host_port};
use super::error::{ProxyError, ProxyResult};
use super::hooks::{ForwardOptions, Hooks, RequestHead, Responder, Scheme, UpstreamResponse};
use super::registry::ConnectionRegistry;
use super::tls::{create_tls_connector, domain_to_server_name};
use http_body_util::BodyExt;
use hyper::body::{Body, Incoming};
use hyper::client::conn::http1;
use hyper::header::{CONTENT_ENCODING, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response, StatusCode, Version};
use hyper_util::rt::TokioIo;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::OnceCell;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

/// Forwards requests upstream and relays responses.
pub struct Gateway {
    hooks: Arc<Hooks>,
    connect_timeout: Duration,
    upstream_tls: OnceCell<TlsConnector>,
}

impl Gateway {
    /// Create a gateway running `hooks`.
    pub fn new(hooks: Arc<Hooks>, connect_timeout: Duration) -> Self {
        Self {
            hooks,
            connect_timeout,
            upstream_tls: OnceCell::new(),
        }
    }

    /// Forward one request. Upstream connections are tracked in `registry`.
    pub async fn handle(
        &self,
        req: Request<Incoming>,
        scheme: Scheme,
        registry: &Arc<ConnectionRegistry>,
    ) -> ProxyResult<Response<ProxyBody>> {
        let head = RequestHead::from_request(&req, scheme);
        let mut options = match forward_options(&head) {
            Ok(options) => options,
            Err(e) => {
                debug!("Rejecting request: {}", e);
                return Ok(status_response(StatusCode::BAD_REQUEST));
            }
        };

        let mut responder = Responder::new();
        if self.hooks.before_request(&head, &mut options, &mut responder) {
            return responder
                .take()
                .ok_or(ProxyError::Unanswered("before_request"));
        }
        options.fill_host(scheme);

        trace!(
            "Forwarding {} {}:{}{}",
            options.method, options.hostname, options.port, options.path
        );

        let outbound = outbound_request(&options, req.into_body())?;
        let stream = dial(&options.hostname, options.port, self.connect_timeout).await?;
        let response = match scheme {
            Scheme::Http => send(stream, outbound, registry).await?,
            Scheme::Https => {
                let connector = self
                    .upstream_tls
                    .get_or_try_init(|| async { create_tls_connector() })
                    .await?;
                let server_name = domain_to_server_name(&options.hostname)?;
                let tls = connector.connect(server_name, stream).await.map_err(|e| {
                    warn!("Upstream TLS handshake with {} failed: {}", options.hostname, e);
                    ProxyError::Tls(format!("Upstream TLS handshake failed: {}", e))
                })?;
                send(tls, outbound, registry).await?
            }
        };

        let mut upstream = UpstreamResponse::new(response.map(|body| body.boxed()));
        if self.hooks.after_request(&head, &mut upstream, &mut responder) {
            return responder
                .take()
                .ok_or(ProxyError::Unanswered("after_request"));
        }
        if self.hooks.before_response(&head, &mut upstream, &mut responder) {
            return responder
                .take()
                .ok_or(ProxyError::Unanswered("before_response"));
        }

        let (mut parts, body) = upstream.into_parts();
        let body = match body {
            Some(body) => body,
            None => {
                // The upstream framing no longer describes what we send.
                parts.headers.remove(CONTENT_LENGTH);
                parts.headers.remove(TRANSFER_ENCODING);
                empty_body()
            }
        };
        if !self.hooks.wants_response_body() {
            return Ok(Response::from_parts(parts, body));
        }

        let encoding = parts
            .headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let hooks = Arc::clone(&self.hooks);
        let tee = TeeBody::new(body, encoding, move |collected: ResponseBody| {
            hooks.after_response(&head, &collected);
        });

        Ok(Response::from_parts(parts, tee.boxed()))
    }
}

/// Resolve the forwarding target of a request.
///
/// Absolute-form requests name the target in the URI; origin-form requests
/// (and everything decrypted by the terminator) carry it in `Host`. An
/// explicit port wins, otherwise the listener's default applies.
pub(crate) fn forward_options(head: &RequestHead) -> ProxyResult<ForwardOptions> {
    let default_port = head.scheme.default_port();
    let (hostname, port) = match head.uri.authority() {
        Some(authority) => parse_host_port(authority.as_str(), default_port)?,
        None => {
            let host = head
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .ok_or_else(|| ProxyError::InvalidTarget(format!("No host for {}", head.uri)))?;
            parse_host_port(host, default_port)?
        }
    };

    if hostname.is_empty() {
        return Err(ProxyError::InvalidTarget(format!("Empty host for {}", head.uri)));
    }

    let path = head
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .filter(|pq| !pq.is_empty())
        .unwrap_or("/")
        .to_string();

    let mut headers = head.headers.clone();
    headers.remove("proxy-connection");

    Ok(ForwardOptions {
        hostname,
        path,
        method: head.method.clone(),
        headers,
        port,
    })
}

fn outbound_request(options: &ForwardOptions, body: Incoming) -> ProxyResult<Request<Incoming>> {
    let mut outbound = Request::new(body);
    *outbound.method_mut() = options.method.clone();
    *outbound.uri_mut() = options
        .path
        .parse()
        .map_err(|e| ProxyError::InvalidTarget(format!("Invalid path '{}': {}", options.path, e)))?;
    *outbound.version_mut() = Version::HTTP_11;
    *outbound.headers_mut() = options.headers.clone();
    Ok(outbound)
}

/// Run an HTTP/1.1 exchange over `io`. The connection driver is tracked in
/// `registry` so it dies with the listener.
async fn send<I, B>(
    io: I,
    req: Request<B>,
    registry: &Arc<ConnectionRegistry>,
) -> ProxyResult<Response<Incoming>>
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    B: Body + Send + 'static,
    B::Data: Send,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let (mut sender, conn) = http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(io))
        .await?;

    let tracked = registry.track(async move {
        if let Err(e) = conn.await {
            debug!("Upstream connection ended: {}", e);
        }
    });
    if !tracked {
        return Err(ProxyError::UpgradeFailed("proxy is closing".into()));
    }

    Ok(sender.send_request(req).await?)
}

fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    response
}
