//! Response body plumbing.
//!
//! [`TeeBody`] forwards upstream frames to the client unchanged while
//! keeping a copy of every data chunk. Once the upstream body is exhausted
//! it hands the concatenated bytes to a completion callback, exactly once.

use bytes::{Bytes, BytesMut};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Body, Frame, SizeHint};
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Body type used for every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Create an empty response body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

/// Create a response body with content.
pub fn full_body(content: impl Into<Bytes>) -> ProxyBody {
    Full::new(content.into())
        .map_err(|never| match never {})
        .boxed()
}

/// Buffered response body handed to `afterResponse`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponseBody {
    /// All data chunks of the response, concatenated.
    pub chunks: Bytes,
    /// Upstream `Content-Encoding` header, or empty.
    pub encoding: String,
}

type Completion = Box<dyn FnOnce(ResponseBody) + Send + Sync>;

/// Streaming body that records what it relays.
pub struct TeeBody {
    inner: ProxyBody,
    collected: BytesMut,
    encoding: String,
    on_complete: Option<Completion>,
}

impl TeeBody {
    /// Wrap `inner`, calling `on_complete` once it has been fully relayed.
    pub fn new(
        inner: ProxyBody,
        encoding: impl Into<String>,
        on_complete: impl FnOnce(ResponseBody) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner,
            collected: BytesMut::new(),
            encoding: encoding.into(),
            on_complete: Some(Box::new(on_complete)),
        }
    }

    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(ResponseBody {
                chunks: std::mem::take(&mut self.collected).freeze(),
                encoding: std::mem::take(&mut self.encoding),
            });
        }
    }
}

impl Body for TeeBody {
    type Data = Bytes;
    type Error = hyper::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
        let this = self.get_mut();
        match Pin::new(&mut this.inner).poll_frame(cx) {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.collected.extend_from_slice(data);
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Poll::Ready(None) => {
                this.complete();
                Poll::Ready(None)
            }
            other => other,
        }
    }

    // The connection must keep polling until `poll_frame` yields `None`,
    // otherwise the completion callback would never run.
    fn is_end_stream(&self) -> bool {
        self.on_complete.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for TeeBody {
    fn drop(&mut self) {
        // Bodies the server never polls (HEAD, 204, 304) still complete.
        // A body abandoned mid-stream does not.
        if self.inner.is_end_stream() {
            self.complete();
        }
    }
}

impl fmt::Debug for TeeBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeeBody")
            .field("collected", &self.collected.len())
            .field("encoding", &self.encoding)
            .field("completed", &self.on_complete.is_none())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Body yielding one data frame per queued chunk.
    struct Chunks(VecDeque<Bytes>);

    impl Body for Chunks {
        type Data = Bytes;
        type Error = hyper::Error;

        fn poll_frame(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
        ) -> Poll<Option<Result<Frame<Bytes>, hyper::Error>>> {
            Poll::Ready(self.get_mut().0.pop_front().map(|c| Ok(Frame::data(c))))
        }
    }

    fn chunked(parts: &[&'static str]) -> ProxyBody {
        Chunks(parts.iter().map(|p| Bytes::from_static(p.as_bytes())).collect()).boxed()
    }

    #[tokio::test]
    async fn test_tee_collects_and_completes_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let body = TeeBody::new(chunked(&["hello", " ", "world"]), "gzip", move |body| {
            sink.lock().unwrap().push(body);
        });
        let relayed = body.collect().await.unwrap().to_bytes();

        assert_eq!(relayed, Bytes::from_static(b"hello world"));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].chunks, Bytes::from_static(b"hello world"));
        assert_eq!(seen[0].encoding, "gzip");
    }

    #[test]
    fn test_unpolled_empty_body_completes_on_drop() {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();

        let body = TeeBody::new(empty_body(), "", move |body| {
            assert!(body.chunks.is_empty());
            *counter.lock().unwrap() += 1;
        });
        drop(body);

        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn test_abandoned_body_does_not_complete() {
        let count = Arc::new(Mutex::new(0));
        let counter = count.clone();

        let body = TeeBody::new(chunked(&["partial"]), "", move |_| {
            *counter.lock().unwrap() += 1;
        });
        drop(body);

        assert_eq!(*count.lock().unwrap(), 0);
    }

    #[test]
    fn test_not_end_stream_until_complete() {
        let body = TeeBody::new(empty_body(), "", |_| {});
        assert!(!body.is_end_stream());
    }
}
