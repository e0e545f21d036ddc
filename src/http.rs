use std::convert::Infallible;
use std::fmt;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use hyper::body::{HttpBody, SizeHint};
use hyper::header::{HeaderName, HeaderValue};

use crate::controller::TerminationReason;
use crate::dispatch::Completion;

pub use hyper::body::Bytes;
pub use hyper::{HeaderMap, Method, StatusCode, Version};

/// The transport-level descriptor of the remote end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAddr {
    /// An IPv4 or IPv6 peer.
    Inet(SocketAddr),
    /// A peer on a unix domain socket.
    Unix,
    /// The transport could not tell.
    Unknown,
}

impl From<SocketAddr> for PeerAddr {
    fn from(addr: SocketAddr) -> Self {
        PeerAddr::Inet(addr)
    }
}

/// Method, path, headers and peer of one request.
///
/// Created once per exchange by the transport and shared by every
/// invocation of the controller handling it.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: Method,
    pub path: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub peer: PeerAddr,
}

impl RequestHead {
    pub fn new(method: Method, path: impl Into<String>, peer: PeerAddr) -> Self {
        Self {
            method,
            path: path.into(),
            version: Version::HTTP_11,
            headers: HeaderMap::new(),
            peer,
        }
    }
}

/// A complete HTTP response as handed to the transport.
///
/// Headers keep their order and may repeat. The body is a [`Bytes`] handle,
/// so giving the transport its own copy does not duplicate the buffer.
///
/// ```
/// # use vigil::{Reply, StatusCode};
/// let reply = Reply::new(StatusCode::OK, "ok")
///     .header("Content-Type", "text/plain");
/// assert_eq!(reply.body, "ok");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Reply {
    pub fn new(status: StatusCode, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// A reply without a body.
    pub fn empty(status: StatusCode) -> Self {
        Self::new(status, Bytes::new())
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Converts the reply into a hyper response whose body carries the
    /// exchange's completion guard.
    pub(crate) fn into_response(
        self,
        method: &Method,
        completion: Completion,
    ) -> hyper::Response<ReplyBody> {
        let mut body = ReplyBody::new(self.body, completion);
        if *method == Method::HEAD {
            // hyper drops a HEAD body unpolled, so the head is the whole reply
            body.completion.set(TerminationReason::CompletedOk);
        }
        let mut response = hyper::Response::new(body);
        *response.status_mut() = self.status;

        let headers = response.headers_mut();
        for (name, value) in self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(&value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => log::warn!("dropping malformed response header {:?}", name),
            }
        }

        response
    }
}

/// Response body handed to hyper.
///
/// Yields the cached bytes once. The completion guard rides along so the
/// exchange is reported finished only after hyper is done with the body.
pub struct ReplyBody {
    data: Option<Bytes>,
    len: u64,
    completion: Completion,
}

impl ReplyBody {
    fn new(data: Bytes, mut completion: Completion) -> Self {
        let len = data.len() as u64;
        let data = if data.is_empty() {
            // hyper never polls an empty body
            completion.set(TerminationReason::CompletedOk);
            None
        } else {
            Some(data)
        };

        Self {
            data,
            len,
            completion,
        }
    }
}

impl HttpBody for ReplyBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_data(
        mut self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Option<Result<Self::Data, Self::Error>>> {
        let data = self.data.take();
        if data.is_some() {
            self.completion.set(TerminationReason::CompletedOk);
        }
        Poll::Ready(data.map(Ok))
    }

    fn poll_trailers(
        self: Pin<&mut Self>,
        _: &mut Context<'_>,
    ) -> Poll<Result<Option<HeaderMap>, Self::Error>> {
        Poll::Ready(Ok(None))
    }

    fn is_end_stream(&self) -> bool {
        self.data.is_none()
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.len)
    }
}

impl fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplyBody")
            .field("len", &self.len)
            .field("pending", &self.data.is_some())
            .finish()
    }
}
