use bulwark_core::Context;
use bytes::Bytes;

use crate::header::HeaderMap;

/// An inbound request as seen by the interceptors.
#[derive(Debug, Clone)]
pub struct Request {
    method: String,
    uri: String,
    headers: HeaderMap,
    remote_addr: Option<String>,
    body: Bytes,
    context: Context,
}

impl Request {
    pub fn new(
        method: impl Into<String>,
        uri: impl Into<String>,
        headers: HeaderMap,
        body: impl Into<Bytes>,
    ) -> Self {
        Self {
            method: method.into(),
            uri: uri.into(),
            headers,
            remote_addr: None,
            body: body.into(),
            context: Context::background(),
        }
    }

    /// Body-less GET, the common case in tests.
    pub fn get(uri: impl Into<String>) -> Self {
        Self::new("GET", uri, HeaderMap::new(), Bytes::new())
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Peer address, `host:port` or bare host.
    pub fn with_remote_addr(mut self, addr: impl Into<String>) -> Self {
        self.remote_addr = Some(addr.into());
        self
    }

    /// Cancellation and deadline of the caller. Interceptors pass it on to
    /// the stores and guarded calls they make for this request.
    pub fn with_context(mut self, ctx: Context) -> Self {
        self.context = ctx;
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// The URI without its query string.
    pub fn path(&self) -> &str {
        self.uri
            .split_once('?')
            .map_or(self.uri.as_str(), |(path, _)| path)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn remote_addr(&self) -> Option<&str> {
        self.remote_addr.as_deref()
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}
