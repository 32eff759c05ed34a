//! The transport seam: performs one HTTP exchange for a descriptor.
//!
//! This abstracts over the HTTP client so the reactor and the listener can
//! be driven by `reqwest` in production and by scripted fakes in tests.
//! Non-2xx responses are data, not errors; only connection-level failures
//! become a `TransportError`.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt, TryStreamExt};
use reqwest::header::{HeaderName, HeaderValue};

use crate::descriptor::Descriptor;
use crate::error::TransportError;
use crate::http::{HttpMethod, HttpResponse};

/// Body chunks of a streaming exchange, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

pub trait Transport: Send + Sync + 'static {
    /// Perform one complete exchange, buffering the whole body.
    fn issue(&self, descriptor: &Descriptor) -> BoxFuture<'static, Result<HttpResponse, TransportError>>;

    /// Open a long-lived GET whose body arrives incrementally.
    fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>>;
}

/// A [`reqwest`]-backed implementation of [`Transport`].
///
/// No client-side timeout is configured: deadlines belong to the
/// supervisor, and change feeds stay open indefinitely.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    inner: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }

    fn request(
        &self,
        method: HttpMethod,
        url: &str,
        headers: &[(String, String)],
        body: Option<&[u8]>,
    ) -> Result<reqwest::RequestBuilder, TransportError> {
        let method = match method {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
        };
        let mut builder = self.inner.request(method, url);
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::new(format!("invalid header name {name:?}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::new(format!("invalid header value for {name}: {e}")))?;
            builder = builder.header(name, value);
        }
        if let Some(body) = body {
            builder = builder.body(body.to_vec());
        }
        Ok(builder)
    }
}

fn response_headers(resp: &reqwest::Response) -> Vec<(String, String)> {
    resp.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_lowercase(), v.to_string()))
        })
        .collect()
}

impl Transport for ReqwestTransport {
    fn issue(&self, descriptor: &Descriptor) -> BoxFuture<'static, Result<HttpResponse, TransportError>> {
        let builder = self.request(
            descriptor.method(),
            descriptor.url(),
            descriptor.headers(),
            descriptor.body(),
        );
        async move {
            let resp = builder?.send().await?;
            let status = resp.status().as_u16();
            let headers = response_headers(&resp);
            let body = resp.bytes().await?.to_vec();
            Ok(HttpResponse { status, headers, body })
        }
        .boxed()
    }

    fn open_stream(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> BoxFuture<'static, Result<ByteStream, TransportError>> {
        let builder = self.request(HttpMethod::Get, url, headers, None);
        async move {
            let resp = builder?.send().await?;
            let stream: ByteStream = resp.bytes_stream().map_err(TransportError::from).boxed();
            Ok(stream)
        }
        .boxed()
    }
}
