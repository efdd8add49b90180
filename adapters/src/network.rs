//! HTTP through a shared `reqwest::Client`.
//!
//! `fetch` spawns the request right away so it is already on the wire while
//! the core goes on with other work; `http-call-head` later awaits the task.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use corehost_runtime::{ByteStream, HostFut, HttpResponse, Network, NetworkError};
use corehost_types::{Errno, HeaderMultiMap, HttpRequest};
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::redirect::Policy;
use reqwest::{Client, Method, RequestBuilder, Response, Url};
use tracing::debug;

use crate::config::NetworkConfig;

const MAX_REDIRECTS: usize = 10;

pub struct ReqwestNetwork {
    client: Client,
}

impl ReqwestNetwork {
    pub fn new(config: &NetworkConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_seconds))
            .redirect(Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }

    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn prepare(&self, request: HttpRequest) -> Result<RequestBuilder, NetworkError> {
        let url = Url::parse(&request.url)
            .map_err(|err| NetworkError::InvalidUrl(format!("{}: {err}", request.url)))?;
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| NetworkError::Other(format!("invalid method {}", request.method)))?;

        let mut headers = HeaderMap::new();
        for (name, values) in &request.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| NetworkError::Other(format!("invalid header name {name}: {err}")))?;
            for value in values {
                let value = HeaderValue::from_str(value).map_err(|err| {
                    NetworkError::Other(format!("invalid value for header {name}: {err}"))
                })?;
                headers.append(name.clone(), value);
            }
        }

        let mut builder = self.client.request(method, url).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }
        Ok(builder)
    }
}

impl Network for ReqwestNetwork {
    /// Must be called from within a tokio runtime.
    fn fetch(&self, request: HttpRequest) -> HostFut<'static, Result<HttpResponse, NetworkError>> {
        debug!(method = %request.method, url = %request.url, "fetch");
        let prepared = self.prepare(request);
        let task = tokio::spawn(async move {
            let response = prepared?.send().await.map_err(|err| classify(&err))?;
            Ok(into_response(response))
        });
        Box::pin(async move {
            task.await
                .unwrap_or_else(|err| Err(NetworkError::Other(format!("fetch task failed: {err}"))))
        })
    }
}

fn into_response(response: Response) -> HttpResponse {
    let status = response.status().as_u16();
    let mut headers = HeaderMultiMap::new();
    for (name, value) in response.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    let body: ByteStream = Box::pin(response.bytes_stream().map(|chunk| {
        chunk.map(|bytes| bytes.to_vec()).map_err(|err| {
            debug!(error = %err, "response body failed");
            if err.is_timeout() {
                Errno::TimedOut
            } else {
                Errno::Io
            }
        })
    }));
    HttpResponse {
        status,
        headers,
        body,
    }
}

fn classify(err: &reqwest::Error) -> NetworkError {
    if err.is_timeout() {
        return NetworkError::Timeout;
    }
    if err.is_builder() {
        return NetworkError::InvalidUrl(err.to_string());
    }

    let host = err
        .url()
        .and_then(Url::host_str)
        .unwrap_or_default()
        .to_string();
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(cause) = source {
        if let Some(io_err) = cause.downcast_ref::<io::Error>()
            && io_err.kind() == io::ErrorKind::ConnectionRefused
        {
            return NetworkError::ConnectionRefused(host);
        }
        if cause.to_string().contains("dns error") {
            return NetworkError::HostNotFound(host);
        }
        source = cause.source();
    }
    NetworkError::Other(err.to_string())
}
