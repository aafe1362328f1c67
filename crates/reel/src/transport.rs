//! Byte transport for media downloads.
//!
//! The cache only needs "GET these bytes with these headers, streamed". [`HttpTransport`] is the
//! reqwest-backed implementation; tests and hosts with their own network stack implement
//! [`MediaTransport`] directly. Deadlines are enforced by the caller around `open` and around
//! each body chunk, so implementations need not apply their own.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use rustls::{ClientConfig, crypto::ring};
use rustls_platform_verifier::BuilderVerifierExt;
use tracing::debug;
use url::Url;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::media::MediaDescriptor;

/// An open response body.
pub struct MediaResponse {
    /// Declared body size, if the server sent one.
    pub content_length: Option<u64>,
    pub body: BoxStream<'static, Result<Bytes, FetchError>>,
}

impl MediaResponse {
    pub fn new(
        content_length: Option<u64>,
        body: BoxStream<'static, Result<Bytes, FetchError>>,
    ) -> Self {
        Self {
            content_length,
            body,
        }
    }
}

impl std::fmt::Debug for MediaResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaResponse")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait MediaTransport: Send + Sync + 'static {
    /// Issue the request for `descriptor` and return once response headers are in.
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<MediaResponse, FetchError>;
}

#[async_trait]
impl<T: MediaTransport + ?Sized> MediaTransport for Arc<T> {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<MediaResponse, FetchError> {
        (**self).open(descriptor).await
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &FetchConfig) -> Result<Client, FetchError> {
    // Create the crypto provider
    let provider = Arc::new(ring::default_provider());

    let tls_config = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::transport(format!("TLS protocol versions: {e}"), false))?
        .with_platform_verifier()
        .map_err(|e| FetchError::transport(format!("TLS verifier: {e}"), false))?
        .with_no_client_auth();

    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(4)
        .user_agent(&config.user_agent)
        .default_headers(header_map(&config.headers)?)
        .use_preconfigured_tls(tls_config)
        .redirect(reqwest::redirect::Policy::limited(10));

    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    client_builder.build().map_err(FetchError::from)
}

fn header_map<'a>(
    headers: impl IntoIterator<Item = (&'a String, &'a String)>,
) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_str(name)
            .map_err(|e| FetchError::transport(format!("invalid header name `{name}`: {e}"), false))?;
        let header_value = HeaderValue::from_str(value).map_err(|e| {
            FetchError::transport(format!("invalid value for header `{name}`: {e}"), false)
        })?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// Parse and check a media URI.
pub fn parse_media_url(uri: &str) -> Result<Url, FetchError> {
    let url = Url::parse(uri).map_err(|e| FetchError::invalid_url(uri, e.to_string()))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        other => Err(FetchError::invalid_url(
            uri,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

/// reqwest-backed transport.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(config: &FetchConfig) -> Result<Self, FetchError> {
        Ok(Self {
            client: create_client(config)?,
        })
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MediaTransport for HttpTransport {
    async fn open(&self, descriptor: &MediaDescriptor) -> Result<MediaResponse, FetchError> {
        let url = parse_media_url(&descriptor.uri)?;
        let headers = header_map(&descriptor.headers)?;

        debug!(id = %descriptor.id, url = %url, "requesting media");
        let response = self.client.get(url).headers(headers).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::http_status(status, descriptor.uri.clone()));
        }

        let content_length = response.content_length();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(FetchError::from))
            .boxed();
        Ok(MediaResponse::new(content_length, body))
    }
}
