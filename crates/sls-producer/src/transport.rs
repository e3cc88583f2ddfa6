// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The boundary between the dispatcher and the network.
//!
//! The dispatcher only knows the [`Transport`] trait: one call per attempt,
//! success or a status-coded [`TransportError`]. [`HttpTransport`] is the
//! reqwest implementation that posts a serialized `LogGroup` to the
//! `shards/lb` (or `shards/route`) endpoint of a logstore.

use crate::config::CompressType;
use crate::credentials::{Credentials, CredentialsProvider};
use crate::errors::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, HOST, USER_AGENT};
use serde::Deserialize;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tracing::debug;

pub const API_VERSION: &str = "0.6.0";
pub const DEFAULT_USER_AGENT: &str = concat!("sls-rust-producer/", env!("CARGO_PKG_VERSION"));
const REQUEST_ID_HEADER: &str = "x-log-requestid";

/// One delivery attempt of a serialized batch.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub project: String,
    pub logstore: String,
    pub shard_hash: Option<String>,
    pub body: Bytes,
    /// Size of `body` before compression.
    pub raw_size: usize,
    pub compress_type: CompressType,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendResponse {
    pub request_id: Option<String>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, TransportError>;
}

/// Adds authentication to an outgoing request.
pub trait RequestSigner: Send + Sync + Debug {
    fn sign(
        &self,
        method: &str,
        uri: &str,
        headers: &mut HeaderMap,
        body: &[u8],
        credentials: &Credentials,
    ) -> Result<(), TransportError>;
}

/// Leaves requests unsigned, for endpoints that accept anonymous writes or
/// sit behind a signing proxy.
#[derive(Debug, Default, Clone, Copy)]
pub struct AnonymousSigner;

impl RequestSigner for AnonymousSigner {
    fn sign(
        &self,
        _method: &str,
        _uri: &str,
        _headers: &mut HeaderMap,
        _body: &[u8],
        _credentials: &Credentials,
    ) -> Result<(), TransportError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    /// Region endpoint, e.g. `https://cn-hangzhou.log.aliyuncs.com`. Plain http when no scheme.
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: String,
    pub https_proxy: Option<String>,
}

impl HttpTransportConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            timeout: Duration::from_secs(15),
            user_agent: DEFAULT_USER_AGENT.to_string(),
            https_proxy: None,
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(rename = "errorCode", default)]
    error_code: String,
    #[serde(rename = "errorMessage", default)]
    error_message: String,
}

#[derive(Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    scheme: &'static str,
    host: String,
    user_agent: String,
    credentials: CredentialsProvider,
    signer: Box<dyn RequestSigner>,
}

impl HttpTransport {
    pub fn new(
        config: HttpTransportConfig,
        credentials: CredentialsProvider,
    ) -> Result<Self, TransportError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = config.https_proxy.as_deref() {
            let proxy = reqwest::Proxy::https(proxy).map_err(|e| {
                TransportError::network(format!("invalid proxy '{proxy}': {e}")).non_retryable()
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|e| {
            TransportError::network(format!("failed to build HTTP client: {e}")).non_retryable()
        })?;

        let (scheme, host) = split_endpoint(&config.endpoint);
        Ok(Self {
            client,
            scheme,
            host,
            user_agent: config.user_agent,
            credentials,
            signer: Box::new(AnonymousSigner),
        })
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Box<dyn RequestSigner>) -> Self {
        self.signer = signer;
        self
    }

    async fn headers(
        &self,
        request: &SendRequest,
        uri: &str,
    ) -> Result<HeaderMap, TransportError> {
        let mut headers = HeaderMap::new();
        // An IP endpoint cannot carry the project in the URL authority.
        if is_ip_literal(&self.host) {
            headers.insert(HOST, header_value(&project_host(&request.project, &self.host))?);
        }
        headers.insert(
            HeaderName::from_static("x-log-apiversion"),
            HeaderValue::from_static(API_VERSION),
        );
        headers.insert(
            HeaderName::from_static("x-log-bodyrawsize"),
            HeaderValue::from(request.raw_size),
        );
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/x-protobuf"),
        );
        headers.insert(USER_AGENT, header_value(&self.user_agent)?);
        if let Some(compress_type) = request.compress_type.header_value() {
            headers.insert(
                HeaderName::from_static("x-log-compresstype"),
                HeaderValue::from_static(compress_type),
            );
        }

        let credentials = self.credentials.get_credentials().await?;
        if let Some(token) = credentials.security_token.as_deref() {
            headers.insert(
                HeaderName::from_static("x-acs-security-token"),
                header_value(token)?,
            );
        }
        self.signer
            .sign("POST", uri, &mut headers, &request.body, &credentials)?;
        Ok(headers)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: SendRequest) -> Result<SendResponse, TransportError> {
        let uri = request_uri(&request.logstore, request.shard_hash.as_deref());
        let headers = self.headers(&request, &uri).await?;
        let url = request_url(self.scheme, &self.host, &request.project, &uri);

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TransportError::network(format!("request timed out: {e}"))
                } else {
                    TransportError::network(e.to_string())
                }
            })?;

        let status = response.status();
        let request_id = response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);

        if status.is_success() {
            debug!(
                "PRODUCER | Sent {} bytes to {}/{} (request id {:?})",
                request.raw_size, request.project, request.logstore, request_id
            );
            return Ok(SendResponse { request_id });
        }

        let body = response.text().await.unwrap_or_default();
        let (code, message) = match serde_json::from_str::<ErrorBody>(&body) {
            Ok(parsed) => (parsed.error_code, parsed.error_message),
            Err(_) => ("BadResponse".to_string(), body),
        };
        Err(TransportError::from_status(status.as_u16(), code, message).with_request_id(request_id))
    }
}

fn request_uri(logstore: &str, shard_hash: Option<&str>) -> String {
    match shard_hash {
        Some(hash) if !hash.is_empty() => {
            format!("/logstores/{logstore}/shards/route?key={hash}")
        }
        _ => format!("/logstores/{logstore}/shards/lb"),
    }
}

/// Projects are virtual hosts under the region endpoint.
fn project_host(project: &str, host: &str) -> String {
    if project.is_empty() {
        host.to_string()
    } else {
        format!("{project}.{host}")
    }
}

fn request_url(scheme: &str, host: &str, project: &str, uri: &str) -> String {
    if is_ip_literal(host) {
        format!("{scheme}://{host}{uri}")
    } else {
        format!("{scheme}://{}{uri}", project_host(project, host))
    }
}

fn is_ip_literal(host: &str) -> bool {
    host.parse::<SocketAddr>().is_ok()
        || host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok()
}

fn split_endpoint(endpoint: &str) -> (&'static str, String) {
    let endpoint = endpoint.trim();
    let (scheme, rest) = if let Some(rest) = endpoint.strip_prefix("https://") {
        ("https", rest)
    } else if let Some(rest) = endpoint.strip_prefix("http://") {
        ("http", rest)
    } else {
        ("http", endpoint)
    };
    (scheme, rest.trim_end_matches('/').to_string())
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value).map_err(|e| {
        TransportError::network(format!("invalid header value '{value}': {e}")).non_retryable()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};

    fn request(shard_hash: Option<&str>) -> SendRequest {
        SendRequest {
            project: "proj".to_string(),
            logstore: "store".to_string(),
            shard_hash: shard_hash.map(str::to_string),
            body: Bytes::from_static(b"payload"),
            raw_size: 42,
            compress_type: CompressType::Lz4,
        }
    }

    #[test]
    fn test_split_endpoint() {
        assert_eq!(
            split_endpoint("https://cn-hangzhou.log.aliyuncs.com/"),
            ("https", "cn-hangzhou.log.aliyuncs.com".to_string())
        );
        assert_eq!(
            split_endpoint("http://127.0.0.1:8080"),
            ("http", "127.0.0.1:8080".to_string())
        );
        assert_eq!(
            split_endpoint("cn-beijing.log.aliyuncs.com"),
            ("http", "cn-beijing.log.aliyuncs.com".to_string())
        );
    }

    #[test]
    fn test_request_uri() {
        assert_eq!(request_uri("store", None), "/logstores/store/shards/lb");
        assert_eq!(request_uri("store", Some("")), "/logstores/store/shards/lb");
        assert_eq!(
            request_uri("store", Some("0A1B")),
            "/logstores/store/shards/route?key=0A1B"
        );
    }

    #[test]
    fn test_request_url_carries_project() {
        let uri = "/logstores/store/shards/lb";
        assert_eq!(
            request_url("https", "cn-hangzhou.log.aliyuncs.com", "proj", uri),
            "https://proj.cn-hangzhou.log.aliyuncs.com/logstores/store/shards/lb"
        );
        assert_eq!(
            request_url("https", "cn-hangzhou.log.aliyuncs.com", "", uri),
            "https://cn-hangzhou.log.aliyuncs.com/logstores/store/shards/lb"
        );
        assert_eq!(
            request_url("http", "127.0.0.1:8080", "proj", uri),
            "http://127.0.0.1:8080/logstores/store/shards/lb"
        );
        assert!(is_ip_literal("[::1]:8080"));
        assert!(is_ip_literal("10.0.0.1"));
        assert!(!is_ip_literal("cn-beijing.log.aliyuncs.com"));
    }

    #[tokio::test]
    async fn test_send_success() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .match_header("x-log-apiversion", API_VERSION)
            .match_header("x-log-bodyrawsize", "42")
            .match_header("x-log-compresstype", "lz4")
            .match_header("content-type", "application/x-protobuf")
            .match_header("x-acs-security-token", "sts-token")
            .match_header(
                "host",
                Matcher::Exact(format!("proj.{}", server.host_with_port())),
            )
            .match_body("payload")
            .with_status(200)
            .with_header(REQUEST_ID_HEADER, "REQ-1")
            .create_async()
            .await;

        let transport = HttpTransport::new(
            HttpTransportConfig::new(server.url()),
            CredentialsProvider::new_from_static(Credentials {
                access_key_id: "id".to_string(),
                access_key_secret: "secret".to_string(),
                security_token: Some("sts-token".to_string()),
            }),
        )
        .unwrap();

        let response = transport.send(request(None)).await.unwrap();
        assert_eq!(response.request_id.as_deref(), Some("REQ-1"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_routes_by_shard_hash() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/logstores/store/shards/route")
            .match_query(Matcher::UrlEncoded("key".into(), "0A1B".into()))
            .with_status(200)
            .create_async()
            .await;

        let transport = HttpTransport::new(
            HttpTransportConfig::new(server.url()),
            CredentialsProvider::anonymous(),
        )
        .unwrap();
        transport.send(request(Some("0A1B"))).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_send_parses_error_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .with_status(404)
            .with_header(REQUEST_ID_HEADER, "REQ-404")
            .with_body(r#"{"errorCode":"LogStoreNotExist","errorMessage":"logstore store does not exist"}"#)
            .create_async()
            .await;

        let transport = HttpTransport::new(
            HttpTransportConfig::new(server.url()),
            CredentialsProvider::anonymous(),
        )
        .unwrap();
        let err = transport.send(request(None)).await.unwrap_err();
        assert_eq!(err.status, Some(404));
        assert_eq!(err.code, "LogStoreNotExist");
        assert_eq!(err.message, "logstore store does not exist");
        assert_eq!(err.request_id.as_deref(), Some("REQ-404"));
    }

    #[tokio::test]
    async fn test_send_non_json_error_body() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/logstores/store/shards/lb")
            .with_status(502)
            .with_body("bad gateway")
            .create_async()
            .await;

        let transport = HttpTransport::new(
            HttpTransportConfig::new(server.url()),
            CredentialsProvider::anonymous(),
        )
        .unwrap();
        let err = transport.send(request(None)).await.unwrap_err();
        assert_eq!(err.status, Some(502));
        assert_eq!(err.code, "BadResponse");
        assert_eq!(err.message, "bad gateway");
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn test_connection_refused_is_network_error() {
        let transport = HttpTransport::new(
            HttpTransportConfig::new("http://127.0.0.1:1"),
            CredentialsProvider::anonymous(),
        )
        .unwrap();
        let err = transport.send(request(None)).await.unwrap_err();
        assert_eq!(err.status, None);
        assert!(err.retryable);
    }
}
