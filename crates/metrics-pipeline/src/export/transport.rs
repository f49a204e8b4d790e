//! Transports deliver an encoded payload to the collector.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use error_stack::Report;
use error_stack::ResultExt;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderName;
use reqwest::header::HeaderValue;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::debug;
use tracing::info;

use crate::config::PipelineConfig;
use crate::error::MetricsError;
use crate::error::MetricsResult;

const MAX_ERROR_BODY: usize = 512;

/// Encoded snapshot ready to be sent.
#[derive(Debug, Clone)]
pub struct Payload {
    pub content_type: &'static str,
    pub body: Bytes,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Transient transport failure: {message}")]
    Transient { message: String },
    #[error("Collector rejected payload with status {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("Permanent transport failure: {message}")]
    Permanent { message: String },
}

impl TransportError {
    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient { .. })
    }
}

/// A single transmission attempt.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, payload: Payload) -> Result<(), Report<TransportError>>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where T: Transport + ?Sized
{
    async fn send(&self, payload: Payload) -> Result<(), Report<TransportError>> {
        (**self).send(payload).await
    }
}

/// HTTP POST of the payload to the configured endpoint.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: &PipelineConfig) -> MetricsResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes()).change_context(
                MetricsError::Configuration {
                    message: format!("Invalid header name `{name}`"),
                },
            )?;
            let value = HeaderValue::from_str(value).change_context(MetricsError::Configuration {
                message: format!("Invalid value for header `{name}`"),
            })?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .timeout(config.export_timeout)
            .default_headers(headers)
            .build()
            .change_context(MetricsError::Configuration {
                message: "Failed to create HTTP client for exporter".into(),
            })?;

        info!(endpoint = %config.endpoint, "HTTP metrics transport created");

        Ok(Self {
            client,
            endpoint: config.endpoint.clone(),
        })
    }

    fn classify_status(status: StatusCode, body: String) -> TransportError {
        let mut message = body;
        if message.len() > MAX_ERROR_BODY {
            // collector bodies are arbitrary UTF-8, cut on a char boundary
            let cut = (0..=MAX_ERROR_BODY)
                .rev()
                .find(|i| message.is_char_boundary(*i))
                .unwrap_or(0);
            message.truncate(cut);
        }
        if status == StatusCode::REQUEST_TIMEOUT
            || status == StatusCode::TOO_MANY_REQUESTS
            || status.is_server_error()
        {
            TransportError::Transient {
                message: format!("HTTP {status}: {message}"),
            }
        } else {
            TransportError::Rejected {
                status: status.as_u16(),
                message,
            }
        }
    }

    fn classify_error(err: &reqwest::Error) -> TransportError {
        if err.is_builder() {
            TransportError::Permanent {
                message: err.to_string(),
            }
        } else {
            // connect, timeout, request and body errors may not repeat
            TransportError::Transient {
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, payload: Payload) -> Result<(), Report<TransportError>> {
        let size = payload.body.len();
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, payload.content_type)
            .body(payload.body)
            .send()
            .await
            .map_err(|e| Report::new(Self::classify_error(&e)))?;

        let status = response.status();
        if status.is_success() {
            debug!(%status, bytes = size, "Metrics payload accepted");
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(Report::new(Self::classify_status(status, body)))
    }
}

/// Writes every payload to the `metrics` log target.
#[derive(Debug, Clone, Default)]
pub struct LogTransport;

impl LogTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for LogTransport {
    async fn send(&self, payload: Payload) -> Result<(), Report<TransportError>> {
        let body = String::from_utf8_lossy(&payload.body);
        info!(target: "metrics", content_type = payload.content_type, msg = %body);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use test_log::test;
    use wiremock::matchers::body_string;
    use wiremock::matchers::header;
    use wiremock::matchers::method;
    use wiremock::matchers::path;
    use wiremock::Mock;
    use wiremock::MockServer;
    use wiremock::ResponseTemplate;

    use super::*;

    fn payload() -> Payload {
        Payload {
            content_type: "application/json",
            body: Bytes::from_static(b"{\"resourceMetrics\":[]}"),
        }
    }

    async fn transport(server: &MockServer) -> HttpTransport {
        let config = PipelineConfig::new(format!("{}/v1/metrics", server.uri()), Duration::from_secs(60))
            .with_export_timeout(Duration::from_secs(2))
            .with_header("x-api-key", "secret");
        HttpTransport::new(&config).expect("should create transport")
    }

    async fn send_with_status(status: u16) -> Result<(), Report<TransportError>> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;
        transport(&server).await.send(payload()).await
    }

    #[test(tokio::test)]
    async fn posts_body_with_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/metrics"))
            .and(header("content-type", "application/json"))
            .and(header("x-api-key", "secret"))
            .and(body_string("{\"resourceMetrics\":[]}"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        transport(&server)
            .await
            .send(payload())
            .await
            .expect("2xx should be accepted");
    }

    #[test(tokio::test)]
    async fn server_errors_are_transient() {
        for status in [408, 429, 500, 503] {
            let report = send_with_status(status).await.expect_err("should fail");
            assert!(report.current_context().is_retryable(), "status {status}");
        }
    }

    #[test(tokio::test)]
    async fn client_errors_are_rejected() {
        for status in [400, 401, 403, 404] {
            let report = send_with_status(status).await.expect_err("should fail");
            assert_eq!(report.current_context(), &TransportError::Rejected {
                status,
                message: "nope".into(),
            });
        }
    }

    #[test(tokio::test)]
    async fn connection_refused_is_transient() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("should bind");
            listener.local_addr().expect("local addr").port()
        };
        let config = PipelineConfig::new(format!("http://127.0.0.1:{port}/v1/metrics"), Duration::from_secs(60))
            .with_export_timeout(Duration::from_secs(2));
        let transport = HttpTransport::new(&config).expect("should create transport");

        let report = transport.send(payload()).await.expect_err("nobody listens");
        assert!(
            matches!(report.current_context(), TransportError::Transient { .. }),
            "{:?}",
            report.current_context()
        );
    }

    #[test]
    fn long_error_body_is_cut_on_char_boundary() {
        // byte 512 falls inside the two-byte `é`
        let body = format!("{}é and more", "a".repeat(511));

        let err = HttpTransport::classify_status(StatusCode::BAD_REQUEST, body);

        assert_eq!(err, TransportError::Rejected {
            status: 400,
            message: "a".repeat(511),
        });
    }

    #[test]
    fn short_error_body_is_kept() {
        let err = HttpTransport::classify_status(StatusCode::SERVICE_UNAVAILABLE, "überlastet".into());
        assert_eq!(err, TransportError::Transient {
            message: "HTTP 503 Service Unavailable: überlastet".into(),
        });
    }

    #[test]
    fn invalid_header_is_configuration_error() {
        let config = PipelineConfig::new("http://localhost:4318/v1/metrics", Duration::from_secs(60))
            .with_header("bad header", "value");
        let report = HttpTransport::new(&config).expect_err("header name with space");
        assert!(matches!(report.current_context(), MetricsError::Configuration { .. }));
    }

    #[test(tokio::test)]
    async fn log_transport_always_succeeds() {
        LogTransport::new()
            .send(payload())
            .await
            .expect("log transport should not fail");
    }
}
