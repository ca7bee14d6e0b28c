//! Backend transport: one HTTP exchange with the detection service.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Longest backend error body kept in a [`TransportError::Rejected`].
const MAX_ERROR_BODY: usize = 512;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("backend did not answer within {0:?}")]
    Timeout(Duration),
    #[error("backend unreachable: {0}")]
    Unreachable(String),
    #[error("backend answered HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Sends encoded envelope text to the backend and returns its reply text.
pub trait Transport: Send + Sync {
    fn exchange(
        &self,
        envelope: String,
    ) -> impl Future<Output = Result<String, TransportError>> + Send;
}

/// HTTP transport to a jsonpickle-speaking detection backend.
///
/// The envelope text is posted as a JSON string (the backend client does
/// `requests.post(url, json=jsonpickle.encode(payload))`), and the reply body
/// is returned as-is for decoding.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Unreachable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: url.into(),
            timeout,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Unreachable(err.to_string())
        }
    }
}

impl Transport for HttpTransport {
    fn exchange(
        &self,
        envelope: String,
    ) -> impl Future<Output = Result<String, TransportError>> + Send {
        async move {
            tracing::debug!(url = %self.url, bytes = envelope.len(), "posting envelope to backend");

            let response = self
                .client
                .post(&self.url)
                .json(&envelope)
                .send()
                .await
                .map_err(|e| self.classify(e))?;

            let status = response.status();
            let body = response.text().await.map_err(|e| self.classify(e))?;

            if !status.is_success() {
                let mut body = body;
                if body.len() > MAX_ERROR_BODY {
                    let mut cut = MAX_ERROR_BODY;
                    while !body.is_char_boundary(cut) {
                        cut -= 1;
                    }
                    body.truncate(cut);
                }
                tracing::warn!(status = status.as_u16(), "backend rejected envelope");
                return Err(TransportError::Rejected {
                    status: status.as_u16(),
                    body,
                });
            }

            tracing::debug!(bytes = body.len(), status = status.as_u16(), "backend replied");
            Ok(body)
        }
    }
}
