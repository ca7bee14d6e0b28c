//! Relay orchestrator: image bytes in, face records (or one structured error) out.

use crate::envelope::{self, EnvelopeError, Mapping, Value};
use crate::normalizer::{self, NormalizeError};
use crate::transport::{Transport, TransportError};
use crate::types::FaceRecord;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Serialize;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Key under which the backend reports detections.
pub const DEFAULT_RESULT_KEY: &str = "face_detection_recognition";
/// Field carrying the image bytes in the outbound envelope.
pub const IMAGE_FIELD: &str = "image";
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub result_key: String,
    /// Upper bound on one backend exchange.
    pub timeout: Duration,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            result_key: DEFAULT_RESULT_KEY.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// Failure category reported at the service boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    UnsupportedValueType,
    MalformedEnvelope,
    TagResolution,
    MissingField,
    UnsupportedResultFormat,
    BackendTimeout,
    BackendUnreachable,
    BackendRejected,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::UnsupportedValueType => "unsupported_value_type",
            ErrorKind::MalformedEnvelope => "malformed_envelope",
            ErrorKind::TagResolution => "tag_resolution",
            ErrorKind::MissingField => "missing_field",
            ErrorKind::UnsupportedResultFormat => "unsupported_result_format",
            ErrorKind::BackendTimeout => "backend_timeout",
            ErrorKind::BackendUnreachable => "backend_unreachable",
            ErrorKind::BackendRejected => "backend_rejected",
        }
    }
}

/// The single error a relay can fail with.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct RelayError {
    pub kind: ErrorKind,
    pub message: String,
}

impl RelayError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<EnvelopeError> for RelayError {
    fn from(e: EnvelopeError) -> Self {
        let kind = match e {
            EnvelopeError::UnsupportedValueType(_) => ErrorKind::UnsupportedValueType,
            EnvelopeError::MalformedEnvelope(_) => ErrorKind::MalformedEnvelope,
            EnvelopeError::TagResolution(_) => ErrorKind::TagResolution,
        };
        RelayError::new(kind, e.to_string())
    }
}

impl From<NormalizeError> for RelayError {
    fn from(e: NormalizeError) -> Self {
        match e {
            NormalizeError::Envelope(inner) => inner.into(),
            NormalizeError::MissingField { .. } => RelayError::new(ErrorKind::MissingField, e.to_string()),
            NormalizeError::UnsupportedResultFormat(_) | NormalizeError::InvalidGeometry { .. } => {
                RelayError::new(ErrorKind::UnsupportedResultFormat, e.to_string())
            }
        }
    }
}

impl From<TransportError> for RelayError {
    fn from(e: TransportError) -> Self {
        let kind = match e {
            TransportError::Timeout(_) => ErrorKind::BackendTimeout,
            TransportError::Unreachable(_) => ErrorKind::BackendUnreachable,
            TransportError::Rejected { .. } => ErrorKind::BackendRejected,
        };
        RelayError::new(kind, e.to_string())
    }
}

/// Composes codec, transport and normalizer for one request at a time.
///
/// Holds no per-request state, so one `Relay` can serve concurrent requests.
pub struct Relay<T> {
    transport: T,
    options: RelayOptions,
}

impl<T: Transport> Relay<T> {
    pub fn new(transport: T, options: RelayOptions) -> Self {
        Self { transport, options }
    }

    pub fn options(&self) -> &RelayOptions {
        &self.options
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Relay a base64-encoded image, as received at the service boundary.
    pub async fn relay_base64(&self, image_b64: &str) -> Result<Vec<FaceRecord>, RelayError> {
        let image = STANDARD
            .decode(image_b64.trim())
            .map_err(|e| RelayError::new(ErrorKind::InvalidRequest, format!("image is not valid base64: {e}")))?;
        if image.is_empty() {
            return Err(RelayError::new(ErrorKind::InvalidRequest, "image is empty"));
        }
        self.relay(image).await
    }

    /// Send raw image bytes to the backend and normalize its reply.
    pub async fn relay(&self, image: Vec<u8>) -> Result<Vec<FaceRecord>, RelayError> {
        let started = Instant::now();
        let image_bytes = image.len();

        let request = Value::Map(Mapping::from([(IMAGE_FIELD.to_string(), Value::Bytes(image))]));
        let envelope = envelope::encode(&request)?;
        drop(request);

        tracing::debug!(image_bytes, envelope_bytes = envelope.len(), "encoded request envelope");

        let reply = match tokio::time::timeout(self.options.timeout, self.transport.exchange(envelope)).await {
            Ok(reply) => reply?,
            Err(_) => {
                tracing::warn!(timeout = ?self.options.timeout, "backend exchange timed out");
                return Err(TransportError::Timeout(self.options.timeout).into());
            }
        };

        let decoded = envelope::decode(&reply)?;
        let faces = self.extract(&decoded)?;

        tracing::info!(
            faces = faces.len(),
            reply_bytes = reply.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "relay complete"
        );
        Ok(faces)
    }

    /// Pull the result key out of a decoded reply. A missing key means zero
    /// detections, not a failure.
    fn extract(&self, reply: &Value) -> Result<Vec<FaceRecord>, RelayError> {
        let reply = reply.resolved()?;
        let Some(fields) = reply.as_mapping() else {
            return Err(NormalizeError::UnsupportedResultFormat(format!(
                "backend reply is a {}, expected a mapping",
                reply.kind()
            ))
            .into());
        };

        match fields.get(&self.options.result_key) {
            Some(result) => Ok(normalizer::normalize(result)?),
            None => {
                tracing::info!(
                    key = %self.options.result_key,
                    "backend reply has no result key; treating as zero detections"
                );
                Ok(Vec::new())
            }
        }
    }
}
