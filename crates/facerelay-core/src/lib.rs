//! facerelay-core — envelope codec and face record normalizer.
//!
//! Packs an image into the jsonpickle envelope the detection backend
//! expects, relays it over HTTP, decodes the reply and normalizes it into
//! versioned [`FaceRecord`]s.

pub mod envelope;
pub mod normalizer;
pub mod numeric;
pub mod relay;
pub mod transport;
pub mod types;

pub use envelope::{decode, encode, EnvelopeError, Value};
pub use normalizer::{normalize, NormalizeError};
pub use relay::{ErrorKind, Relay, RelayError, RelayOptions, DEFAULT_RESULT_KEY, DEFAULT_TIMEOUT};
pub use transport::{HttpTransport, Transport, TransportError};
pub use types::{FaceRecord, FacesResponse, DEFAULT_DET_SCORE};
