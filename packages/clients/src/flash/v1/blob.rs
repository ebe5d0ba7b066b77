//! Opaque argument/result blobs.
//!
//! Arguments and results cross the wire as base64-encoded, self-describing
//! payloads: a single tag byte followed by the serialized value. Two tags
//! exist:
//!
//! - `J`: a UTF-8 JSON document. Produced and consumed by both the worker
//!   and the interpreter shim; covers every JSON-representable value, with
//!   JSON `null` as the "no value" sentinel.
//! - `P`: pickle bytes. Produced and consumed only by the interpreter shim
//!   so that user-defined classes round-trip; the worker passes these
//!   through without interpreting them.
//!
//! The worker only ever needs to *construct* `J` blobs (e.g. when turning an
//! HTTP query string into kwargs) and to *pass through* whatever tag a job
//! carries.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use color_eyre::{
    Result,
    eyre::{Context, bail},
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tap::Pipe;

const TAG_JSON: u8 = b'J';
const TAG_PICKLE: u8 = b'P';

/// How a blob's payload is encoded.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
pub enum BlobEncoding {
    #[display("json")]
    Json,
    #[display("pickle")]
    Pickle,
}

/// An opaque, base64-encoded value.
#[derive(Clone, Eq, PartialEq, Hash, Debug, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blob(String);

impl Blob {
    /// Encode a JSON value as a blob.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let document = serde_json::to_vec(value).context("serialize value")?;
        let mut payload = Vec::with_capacity(document.len() + 1);
        payload.push(TAG_JSON);
        payload.extend_from_slice(&document);
        Ok(Self(BASE64.encode(payload)))
    }

    /// Encode any serializable value as a blob.
    pub fn encode<T: Serialize>(value: &T) -> Result<Self> {
        serde_json::to_value(value)
            .context("convert value to JSON")?
            .pipe_ref(Self::from_json)
    }

    /// The blob encoding the "no value" sentinel.
    pub fn none() -> Self {
        Self::from_json(&serde_json::Value::Null).unwrap_or_default()
    }

    /// Wrap an already-encoded blob string received from the wire.
    pub fn from_encoded(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// The raw base64 text, as it travels on the wire.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Inspect the tag byte without decoding the payload.
    pub fn encoding(&self) -> Result<BlobEncoding> {
        match self.decode()?.first() {
            Some(&TAG_JSON) => Ok(BlobEncoding::Json),
            Some(&TAG_PICKLE) => Ok(BlobEncoding::Pickle),
            Some(tag) => bail!("unknown blob tag: {tag:#04x}"),
            None => bail!("empty blob"),
        }
    }

    /// Decode the blob into a JSON value.
    ///
    /// Fails for `P` (pickle) blobs: those are only meaningful to the
    /// interpreter shim and the worker must not attempt to interpret them.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        let payload = self.decode()?;
        match payload.split_first() {
            Some((&TAG_JSON, document)) => {
                serde_json::from_slice(document).context("parse blob JSON payload")
            }
            Some((&TAG_PICKLE, _)) => {
                bail!("blob contains a pickled value; only the interpreter can decode it")
            }
            Some((tag, _)) => bail!("unknown blob tag: {tag:#04x}"),
            None => bail!("empty blob"),
        }
    }

    fn decode(&self) -> Result<Vec<u8>> {
        BASE64.decode(&self.0).context("decode blob base64")
    }
}

impl From<&Blob> for Blob {
    fn from(blob: &Blob) -> Self {
        blob.clone()
    }
}
