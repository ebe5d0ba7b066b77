//! Shared client library for the Flash worker wire protocol.
//!
//! This library provides the type definitions for jobs, responses, opaque
//! argument blobs, and the deployment manifest, plus HTTP client
//! implementations for cross-endpoint forwarding and state-manager queries.
//! Types are always available, while HTTP client code is gated behind the
//! `client` feature flag so that tooling can depend on the wire types without
//! dragging in a network stack.

use std::{fmt, str::FromStr};

use color_eyre::eyre::bail;
use serde::{Deserialize, Serialize};
use tap::Pipe;

pub mod flash;

/// An API key used as a bearer token for cross-endpoint requests.
///
/// Wraps the key string and ensures it is never accidentally leaked in logs
/// or debug output. To access the actual value, use the `expose()` method.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Token(String);

impl Token {
    /// Expose the raw token value.
    ///
    /// This method must be called explicitly to access the token string,
    /// preventing accidental exposure in logs or debug output.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Read the token from the environment, if present.
    ///
    /// Empty values are treated as absent: an empty `RUNPOD_API_KEY` in a
    /// container template must not produce an `Authorization` header.
    pub fn from_env(var: &str) -> Option<Self> {
        match std::env::var(var) {
            Ok(value) if !value.is_empty() => Some(Self(value)),
            _ => None,
        }
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl FromStr for Token {
    type Err = color_eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            bail!("token cannot be empty");
        }
        String::from(s).pipe(Self).pipe(Ok)
    }
}

impl<S: Into<String>> From<S> for Token {
    fn from(s: S) -> Self {
        Self(s.into())
    }
}

/// The latest Flash worker client version.
#[cfg(feature = "client")]
pub type Endpoint = flash::v1::Endpoint;
