//! HTTP clients for cross-endpoint forwarding and the state manager.

use std::time::Duration;

use color_eyre::{
    Result, Section, SectionExt,
    eyre::{Context, eyre},
};
use derive_more::{Debug, Display};
use reqwest::StatusCode;
use tracing::instrument;
use url::Url;

use crate::{
    Token,
    flash::v1::{ENDPOINT_TIMEOUT_SECS, Job, JobEnvelope, Manifest, Response},
};

/// Client for a sibling worker endpoint.
///
/// Used for cross-endpoint forwarding: the original job is wrapped into a
/// fresh `{"input": ...}` envelope and posted to the target endpoint URL.
///
/// ## Cloning
///
/// This type is cheaply cloneable, and clones share the underlying HTTP
/// connection pool.
#[derive(Clone, Debug, Display)]
#[display("{}", base.as_str())]
pub struct Endpoint {
    #[debug("{:?}", base.as_str())]
    base: Url,

    #[debug(skip)]
    http: reqwest::Client,

    token: Option<Token>,
}

impl Endpoint {
    /// Create a new client for the given endpoint URL.
    ///
    /// The whole forwarded request runs under a single total deadline so
    /// that a hung sibling cannot wedge this worker indefinitely.
    pub fn new(base: Url, token: Option<Token>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(ENDPOINT_TIMEOUT_SECS))
            .build()
            .context("build http client")?;

        Ok(Self { base, http, token })
    }

    /// Forward a job to the endpoint and return its response.
    ///
    /// The endpoint's reply is either a [`Response`] directly or a wrapped
    /// `{"output": <Response>}`; both shapes are accepted.
    #[instrument(skip(self, job), fields(endpoint = %self))]
    pub async fn run(&self, job: &Job) -> Result<Response> {
        let envelope = JobEnvelope { input: job.clone() };

        let mut request = self.http.post(self.base.clone()).json(&envelope);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose());
        }

        let response = request.send().await.context("send")?;
        match response.status() {
            status if status.is_success() => {
                let body = response
                    .json::<serde_json::Value>()
                    .await
                    .context("read response body")?;

                // Async-queue frontends wrap the worker's reply in "output".
                let payload = match body.get("output") {
                    Some(output) => output.clone(),
                    None => body,
                };

                serde_json::from_value::<Response>(payload)
                    .map_err(|err| eyre!("failed to parse response from endpoint: {err}"))
            }
            status => {
                let url = response.url().to_string();
                let body = response.text().await.unwrap_or_default();
                Err(eyre!("remote endpoint returned status {status}"))
                    .with_section(|| url.header("Url:"))
                    .with_section(|| body.header("Body:"))
            }
        }
    }
}

/// Client for the central state manager.
///
/// The state manager holds the authoritative manifest for each endpoint;
/// workers query it only when their local manifest has gone stale.
#[derive(Clone, Debug, Display)]
#[display("{}", base.as_str())]
pub struct StateManager {
    #[debug("{:?}", base.as_str())]
    base: Url,

    #[debug(skip)]
    http: reqwest::Client,

    token: Token,
}

impl StateManager {
    /// Create a new client with the given base URL and API key.
    pub fn new(base: Url, token: Token) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .context("build http client")?;

        Ok(Self { base, http, token })
    }

    /// Fetch the persisted manifest for an endpoint.
    ///
    /// Returns `None` when the state manager has no manifest for the
    /// endpoint (the caller keeps using whatever it has locally).
    #[instrument(skip(self))]
    pub async fn persisted_manifest(&self, endpoint_id: &str) -> Result<Option<Manifest>> {
        let url = self
            .base
            .join(&format!("v1/endpoints/{endpoint_id}/manifest"))
            .context("build manifest url")?;

        let response = self
            .http
            .get(url)
            .bearer_auth(self.token.expose())
            .send()
            .await
            .context("send")?;

        match response.status() {
            StatusCode::OK => {
                let manifest = response
                    .json::<Manifest>()
                    .await
                    .context("parse manifest JSON")?;
                Ok(Some(manifest))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                let url = response.url().to_string();
                let body = response.text().await.unwrap_or_default();
                Err(eyre!("unexpected status code: {status}"))
                    .with_section(|| url.header("Url:"))
                    .with_section(|| body.header("Body:"))
            }
        }
    }
}
