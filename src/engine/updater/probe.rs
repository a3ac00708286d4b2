//! Update Source Probing
//!
//! Asks one source for its currently published firmware. Any failure is an
//! expected outcome and yields no advertisement; retrying is the caller's job.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::version::VersionId;

/// A configured update source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub name: String,
    pub endpoint: String,
}

impl SourceDescriptor {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: endpoint.into(),
        }
    }

    /// Join a path onto the endpoint
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.endpoint.trim_end_matches('/'), path.trim_start_matches('/'))
    }
}

/// Firmware metadata published by a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateAdvertisement {
    pub version: VersionId,
    pub filename: String,
    pub digest: String,
    pub source: String,
}

/// `/check-update` response body
#[derive(Debug, Deserialize)]
struct CheckUpdateResponse {
    version: String,
    filename: String,
    checksum: String,
    #[serde(default)]
    source: Option<String>,
}

/// Reasons a source yields no advertisement
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("source answered HTTP {0}")]
    Status(StatusCode),
    #[error("no answer within {0:?}")]
    Timeout(Duration),
    #[error("malformed advertisement: {0}")]
    Malformed(String),
}

/// Check that a name is a single plain path component
pub fn is_plain_filename(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// One metadata request against one source
#[async_trait]
pub trait SourceProbe: Send + Sync {
    fn descriptor(&self) -> &SourceDescriptor;

    /// Returns `None` when the source is unreachable, slow or malformed
    async fn probe(&self, timeout: Duration) -> Option<UpdateAdvertisement>;
}

/// Probes a source over its HTTP `/check-update` endpoint
#[derive(Debug, Clone)]
pub struct HttpProbe {
    descriptor: SourceDescriptor,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(descriptor: SourceDescriptor) -> Self {
        Self::with_client(descriptor, reqwest::Client::new())
    }

    pub fn with_client(descriptor: SourceDescriptor, client: reqwest::Client) -> Self {
        Self { descriptor, client }
    }

    async fn fetch(&self, timeout: Duration) -> Result<UpdateAdvertisement, ProbeError> {
        let url = self.descriptor.url("check-update");
        let response = self
            .client
            .get(&url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        let body: CheckUpdateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                ProbeError::Timeout(timeout)
            } else if e.is_decode() {
                ProbeError::Malformed(e.to_string())
            } else {
                ProbeError::Http(e)
            }
        })?;

        advertisement_from(body, &self.descriptor)
    }
}

#[async_trait]
impl SourceProbe for HttpProbe {
    fn descriptor(&self) -> &SourceDescriptor {
        &self.descriptor
    }

    async fn probe(&self, timeout: Duration) -> Option<UpdateAdvertisement> {
        match self.fetch(timeout).await {
            Ok(advertisement) => Some(advertisement),
            Err(e) => {
                debug!(source = %self.descriptor.name, error = %e, "source unavailable");
                None
            }
        }
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> ProbeError {
    if e.is_timeout() {
        ProbeError::Timeout(timeout)
    } else {
        ProbeError::Http(e)
    }
}

/// The advertisement is attributed to the probed source, whatever the body claims.
fn advertisement_from(
    body: CheckUpdateResponse,
    descriptor: &SourceDescriptor,
) -> Result<UpdateAdvertisement, ProbeError> {
    if !is_plain_filename(&body.filename) {
        return Err(ProbeError::Malformed(format!(
            "unsafe filename {:?}",
            body.filename
        )));
    }

    if let Some(claimed) = body.source.as_deref() {
        if claimed != descriptor.name {
            warn!(
                source = %descriptor.name,
                claimed,
                "advertisement claims a different source; attributing to the probed one"
            );
        }
    }

    Ok(UpdateAdvertisement {
        version: VersionId::parse(&body.version),
        filename: body.filename,
        digest: body.checksum,
        source: descriptor.name.clone(),
    })
}
