// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::ProviderError;
use crate::{Recognition, RecognitionProvider, USER_AGENT};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument, trace};
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult};
use url::Url;
use uuid::Uuid;

const ACOUSTID_API_BASE: &str = "https://api.acoustid.org/v2";
pub const ACOUSTID_PROVIDER_ID: &str = "acoustid";

/// One fingerprint match returned by `/lookup`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LookupResult {
    /// AcoustID track id.
    pub id: String,
    /// Fingerprint similarity (0-1).
    pub score: f32,
    #[serde(default)]
    pub recordings: Vec<Recording>,
}

/// MusicBrainz recording linked to an AcoustID track.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Recording {
    pub id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub artists: Vec<RecordingArtist>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct RecordingArtist {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct AcoustidResponse {
    status: String,
    #[serde(default)]
    results: Vec<LookupResult>,
    error: Option<AcoustidApiError>,
}

#[derive(Debug, Deserialize)]
struct AcoustidApiError {
    code: i64,
    message: String,
}

/// AcoustID lookup client. Submits compressed Chromaprint fingerprints.
#[derive(Debug, Clone)]
pub struct AcoustidClient {
    id: ProviderId,
    client: Client,
    base_url: String,
    api_key: String,
}

impl AcoustidClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        Self::builder(api_key).build()
    }

    pub fn builder(api_key: impl Into<String>) -> AcoustidClientBuilder {
        AcoustidClientBuilder::new(api_key)
    }

    /// Look a fingerprint up and return every match, best first.
    pub async fn lookup(
        &self,
        fingerprint: &str,
        duration_secs: u64,
    ) -> Result<Vec<LookupResult>, ProviderError> {
        validate_fingerprint(fingerprint)?;
        if duration_secs == 0 {
            return Err(ProviderError::malformed("duration must be > 0"));
        }

        let mut url = Url::parse(&format!("{}/lookup", self.base_url))
            .map_err(|e| ProviderError::malformed(format!("invalid lookup url: {e}")))?;
        url.query_pairs_mut()
            .append_pair("client", &self.api_key)
            .append_pair("fingerprint", fingerprint)
            .append_pair("duration", &duration_secs.to_string())
            .append_pair("meta", "recordings");

        trace!(target: "acoustid", duration_secs, "AcoustID lookup");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        debug!(target: "acoustid", %status, "AcoustID response status");

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;
        trace!(target: "acoustid", "AcoustID response: {}", body);

        // Error payloads come back with 4xx/5xx but still carry a structured code.
        let parsed = serde_json::from_str::<AcoustidResponse>(&body);
        let api_response = match parsed {
            Ok(api_response) => api_response,
            Err(_) if !status.is_success() => return Err(ProviderError::from_status(status, &body)),
            Err(e) => return Err(ProviderError::malformed(format!("invalid JSON: {e}"))),
        };

        if !api_response.status.eq_ignore_ascii_case("ok") {
            return Err(match api_response.error {
                Some(error) => map_api_error(error),
                None if !status.is_success() => ProviderError::from_status(status, &body),
                None => ProviderError::malformed("error status without error details"),
            });
        }

        let mut results = api_response.results;
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        Ok(results)
    }

    fn best_match(&self, results: &[LookupResult]) -> Option<RecognitionResult> {
        results.iter().find_map(|result| {
            let recording = result
                .recordings
                .iter()
                .find(|recording| recording.title.is_some())?;
            let title = recording.title.clone()?;
            let artist = if recording.artists.is_empty() {
                "Unknown artist".to_string()
            } else {
                recording
                    .artists
                    .iter()
                    .map(|a| a.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            };

            Some(
                RecognitionResult::new(title, artist, result.score, self.id.clone())
                    .with_raw_metadata(serde_json::json!({
                        "acoustid": result.id,
                        "recording_id": recording.id,
                        "score": result.score,
                    })),
            )
        })
    }
}

#[async_trait]
impl RecognitionProvider for AcoustidClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    #[instrument(skip(self, segment), fields(segment = %segment.id()))]
    async fn identify(&self, segment: &AudioSegment) -> Result<Recognition, ProviderError> {
        let fingerprint = std::str::from_utf8(segment.fingerprint())
            .map_err(|_| ProviderError::malformed("fingerprint payload is not a Chromaprint string"))?;
        let duration_secs = (segment.duration_ms() / 1000).max(1);

        let results = self.lookup(fingerprint, duration_secs).await?;
        match self.best_match(&results) {
            Some(result) => {
                debug!(
                    target: "acoustid",
                    title = %result.track_title,
                    score = result.confidence,
                    "AcoustID match"
                );
                Ok(Recognition::Match(result))
            }
            None => Ok(Recognition::NotFound),
        }
    }
}

fn map_api_error(error: AcoustidApiError) -> ProviderError {
    let message = format!("AcoustID error {}: {}", error.code, error.message);
    match error.code {
        // invalid API key, not allowed, invalid user key, bad MB token, unknown application
        4 | 6 | 12 | 15 | 17 => ProviderError::auth(message),
        14 => ProviderError::rate_limited(message),
        // internal error, service unavailable
        5 | 13 => ProviderError::unreachable(message),
        _ => ProviderError::malformed(message),
    }
}

/// Compressed Chromaprint fingerprints are URL-safe base64 without padding, but
/// standard base64 with trailing `=` padding is accepted too.
fn validate_fingerprint(fingerprint: &str) -> Result<(), ProviderError> {
    if fingerprint.is_empty() {
        return Err(ProviderError::malformed("fingerprint is empty"));
    }

    let trimmed = fingerprint.trim_end_matches('=');
    if fingerprint.len() - trimmed.len() > 2 {
        return Err(ProviderError::malformed(
            "invalid base64 padding: too many '=' characters",
        ));
    }

    if !trimmed
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '-' | '_'))
    {
        return Err(ProviderError::malformed(
            "fingerprint contains invalid characters",
        ));
    }

    Ok(())
}

#[derive(Debug)]
pub struct AcoustidClientBuilder {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

impl AcoustidClientBuilder {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: ACOUSTID_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Set a custom base URL (useful for testing).
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// # Errors
    /// Fails if the base URL does not parse or the HTTP client cannot be created.
    pub fn build(self) -> Result<AcoustidClient, ProviderError> {
        Url::parse(&self.base_url)
            .map_err(|e| ProviderError::malformed(format!("invalid base URL: {e}")))?;

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        Ok(AcoustidClient {
            id: ProviderId::from(ACOUSTID_PROVIDER_ID),
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            api_key: self.api_key,
        })
    }
}
