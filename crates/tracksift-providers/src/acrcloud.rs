// SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::ProviderError;
use crate::{Recognition, RecognitionProvider, USER_AGENT};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use hmac::{Hmac, Mac};
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use sha1::Sha1;
use std::time::Duration;
use tracing::{debug, instrument, trace};
use tracksift_domain::{AudioSegment, ProviderId, RecognitionResult, SegmentPayload};
use url::Url;

const ACRCLOUD_API_BASE: &str = "https://identify-eu-west-1.acrcloud.com";
const IDENTIFY_PATH: &str = "/v1/identify";
const SIGNATURE_VERSION: &str = "1";
/// Samples are the cut audio of the window; ACRCloud fingerprints them server side.
const DATA_TYPE: &str = "audio";
pub const ACRCLOUD_PROVIDER_ID: &str = "acrcloud";

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Deserialize)]
struct AcrResponse {
    status: AcrStatus,
    #[serde(default)]
    metadata: Option<AcrMetadata>,
}

#[derive(Debug, Deserialize)]
struct AcrStatus {
    code: i64,
    #[serde(default)]
    msg: String,
}

#[derive(Debug, Default, Deserialize)]
struct AcrMetadata {
    #[serde(default)]
    music: Vec<AcrMusic>,
}

/// One music match from the identify endpoint.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AcrMusic {
    pub title: String,
    #[serde(default)]
    pub artists: Vec<AcrArtist>,
    /// Match score on a 0-100 scale.
    #[serde(default)]
    pub score: Option<f32>,
    /// Where in the reference track the sample matched.
    #[serde(default)]
    pub play_offset_ms: Option<u64>,
    #[serde(default)]
    pub acrid: Option<String>,
    #[serde(default)]
    pub album: Option<AcrAlbum>,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AcrArtist {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AcrAlbum {
    pub name: String,
}

/// ACRCloud identification client using the signed multipart protocol (signature version 1).
#[derive(Debug, Clone)]
pub struct AcrCloudClient {
    id: ProviderId,
    client: Client,
    base_url: String,
    access_key: String,
    access_secret: String,
}

impl AcrCloudClient {
    pub fn builder(
        access_key: impl Into<String>,
        access_secret: impl Into<String>,
    ) -> AcrCloudClientBuilder {
        AcrCloudClientBuilder::new(access_key, access_secret)
    }

    /// Signature over the canonical request string, base64-encoded HMAC-SHA1.
    pub fn sign(&self, timestamp: i64) -> Result<String, ProviderError> {
        let string_to_sign = format!(
            "POST\n{}\n{}\n{}\n{}\n{}",
            IDENTIFY_PATH, self.access_key, DATA_TYPE, SIGNATURE_VERSION, timestamp
        );
        let mut mac = HmacSha1::new_from_slice(self.access_secret.as_bytes())
            .map_err(|e| ProviderError::auth(format!("unusable access secret: {e}")))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    async fn submit(&self, sample: Vec<u8>) -> Result<AcrResponse, ProviderError> {
        let timestamp = chrono::Utc::now().timestamp();
        let signature = self.sign(timestamp)?;
        let sample_bytes = sample.len();

        let form = Form::new()
            .text("access_key", self.access_key.clone())
            .text("data_type", DATA_TYPE)
            .text("signature_version", SIGNATURE_VERSION)
            .text("signature", signature)
            .text("sample_bytes", sample_bytes.to_string())
            .text("timestamp", timestamp.to_string())
            .part("sample", Part::bytes(sample).file_name("sample.wav"));

        let url = format!("{}{}", self.base_url, IDENTIFY_PATH);
        trace!(target: "acrcloud", %url, sample_bytes, "ACRCloud identify");

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        let status = response.status();
        debug!(target: "acrcloud", %status, "ACRCloud response status");
        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        if !status.is_success() {
            return Err(ProviderError::from_status(status, &body));
        }
        trace!(target: "acrcloud", "ACRCloud response: {}", body);

        serde_json::from_str(&body)
            .map_err(|e| ProviderError::malformed(format!("invalid JSON: {e}")))
    }

    fn to_result(&self, music: &AcrMusic) -> RecognitionResult {
        let artist = if music.artists.is_empty() {
            "Unknown artist".to_string()
        } else {
            music
                .artists
                .iter()
                .map(|a| a.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let confidence = music.score.unwrap_or(100.0) / 100.0;

        let mut result = RecognitionResult::new(&music.title, artist, confidence, self.id.clone())
            .with_raw_metadata(serde_json::json!({
                "acrid": music.acrid,
                "album": music.album.as_ref().map(|a| a.name.as_str()),
                "score": music.score,
            }));
        if let Some(offset) = music.play_offset_ms {
            result = result.with_matched_at(offset);
        }
        result
    }
}

#[async_trait]
impl RecognitionProvider for AcrCloudClient {
    fn id(&self) -> &ProviderId {
        &self.id
    }

    fn payload(&self) -> SegmentPayload {
        SegmentPayload::Audio
    }

    #[instrument(skip(self, segment), fields(segment = %segment.id()))]
    async fn identify(&self, segment: &AudioSegment) -> Result<Recognition, ProviderError> {
        let sample = match segment.audio() {
            Some(audio) if !audio.is_empty() => audio.to_vec(),
            _ => return Err(ProviderError::malformed("segment carries no audio sample")),
        };

        let response = self.submit(sample).await?;
        match response.status.code {
            0 => {}
            1001 => return Ok(Recognition::NotFound),
            code => return Err(map_status_code(code, &response.status.msg)),
        }

        let best = response
            .metadata
            .unwrap_or_default()
            .music
            .into_iter()
            .max_by(|a, b| a.score.unwrap_or(100.0).total_cmp(&b.score.unwrap_or(100.0)));

        match best {
            Some(music) => {
                let result = self.to_result(&music);
                debug!(
                    target: "acrcloud",
                    title = %result.track_title,
                    score = result.confidence,
                    "ACRCloud match"
                );
                Ok(Recognition::Match(result))
            }
            None => Ok(Recognition::NotFound),
        }
    }
}

fn map_status_code(code: i64, msg: &str) -> ProviderError {
    let message = format!("ACRCloud status {code}: {msg}");
    match code {
        // invalid access key, invalid signature
        3001 | 3014 => ProviderError::auth(message),
        // daily limit, QPS limit
        3003 | 3015 => ProviderError::rate_limited(message),
        2005 => ProviderError::timeout(message),
        3000 | 3002 => ProviderError::unreachable(message),
        _ => ProviderError::malformed(message),
    }
}

#[derive(Debug)]
pub struct AcrCloudClientBuilder {
    access_key: String,
    access_secret: String,
    base_url: String,
    timeout: Duration,
}

impl AcrCloudClientBuilder {
    pub fn new(access_key: impl Into<String>, access_secret: impl Into<String>) -> Self {
        Self {
            access_key: access_key.into(),
            access_secret: access_secret.into(),
            base_url: ACRCLOUD_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
        }
    }

    /// Project host, e.g. `https://identify-us-west-2.acrcloud.com`.
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn build(self) -> Result<AcrCloudClient, ProviderError> {
        Url::parse(&self.base_url)
            .map_err(|e| ProviderError::malformed(format!("invalid base URL: {e}")))?;

        let client = Client::builder()
            .timeout(self.timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ProviderError::from_reqwest(&e))?;

        Ok(AcrCloudClient {
            id: ProviderId::from(ACRCLOUD_PROVIDER_ID),
            client,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            access_key: self.access_key,
            access_secret: self.access_secret,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ProviderErrorKind;
    use tracksift_domain::SourceId;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn segment() -> AudioSegment {
        AudioSegment::new(SourceId::from("mix"), 25_000, 30_000, &b"AQADtEmSRUkSRZEG"[..])
            .with_audio(&b"RIFF-cut-window-audio"[..])
    }

    async fn client_for(server: &MockServer) -> AcrCloudClient {
        AcrCloudClient::builder("test-access", "test-secret")
            .base_url(server.uri())
            .build()
            .unwrap()
    }

    async fn mount_status(server: &MockServer, code: i64, msg: &str) {
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"msg": msg, "code": code, "version": "1.0"}
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn signature_matches_reference_value() {
        let client = AcrCloudClient::builder("test-access", "test-secret")
            .build()
            .unwrap();
        assert_eq!(
            client.sign(1_700_000_000).unwrap(),
            "aB7ZyF6EMW+azvtTtv1twFQOwas="
        );
    }

    #[tokio::test]
    async fn identify_sends_signed_multipart_and_scales_score() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .and(body_string_contains("name=\"access_key\""))
            .and(body_string_contains("test-access"))
            .and(body_string_contains("name=\"signature_version\""))
            .and(body_string_contains("name=\"sample\""))
            .and(body_string_contains("\r\n\r\naudio\r\n"))
            .and(body_string_contains("RIFF-cut-window-audio"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": {"msg": "Success", "code": 0, "version": "1.0"},
                "metadata": {"music": [
                    {"title": "Windowlicker", "artists": [{"name": "Aphex Twin"}],
                     "score": 72, "play_offset_ms": 81_240, "acrid": "abc"},
                    {"title": "Girl/Boy Song", "artists": [{"name": "Aphex Twin"}],
                     "score": 88, "play_offset_ms": 12_000, "acrid": "def",
                     "album": {"name": "Richard D. James Album"}}
                ]}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let recognition = client_for(&server).await.identify(&segment()).await.unwrap();

        let result = match recognition {
            Recognition::Match(result) => result,
            other => panic!("expected a match, got {:?}", other),
        };
        assert_eq!(result.track_title, "Girl/Boy Song");
        assert_eq!(result.artist, "Aphex Twin");
        assert!((result.confidence - 0.88).abs() < 1e-6);
        assert_eq!(result.matched_at_ms, Some(12_000));
        assert_eq!(result.raw_metadata["album"], "Richard D. James Album");
    }

    #[tokio::test]
    async fn no_result_status_is_not_found() {
        let server = MockServer::start().await;
        mount_status(&server, 1001, "No result").await;

        let recognition = client_for(&server).await.identify(&segment()).await.unwrap();
        assert_eq!(recognition, Recognition::NotFound);
    }

    #[tokio::test]
    async fn status_codes_map_into_taxonomy() {
        let cases = [
            (3001, ProviderErrorKind::AuthError),
            (3014, ProviderErrorKind::AuthError),
            (3003, ProviderErrorKind::RateLimited),
            (3015, ProviderErrorKind::RateLimited),
            (2004, ProviderErrorKind::Malformed),
            (3006, ProviderErrorKind::Malformed),
        ];
        for (code, kind) in cases {
            let server = MockServer::start().await;
            mount_status(&server, code, "error").await;

            let err = client_for(&server).await.identify(&segment()).await.unwrap_err();
            assert_eq!(err.kind, kind, "status {code}");
        }
    }

    #[tokio::test]
    async fn http_failure_maps_by_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server).await.identify(&segment()).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Unreachable);
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn segment_without_audio_is_rejected_before_any_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/identify"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let bare = AudioSegment::new(SourceId::from("mix"), 0, 30_000, &b"AQADtEmSRUkSRZEG"[..]);
        let err = client_for(&server).await.identify(&bare).await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::Malformed);
    }

    #[test]
    fn consumes_audio_payload() {
        let client = AcrCloudClient::builder("k", "s").build().unwrap();
        assert_eq!(client.payload(), SegmentPayload::Audio);
    }
}
