#![cfg(feature = "classify-http")]

use anyhow::{anyhow, Context, Result};
use std::time::Duration;
use url::Url;

use crate::classify::backend::{Classifier, ClassifyRequest, FrameImage};
use crate::classify::result::ClassificationResult;

const JPEG_QUALITY: u8 = 85;

/// HTTP backend for a remote multimodal model.
///
/// POSTs the frame as `image/jpeg` and expects a JSON `ClassificationResult`
/// in the response body. Prompting and schema enforcement live on the server.
pub struct HttpClassifier {
    agent: ureq::Agent,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpClassifier {
    pub fn new(endpoint: &str, timeout: Duration) -> Result<Self> {
        let url = Url::parse(endpoint).context("parse classifier url")?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(anyhow!(
                "unsupported classifier scheme '{}'; expected http(s)",
                url.scheme()
            ));
        }
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Ok(Self {
            agent,
            endpoint: url.to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: Option<String>) -> Self {
        self.api_key = api_key.filter(|key| !key.trim().is_empty());
        self
    }
}

impl Classifier for HttpClassifier {
    fn name(&self) -> &'static str {
        "http"
    }

    fn classify(&mut self, request: &ClassifyRequest) -> Result<ClassificationResult> {
        let jpeg = match &request.image {
            FrameImage::Jpeg(bytes) => bytes.clone(),
            FrameImage::Raw(frame) => frame.encode_jpeg(JPEG_QUALITY)?,
        };

        let mut call = self
            .agent
            .post(&self.endpoint)
            .set("Content-Type", "image/jpeg")
            .set("X-Frame-Reference", &request.reference);
        if let Some(key) = &self.api_key {
            call = call.set("Authorization", &format!("Bearer {}", key));
        }

        let response = call
            .send_bytes(&jpeg)
            .with_context(|| format!("classify {}", request.reference))?;
        let result: ClassificationResult = response
            .into_json()
            .with_context(|| format!("decode classifier response for {}", request.reference))?;
        Ok(result)
    }
}
