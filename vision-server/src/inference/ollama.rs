/// Ollama 推理客户端
///
/// - POST {endpoint}/api/generate
/// - GET  {endpoint}/api/tags
use super::image_prep::prepare_image;
use super::types::{GenerateOptions, GenerateRequest, GenerateResponse, TagsResponse};
use super::InferenceClient;
use crate::config::InferenceSettings;
use async_trait::async_trait;
use common::{InferenceError, InferencePayload, InferenceRequest, InferenceResult, StatusSnapshot};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const ENDPOINT_GENERATE: &str = "/api/generate";
const ENDPOINT_TAGS: &str = "/api/tags";

const TEXT_CONFIDENCE: f64 = 0.9;
const IMAGE_CONFIDENCE: f64 = 0.8;

pub struct OllamaClient {
    client: Client,
    settings: InferenceSettings,
}

impl OllamaClient {
    pub fn new(settings: InferenceSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    pub fn endpoint(&self) -> &str {
        self.settings.endpoint.trim_end_matches('/')
    }

    /// 构造 generate 请求体，图像负载在 blocking 线程池上完成校验和缩放
    async fn build_request(&self, request: &InferenceRequest) -> Result<(GenerateRequest, f64), InferenceError> {
        match &request.payload {
            InferencePayload::Text(message) => Ok((
                GenerateRequest {
                    model: self.settings.model.clone(),
                    prompt: message.clone(),
                    stream: false,
                    images: None,
                    options: None,
                },
                TEXT_CONFIDENCE,
            )),
            InferencePayload::Image(data) => {
                let data = data.clone();
                let max_bytes = self.settings.max_image_bytes;
                let prepared = tokio::task::spawn_blocking(move || prepare_image(&data, max_bytes))
                    .await
                    .map_err(|e| {
                        InferenceError::Unavailable(format!("image preparation task failed: {}", e))
                    })??;
                if prepared.reduced {
                    info!(
                        "Image reduced to {}x{} ({} bytes) for inference",
                        prepared.width, prepared.height, prepared.byte_len
                    );
                }

                let prompt = request
                    .instruction
                    .clone()
                    .unwrap_or_else(|| self.settings.default_image_prompt.clone());

                Ok((
                    GenerateRequest {
                        model: self.settings.model.clone(),
                        prompt,
                        stream: false,
                        images: Some(vec![prepared.base64]),
                        options: Some(GenerateOptions {
                            temperature: self.settings.temperature,
                            top_p: self.settings.top_p,
                            num_predict: self.settings.num_predict,
                        }),
                    },
                    IMAGE_CONFIDENCE,
                ))
            }
        }
    }
}

fn map_transport_error(e: reqwest::Error, timeout: Duration) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout(timeout.as_millis() as u64)
    } else {
        InferenceError::Unavailable(format!("request failed: {}", e))
    }
}

#[async_trait]
impl InferenceClient for OllamaClient {
    async fn infer(
        &self,
        request: InferenceRequest,
        timeout: Duration,
    ) -> Result<InferenceResult, InferenceError> {
        let kind = request.kind();
        let (body, confidence) = self.build_request(&request).await?;
        let url = format!("{}{}", self.endpoint(), ENDPOINT_GENERATE);

        debug!("Calling {} for {} request: model={}", url, kind, body.model);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .json(&body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_transport_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!("Inference endpoint returned {}: {}", status, text);
            return Err(InferenceError::Unavailable(format!(
                "endpoint returned status {}: {}",
                status.as_u16(),
                text
            )));
        }

        let body: GenerateResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                InferenceError::Timeout(timeout.as_millis() as u64)
            } else {
                InferenceError::Unavailable(format!("malformed response body: {}", e))
            }
        })?;

        // 优先使用服务端统计的总耗时
        let processing_time = body
            .total_duration
            .map(|ns| ns as f64 / 1e9)
            .unwrap_or_else(|| start.elapsed().as_secs_f64());

        info!(
            "Inference completed: kind={}, processing_time={:.3}s, response_len={}",
            kind,
            processing_time,
            body.response.len()
        );

        Ok(InferenceResult::new(body.response, confidence, processing_time))
    }

    async fn status(&self) -> StatusSnapshot {
        let url = format!("{}{}", self.endpoint(), ENDPOINT_TAGS);
        let endpoint = self.endpoint().to_string();

        let response = match self
            .client
            .get(&url)
            .timeout(self.settings.status_timeout)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => return StatusSnapshot::unavailable(endpoint, e.to_string()),
        };

        if !response.status().is_success() {
            return StatusSnapshot::unavailable(
                endpoint,
                format!("endpoint returned status {}", response.status().as_u16()),
            );
        }

        match response.json::<TagsResponse>().await {
            Ok(tags) => {
                let model_loaded = tags.models.iter().any(|m| m.name == self.settings.model);
                StatusSnapshot {
                    available: true,
                    model_loaded,
                    endpoint,
                    model_name: Some(self.settings.model.clone()),
                    error: None,
                }
            }
            Err(e) => StatusSnapshot::unavailable(endpoint, format!("malformed tags response: {}", e)),
        }
    }
}
