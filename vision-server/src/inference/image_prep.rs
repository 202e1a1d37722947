// 图像负载预处理
//
// 去掉 data URL 前缀、Base64 解码并确认是可解码的图像。
// 超过字节上限时按比例缩小并重新编码为 JPEG，绝不截断字节。
// 全部是阻塞的 CPU 工作，调用方应放在 blocking 线程池上执行。

use crate::capture::encode_jpeg;
use base64::{engine::general_purpose, Engine as _};
use common::InferenceError;
use image::imageops::FilterType;
use image::io::{Limits, Reader};
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, info};

/// 解码时允许的最大边长，防止小体积大尺寸图像耗尽内存
pub const MAX_DECODE_DIMENSION: u32 = 8192;

/// 缩放后允许的最小边长
const MIN_DIMENSION: u32 = 16;

/// 最多缩放次数
const MAX_REDUCE_ATTEMPTS: usize = 8;

const REENCODE_QUALITY: u8 = 85;
const MIN_REENCODE_QUALITY: u8 = 40;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedImage {
    /// 不带前缀的 Base64
    pub base64: String,
    /// 解码后字节数
    pub byte_len: usize,
    pub width: u32,
    pub height: u32,
    /// 是否经过缩放重编码
    pub reduced: bool,
}

/// 去掉 `data:<mime>;base64,` 前缀
pub fn strip_data_url(payload: &str) -> Result<&str, InferenceError> {
    let payload = payload.trim();
    if !payload.starts_with("data:") {
        return Ok(payload);
    }

    payload
        .split_once(',')
        .map(|(_, data)| data)
        .ok_or_else(|| InferenceError::InvalidPayload("data URL has no payload".to_string()))
}

/// 校验并在必要时缩小图像
pub fn prepare_image(payload: &str, max_bytes: usize) -> Result<PreparedImage, InferenceError> {
    let encoded = strip_data_url(payload)?;
    let bytes = general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| InferenceError::InvalidPayload(format!("invalid base64: {}", e)))?;

    let decoded = decode_limited(&bytes)?;

    if bytes.len() <= max_bytes {
        return Ok(PreparedImage {
            base64: encoded.to_string(),
            byte_len: bytes.len(),
            width: decoded.width(),
            height: decoded.height(),
            reduced: false,
        });
    }

    info!(
        "Image payload {} bytes exceeds limit {} bytes, reducing",
        bytes.len(),
        max_bytes
    );

    let mut image = decoded.to_rgb8();
    let mut current_len = bytes.len();
    let mut quality = REENCODE_QUALITY;

    for attempt in 0..MAX_REDUCE_ATTEMPTS {
        // 第一次只重新编码，不缩放
        if attempt > 0 {
            let ratio = ((max_bytes as f64 / current_len as f64).sqrt() * 0.9).clamp(0.1, 0.9);
            let width = (image.width() as f64 * ratio) as u32;
            let height = (image.height() as f64 * ratio) as u32;
            if width < MIN_DIMENSION || height < MIN_DIMENSION {
                break;
            }
            image = image::imageops::resize(&image, width, height, FilterType::Triangle);
            quality = quality.saturating_sub(10).max(MIN_REENCODE_QUALITY);
        }

        let data = encode_jpeg(&image, quality)
            .map_err(|e| InferenceError::InvalidPayload(format!("re-encode failed: {}", e)))?;
        debug!(
            "Reduce attempt {}: {}x{} q={} -> {} bytes",
            attempt,
            image.width(),
            image.height(),
            quality,
            data.len()
        );

        if data.len() <= max_bytes {
            return Ok(PreparedImage {
                base64: general_purpose::STANDARD.encode(&data),
                byte_len: data.len(),
                width: image.width(),
                height: image.height(),
                reduced: true,
            });
        }
        current_len = data.len();
    }

    Err(InferenceError::InvalidPayload(format!(
        "image cannot be reduced below {} bytes",
        max_bytes
    )))
}

fn decode_limited(bytes: &[u8]) -> Result<DynamicImage, InferenceError> {
    let mut reader = Reader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| InferenceError::InvalidPayload(format!("unreadable image: {}", e)))?;

    let mut limits = Limits::default();
    limits.max_image_width = Some(MAX_DECODE_DIMENSION);
    limits.max_image_height = Some(MAX_DECODE_DIMENSION);
    reader.limits(limits);

    reader
        .decode()
        .map_err(|e| InferenceError::InvalidPayload(format!("not a decodable image: {}", e)))
}
