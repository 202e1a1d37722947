use bytes::Bytes;
use common::CaptureError;
use image::codecs::jpeg::JpegEncoder;
use image::{ColorType, RgbImage};

/// 将RGB图像编码为JPEG
pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Bytes, CaptureError> {
    let mut buffer = Vec::with_capacity((image.width() * image.height() / 4) as usize);
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, quality.clamp(1, 100));
    encoder
        .encode(image.as_raw(), image.width(), image.height(), ColorType::Rgb8)
        .map_err(|e| CaptureError::DeviceUnavailable(format!("jpeg encode failed: {}", e)))?;
    Ok(Bytes::from(buffer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_encode_produces_jpeg() {
        let image = RgbImage::from_pixel(64, 48, Rgb([200, 150, 100]));
        let data = encode_jpeg(&image, 80).unwrap();

        assert!(data.len() > 4);
        assert_eq!(&data[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.width(), 64);
        assert_eq!(decoded.height(), 48);
    }

    #[test]
    fn test_lower_quality_is_smaller() {
        let image = RgbImage::from_fn(128, 128, |x, y| Rgb([(x * 2) as u8, (y * 2) as u8, ((x + y) % 256) as u8]));
        let high = encode_jpeg(&image, 95).unwrap();
        let low = encode_jpeg(&image, 10).unwrap();
        assert!(low.len() < high.len());
    }
}
