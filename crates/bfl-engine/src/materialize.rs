use std::io::Cursor;

use anyhow::{anyhow, bail, Context, Result};
use image::{DynamicImage, ImageFormat};
use serde_json::Value;
use tracing::debug;

use crate::tensor::ImageTensor;
use crate::transport::{truncate_text, FluxTransport};

/// Download, decode and normalize the `Ready` payload's sample. The
/// pipeline turns any error here into [`ImageTensor::placeholder`].
pub fn try_materialize(
    transport: &dyn FluxTransport,
    payload: &Value,
    output_format: &str,
) -> Result<ImageTensor> {
    let url = sample_url(payload).ok_or_else(|| anyhow!("result payload missing result.sample"))?;
    let reply = transport.get(&url, None)?;
    if !reply.is_ok() {
        bail!(
            "image download failed ({}): {}",
            reply.status,
            truncate_text(&reply.text(), 256)
        );
    }
    decode_image(&reply.body, output_format)
}

/// `result.sample`, with the `output`/`url` spellings some endpoints use.
pub fn sample_url(payload: &Value) -> Option<String> {
    payload
        .get("result")
        .and_then(Value::as_object)
        .and_then(|row| {
            row.get("sample")
                .or_else(|| row.get("output"))
                .or_else(|| row.get("url"))
        })
        .or_else(|| payload.get("sample"))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Decode `bytes`; when `output_format` names a different encoding than the
/// source, round-trip through it first so the tensor reflects that format.
pub fn decode_image(bytes: &[u8], output_format: &str) -> Result<ImageTensor> {
    let source = image::guess_format(bytes).context("unrecognized image data")?;
    let decoded =
        image::load_from_memory_with_format(bytes, source).context("image decode failed")?;
    let decoded = match requested_format(output_format) {
        Some(target) if target != source => {
            debug!(?source, ?target, "re-encoding image");
            reencode(&decoded, target)?
        }
        _ => decoded,
    };
    Ok(ImageTensor::from_rgb(&decoded.to_rgb8()))
}

fn requested_format(raw: &str) -> Option<ImageFormat> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "jpeg" | "jpg" => Some(ImageFormat::Jpeg),
        "png" => Some(ImageFormat::Png),
        _ => None,
    }
}

fn reencode(image: &DynamicImage, format: ImageFormat) -> Result<DynamicImage> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image.to_rgb8())
        .write_to(&mut buffer, format)
        .with_context(|| format!("{format:?} encode failed"))?;
    image::load_from_memory_with_format(buffer.get_ref(), format)
        .with_context(|| format!("{format:?} re-decode failed"))
}

#[cfg(test)]
pub(crate) mod tests {
    use image::{Rgb, RgbImage};
    use serde_json::json;

    use super::*;
    use crate::transport::fake::ScriptedTransport;
    use crate::transport::HttpReply;

    pub(crate) fn encoded(image: &RgbImage, format: ImageFormat) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        DynamicImage::ImageRgb8(image.clone())
            .write_to(&mut buffer, format)
            .expect("encode test image");
        buffer.into_inner()
    }

    fn ready(url: &str) -> Value {
        json!({"status": "Ready", "result": {"sample": url}})
    }

    #[test]
    fn materializes_png_sample() {
        let image = RgbImage::from_pixel(64, 32, Rgb([255, 0, 51]));
        let transport = ScriptedTransport::new();
        transport.serve_download(
            "https://cdn.test/a.png",
            HttpReply::new(200, encoded(&image, ImageFormat::Png)),
        );

        let tensor = try_materialize(&transport, &ready("https://cdn.test/a.png"), "png")
            .expect("png sample materializes");
        assert_eq!(tensor.shape(), [1, 32, 64, 3]);
        assert_eq!(tensor.as_array()[[0, 5, 5, 0]], 1.0);
        assert!((tensor.as_array()[[0, 5, 5, 2]] - 0.2).abs() < 1e-6);

        let calls = transport.calls();
        assert_eq!(calls[0].api_key, None);
    }

    #[test]
    fn reencodes_when_requested_format_differs() -> Result<()> {
        let image = RgbImage::from_fn(40, 24, |x, y| Rgb([(x * 6) as u8, (y * 10) as u8, 90]));
        let png = encoded(&image, ImageFormat::Png);

        let kept = decode_image(&png, "png")?;
        assert_eq!(kept.to_rgb_image(), image);

        let jpeg = decode_image(&png, "jpeg")?;
        assert_eq!(jpeg.shape(), [1, 24, 40, 3]);
        assert_ne!(jpeg.to_rgb_image(), image);

        let unknown = decode_image(&png, "tiff-ish")?;
        assert_eq!(unknown.to_rgb_image(), image);
        Ok(())
    }

    #[test]
    fn missing_or_broken_samples_are_errors() {
        let transport = ScriptedTransport::new();
        transport
            .serve_download("https://cdn.test/404.png", HttpReply::new(404, "gone"))
            .serve_download("https://cdn.test/junk.png", HttpReply::new(200, "not an image"));

        let payloads = [
            json!({"status": "Ready"}),
            json!({"status": "Ready", "result": {"sample": ""}}),
            ready("https://cdn.test/404.png"),
            ready("https://cdn.test/junk.png"),
            ready("https://cdn.test/unscripted.png"),
        ];
        for payload in payloads {
            assert!(try_materialize(&transport, &payload, "jpeg").is_err(), "{payload}");
        }
    }

    #[test]
    fn sample_url_accepts_alternate_keys() {
        assert_eq!(
            sample_url(&json!({"result": {"output": " https://x/y.jpg "}})).as_deref(),
            Some("https://x/y.jpg")
        );
        assert_eq!(
            sample_url(&json!({"sample": "https://x/z.jpg"})).as_deref(),
            Some("https://x/z.jpg")
        );
        assert_eq!(sample_url(&json!({"result": "done"})), None);
    }
}
