//! Item image loading and preparation for the vision model.
//!
//! Images are fetched (HTTP or local path), sniffed for type, downscaled to a
//! maximum dimension and re-encoded as lossy WebP, then sent as a data URL.

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine;
use image::GenericImageView;

/// Timeout for fetching one item image
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// WebP quality used for vision input
const VISION_QUALITY: u8 = 85;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("fetching {url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not an image ({0})")]
    NotAnImage(String),

    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
}

/// Where item image bytes come from.
pub trait ImageSource: Send + Sync {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, ImageError>;
}

/// Fetches `http(s)://` references over the network and everything else
/// relative to a local image directory.
pub struct HttpImageSource {
    http: reqwest::blocking::Client,
    local_root: PathBuf,
}

impl HttpImageSource {
    pub fn new(local_root: PathBuf) -> Result<Self, ImageError> {
        let http = reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .build()?;
        Ok(Self { http, local_root })
    }
}

impl ImageSource for HttpImageSource {
    fn fetch(&self, reference: &str) -> Result<Vec<u8>, ImageError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            let response = self.http.get(reference).send()?;
            let status = response.status();
            if !status.is_success() {
                return Err(ImageError::Status {
                    url: reference.to_string(),
                    status: status.as_u16(),
                });
            }
            return Ok(response.bytes()?.to_vec());
        }

        let path = self.local_root.join(reference.trim_start_matches('/'));
        Ok(std::fs::read(path)?)
    }
}

/// Image ready to attach to a vision request.
#[derive(Debug)]
pub struct PreparedImage {
    /// WebP bytes
    pub data: Vec<u8>,
    pub original_dimensions: (u32, u32),
    pub new_dimensions: (u32, u32),
    pub was_resized: bool,
}

impl PreparedImage {
    pub fn to_data_url(&self) -> String {
        format!(
            "data:image/webp;base64,{}",
            base64::engine::general_purpose::STANDARD.encode(&self.data)
        )
    }
}

/// Check if data starts with WebP magic bytes (RIFF....WEBP)
pub fn is_webp(data: &[u8]) -> bool {
    data.len() >= 12 && data[0..4] == *b"RIFF" && data[8..12] == *b"WEBP"
}

/// MIME type of `data`, rejecting anything that is not an image.
pub fn sniff_image_type(data: &[u8]) -> Result<&'static str, ImageError> {
    match infer::get(data) {
        Some(kind) if kind.matcher_type() == infer::MatcherType::Image => Ok(kind.mime_type()),
        Some(kind) => Err(ImageError::NotAnImage(kind.mime_type().to_string())),
        None => Err(ImageError::NotAnImage("unknown content".to_string())),
    }
}

/// Downscale to `max_dimension` on the longest side and encode as lossy WebP.
pub fn prepare_for_vision(data: &[u8], max_dimension: u32) -> Result<PreparedImage, ImageError> {
    let mime = sniff_image_type(data)?;
    log::debug!("preparing {} image ({} bytes)", mime, data.len());

    let img = image::load_from_memory(data)?;
    let (orig_w, orig_h) = img.dimensions();

    // Keep aspect ratio
    let (new_w, new_h, was_resized) = if orig_w > max_dimension || orig_h > max_dimension {
        let scale = (max_dimension as f64) / (orig_w.max(orig_h) as f64);
        let new_w = ((orig_w as f64) * scale).round() as u32;
        let new_h = ((orig_h as f64) * scale).round() as u32;
        (new_w.max(1), new_h.max(1), true)
    } else {
        (orig_w, orig_h, false)
    };

    let processed = if was_resized {
        img.resize(new_w, new_h, image::imageops::FilterType::Lanczos3)
    } else {
        img
    };

    let rgba = processed.to_rgba8();
    let (width, height) = rgba.dimensions();
    let encoded = webp::Encoder::from_rgba(&rgba, width, height).encode(VISION_QUALITY as f32);

    Ok(PreparedImage {
        data: encoded.to_vec(),
        original_dimensions: (orig_w, orig_h),
        new_dimensions: (width, height),
        was_resized,
    })
}
