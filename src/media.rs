//! Media type detection.
//!
//! The MIME type of an upload is detected once, from the first bytes of the
//! file with the extension as a fallback, and folded into a [`MediaKind`]
//! that carries the metadata each kind needs: pixel dimensions for images,
//! duration for audio and video.

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Bytes read from the head of a file for sniffing and dimension parsing.
const SNIFF_LEN: usize = 64 * 1024;

/// Fallback when nothing else matches.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Shape of an uploaded file, selected once from its MIME type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, utoipa::ToSchema)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MediaKind {
    Image { width: u32, height: u32 },
    Video { duration_secs: u64, supports_streaming: bool },
    Audio { duration_secs: u64 },
    Document,
}

impl MediaKind {
    /// Short lowercase name of the variant.
    pub fn label(&self) -> &'static str {
        match self {
            MediaKind::Image { .. } => "image",
            MediaKind::Video { .. } => "video",
            MediaKind::Audio { .. } => "audio",
            MediaKind::Document => "document",
        }
    }

    /// Inspect the file at `path` and build its kind from `mime`.
    ///
    /// Missing metadata (unreadable image header, no `ffprobe`) degrades to
    /// zeros rather than failing the upload.
    pub async fn probe(path: &Path, mime: &str) -> Self {
        if mime.starts_with("image/") {
            let head = read_head(path).await.unwrap_or_default();
            let (width, height) = image_dimensions(&head).unwrap_or((0, 0));
            MediaKind::Image { width, height }
        } else if mime.starts_with("video/") {
            MediaKind::Video {
                duration_secs: probe_duration(path).await,
                supports_streaming: true,
            }
        } else if mime.starts_with("audio/") {
            MediaKind::Audio {
                duration_secs: probe_duration(path).await,
            }
        } else {
            MediaKind::Document
        }
    }
}

/// Detect the MIME type of the file at `path`, named `file_name` by the client.
pub async fn detect_mime(path: &Path, file_name: &str) -> std::io::Result<String> {
    let head = read_head(path).await?;
    let mime = sniff_mime(&head)
        .or_else(|| mime_from_extension(file_name))
        .unwrap_or(OCTET_STREAM);
    Ok(mime.to_string())
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

/// Identify well-known formats by their magic bytes.
pub fn sniff_mime(head: &[u8]) -> Option<&'static str> {
    const SIGNATURES: &[(&[u8], &str)] = &[
        (b"\x89PNG\r\n\x1a\n", "image/png"),
        (b"\xff\xd8\xff", "image/jpeg"),
        (b"GIF87a", "image/gif"),
        (b"GIF89a", "image/gif"),
        (b"%PDF-", "application/pdf"),
        (b"ID3", "audio/mpeg"),
        (b"fLaC", "audio/flac"),
        (b"OggS", "audio/ogg"),
        (b"\x1a\x45\xdf\xa3", "video/x-matroska"),
        (b"PK\x03\x04", "application/zip"),
        (b"\x1f\x8b", "application/gzip"),
    ];
    for (magic, mime) in SIGNATURES {
        if head.starts_with(magic) {
            return Some(mime);
        }
    }

    if head.len() >= 12 && &head[0..4] == b"RIFF" {
        return match &head[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }

    // ISO base media: size(4) "ftyp" brand(4)
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"qt  " => Some("video/quicktime"),
            b"M4A " => Some("audio/mp4"),
            _ => Some("video/mp4"),
        };
    }

    // MPEG audio frame sync without an ID3 tag.
    if head.len() >= 2 && head[0] == 0xff && head[1] & 0xe0 == 0xe0 {
        return Some("audio/mpeg");
    }
    None
}

/// Guess a MIME type from the file extension.
pub fn mime_from_extension(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()?
        .to_str()?
        .to_ascii_lowercase();
    let mime = match ext.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" | "oga" => "audio/ogg",
        "wav" => "audio/wav",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "txt" | "log" => "text/plain",
        "json" => "application/json",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        _ => return None,
    };
    Some(mime)
}

/// Read pixel dimensions from a PNG, GIF or JPEG header.
pub fn image_dimensions(head: &[u8]) -> Option<(u32, u32)> {
    if head.starts_with(b"\x89PNG\r\n\x1a\n") && head.len() >= 24 && &head[12..16] == b"IHDR" {
        let width = u32::from_be_bytes(head[16..20].try_into().ok()?);
        let height = u32::from_be_bytes(head[20..24].try_into().ok()?);
        return Some((width, height));
    }
    if head.starts_with(b"GIF8") && head.len() >= 10 {
        let width = u16::from_le_bytes([head[6], head[7]]) as u32;
        let height = u16::from_le_bytes([head[8], head[9]]) as u32;
        return Some((width, height));
    }
    if head.starts_with(b"\xff\xd8") {
        return jpeg_dimensions(head);
    }
    None
}

/// Walk JPEG segments until a start-of-frame marker.
fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut pos = 2;
    while pos + 4 <= data.len() {
        if data[pos] != 0xff {
            return None;
        }
        let marker = data[pos + 1];
        // Fill bytes and standalone markers carry no length.
        if marker == 0xff {
            pos += 1;
            continue;
        }
        if marker == 0x01 || (0xd0..=0xd7).contains(&marker) {
            pos += 2;
            continue;
        }
        let seg_len = u16::from_be_bytes([data[pos + 2], data[pos + 3]]) as usize;
        let is_sof = matches!(marker, 0xc0..=0xcf) && !matches!(marker, 0xc4 | 0xc8 | 0xcc);
        if is_sof {
            if pos + 9 > data.len() {
                return None;
            }
            let height = u16::from_be_bytes([data[pos + 5], data[pos + 6]]) as u32;
            let width = u16::from_be_bytes([data[pos + 7], data[pos + 8]]) as u32;
            return Some((width, height));
        }
        pos += 2 + seg_len;
    }
    None
}

/// Duration in whole seconds via `ffprobe`, or 0 when it cannot be read.
pub async fn probe_duration(path: &Path) -> u64 {
    let output = tokio::process::Command::new("ffprobe")
        .args(["-v", "quiet", "-show_entries", "format=duration", "-of", "csv=p=0"])
        .arg(path)
        .output()
        .await;
    match output {
        Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout)
            .trim()
            .parse::<f64>()
            .map(|secs| secs.max(0.0) as u64)
            .unwrap_or(0),
        Ok(out) => {
            debug!("ffprobe exited with {} for {}", out.status, path.display());
            0
        }
        Err(e) => {
            debug!("ffprobe unavailable: {}", e);
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png_header(width: u32, height: u32) -> Vec<u8> {
        let mut v = b"\x89PNG\r\n\x1a\n".to_vec();
        v.extend_from_slice(&13u32.to_be_bytes());
        v.extend_from_slice(b"IHDR");
        v.extend_from_slice(&width.to_be_bytes());
        v.extend_from_slice(&height.to_be_bytes());
        v.extend_from_slice(&[8, 6, 0, 0, 0]);
        v
    }

    #[test]
    fn test_sniff_common_formats() {
        assert_eq!(sniff_mime(&png_header(1, 1)), Some("image/png"));
        assert_eq!(sniff_mime(b"GIF89a\x01\x00\x01\x00"), Some("image/gif"));
        assert_eq!(sniff_mime(b"%PDF-1.7\n"), Some("application/pdf"));
        assert_eq!(sniff_mime(b"\x00\x00\x00\x18ftypmp42\x00\x00"), Some("video/mp4"));
        assert_eq!(sniff_mime(b"RIFF\x00\x00\x00\x00WAVEfmt "), Some("audio/wav"));
        assert_eq!(sniff_mime(b"hello world"), None);
    }

    #[test]
    fn test_extension_fallback() {
        assert_eq!(mime_from_extension("movie.MKV"), Some("video/x-matroska"));
        assert_eq!(mime_from_extension("notes.txt"), Some("text/plain"));
        assert_eq!(mime_from_extension("noext"), None);
        assert_eq!(mime_from_extension("weird.xyz"), None);
    }

    #[test]
    fn test_png_and_gif_dimensions() {
        assert_eq!(image_dimensions(&png_header(640, 480)), Some((640, 480)));
        assert_eq!(
            image_dimensions(b"GIF89a\x20\x03\x58\x02rest"),
            Some((800, 600))
        );
    }

    #[test]
    fn test_jpeg_dimensions_skip_app_segments() {
        let mut jpeg = vec![0xff, 0xd8];
        // APP0 segment, length 16
        jpeg.extend_from_slice(&[0xff, 0xe0, 0x00, 0x10]);
        jpeg.extend_from_slice(&[0u8; 14]);
        // SOF0: len, precision, height, width
        jpeg.extend_from_slice(&[0xff, 0xc0, 0x00, 0x11, 0x08, 0x01, 0xe0, 0x02, 0x80]);
        assert_eq!(image_dimensions(&jpeg), Some((640, 480)));
    }

    #[tokio::test]
    async fn test_detect_mime_prefers_content_over_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upload.txt");
        std::fs::write(&path, png_header(2, 3)).unwrap();
        assert_eq!(detect_mime(&path, "upload.txt").await.unwrap(), "image/png");

        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"just text").unwrap();
        assert_eq!(detect_mime(&plain, "readme.txt").await.unwrap(), "text/plain");
        assert_eq!(detect_mime(&plain, "blob").await.unwrap(), OCTET_STREAM);
    }

    #[tokio::test]
    async fn test_probe_image_and_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pic.png");
        std::fs::write(&path, png_header(10, 20)).unwrap();
        assert_eq!(
            MediaKind::probe(&path, "image/png").await,
            MediaKind::Image { width: 10, height: 20 }
        );
        assert_eq!(
            MediaKind::probe(&path, "application/pdf").await,
            MediaKind::Document
        );
    }

    #[test]
    fn test_serialized_shape() {
        let json = serde_json::to_value(MediaKind::Audio { duration_secs: 5 }).unwrap();
        assert_eq!(json["kind"], "audio");
        assert_eq!(json["duration_secs"], 5);
        assert_eq!(MediaKind::Document.label(), "document");
    }
}
