//! MIME type detection and bucket MIME policy matching.
//!
//! Detection order for uploads without a declared content type: magic
//! numbers in the first bytes, then the filename extension, then
//! `application/octet-stream`.

/// Fallback content type.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Magic-number table: (offset, prefix, content type).
const MAGIC: &[(usize, &[u8], &str)] = &[
    (0, b"\x89PNG\r\n\x1a\n", "image/png"),
    (0, b"\xff\xd8\xff", "image/jpeg"),
    (0, b"GIF87a", "image/gif"),
    (0, b"GIF89a", "image/gif"),
    (0, b"%PDF-", "application/pdf"),
    (0, b"PK\x03\x04", "application/zip"),
    (0, b"\x1f\x8b", "application/gzip"),
    (0, b"BM", "image/bmp"),
    (0, b"OggS", "audio/ogg"),
    (0, b"\x00\x00\x00\x1cftyp", "video/mp4"),
    (0, b"ID3", "audio/mpeg"),
    (8, b"WEBP", "image/webp"),
    (8, b"WAVE", "audio/wav"),
];

/// Extension table consulted when sniffing finds nothing.
const EXTENSIONS: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("css", "text/css"),
    ("csv", "text/csv"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("bmp", "image/bmp"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("ogg", "audio/ogg"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("wasm", "application/wasm"),
];

/// Detect a content type from leading bytes and the object name.
pub fn detect(data: &[u8], name: &str) -> String {
    for (offset, prefix, mime) in MAGIC {
        if data.len() >= offset + prefix.len() && &data[*offset..offset + prefix.len()] == *prefix {
            return (*mime).to_string();
        }
    }

    if let Some(ext) = name.rsplit('.').next() {
        let ext = ext.to_ascii_lowercase();
        for (known, mime) in EXTENSIONS {
            if ext == *known {
                return (*mime).to_string();
            }
        }
    }

    OCTET_STREAM.to_string()
}

/// Check a content type against a bucket's allowed patterns.
///
/// A pattern ending in `*` matches by prefix after trimming the `*`
/// (`image/*` matches `image/png`, `*` matches everything); any other
/// pattern is an exact match.  Parameters after `;` in the candidate
/// are ignored.
pub fn is_allowed(content_type: &str, patterns: &[String]) -> bool {
    let candidate = content_type
        .split(';')
        .next()
        .unwrap_or(content_type)
        .trim();

    patterns.iter().any(|pattern| {
        let pattern = pattern.trim();
        if let Some(prefix) = pattern.strip_suffix('*') {
            candidate.starts_with(prefix)
        } else {
            candidate == pattern
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────
