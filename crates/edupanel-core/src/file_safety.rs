//! Upload safety checks applied before an attachment reaches a store.
//!
//! Blocks empty and oversized files, executable extensions, and executable
//! magic bytes. Also derives the content type and storage extension used in
//! attachment references.

use once_cell::sync::Lazy;
use std::collections::HashSet;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::AttachmentFile;

/// Magic byte signatures for executable files
pub const MAGIC_SIGNATURES: &[(&str, &[u8])] = &[
    ("Windows PE/MZ", &[0x4D, 0x5A]),
    ("ELF", &[0x7F, 0x45, 0x4C, 0x46]),
    ("Mach-O 32", &[0xFE, 0xED, 0xFA, 0xCE]),
    ("Mach-O 64", &[0xFE, 0xED, 0xFA, 0xCF]),
    ("Mach-O Fat / Java Class", &[0xCA, 0xFE, 0xBA, 0xBE]),
    ("WebAssembly", &[0x00, 0x61, 0x73, 0x6D]),
];

/// Blocked file extensions (case-insensitive)
static BLOCKED_EXTENSIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "exe", "dll", "scr", "pif", "com", "msi", "bat", "cmd", "ps1", "sh", "so", "dylib",
        "jar", "class", "apk", "app", "dmg", "deb", "rpm", "docm", "xlsm", "pptm", "lnk",
        "hta", "reg",
    ]
    .into_iter()
    .collect()
});

/// Reject files that must never be stored as an attachment.
///
/// Returns `Error::InvalidInput` describing the first rule that failed.
pub fn check_attachment(file: &AttachmentFile, max_size_bytes: u64) -> Result<()> {
    if file.data.is_empty() {
        return Err(Error::InvalidInput(format!(
            "attachment {} is empty",
            file.filename
        )));
    }

    if file.data.len() as u64 > max_size_bytes {
        return Err(Error::InvalidInput(format!(
            "attachment {} exceeds maximum size of {} bytes",
            file.filename, max_size_bytes
        )));
    }

    if let Some(ext) = extension_of(&file.filename) {
        if BLOCKED_EXTENSIONS.contains(ext.as_str()) {
            debug!(filename = %file.filename, ext = %ext, "file_safety: blocked extension");
            return Err(Error::InvalidInput(format!(
                "file extension .{} is not allowed",
                ext
            )));
        }
    }

    for (name, magic) in MAGIC_SIGNATURES {
        if file.data.starts_with(magic) {
            debug!(filename = %file.filename, signature = name, "file_safety: executable content");
            return Err(Error::InvalidInput(format!(
                "executable file detected: {}",
                name
            )));
        }
    }

    Ok(())
}

/// Detect the real content type of an upload.
///
/// Magic bytes win; text formats without magic bytes fall back to the
/// extension; otherwise the claimed type is kept unless it claims a binary
/// media type the bytes do not match.
pub fn detect_content_type(filename: &str, data: &[u8], claimed: &str) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.mime_type().to_string();
    }

    if let Some(mime) = extension_of(filename).and_then(|ext| text_mime_from_extension(&ext)) {
        return mime.to_string();
    }

    if claimed.starts_with("image/")
        || claimed.starts_with("audio/")
        || claimed.starts_with("video/")
        || claimed == "application/pdf"
    {
        return "application/octet-stream".to_string();
    }

    claimed.to_string()
}

fn text_mime_from_extension(ext: &str) -> Option<&'static str> {
    match ext {
        "txt" => Some("text/plain"),
        "csv" => Some("text/csv"),
        "md" | "markdown" => Some("text/markdown"),
        "html" | "htm" => Some("text/html"),
        "json" => Some("application/json"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// Extension to store an upload under: detected from magic bytes, then taken
/// from the filename when it is short and alphanumeric, else `bin`.
pub fn storage_extension(filename: &str, data: &[u8]) -> String {
    if let Some(kind) = infer::get(data) {
        return kind.extension().to_string();
    }
    match extension_of(filename) {
        Some(ext) if ext.len() <= 10 && ext.chars().all(|c| c.is_ascii_alphanumeric()) => ext,
        _ => "bin".to_string(),
    }
}

/// Sanitize filename for safe storage
pub fn sanitize_filename(filename: &str) -> String {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);

    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '|' | '?' | '*' | '\0' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim();
    if sanitized.is_empty() || sanitized == "." || sanitized == ".." {
        return "unnamed_file".to_string();
    }

    sanitized.chars().take(255).collect()
}

fn extension_of(filename: &str) -> Option<String> {
    let name = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
    let (stem, ext) = name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: [u8; 8] = [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

    #[test]
    fn test_accepts_regular_image() {
        let file = AttachmentFile::new("cover.png", "image/png", PNG.to_vec());
        assert!(check_attachment(&file, 1024).is_ok());
    }

    #[test]
    fn test_rejects_empty_and_oversized() {
        let empty = AttachmentFile::new("cover.png", "image/png", Vec::new());
        assert!(check_attachment(&empty, 1024).is_err());

        let big = AttachmentFile::new("paper.pdf", "application/pdf", vec![b'a'; 2048]);
        let err = check_attachment(&big, 1024).unwrap_err();
        assert!(err.to_string().contains("maximum size"));
    }

    #[test]
    fn test_rejects_blocked_extension_case_insensitive() {
        let file = AttachmentFile::new("setup.EXE", "application/octet-stream", b"hello".to_vec());
        assert!(check_attachment(&file, 1024).is_err());
    }

    #[test]
    fn test_rejects_executable_magic_under_innocent_name() {
        let file = AttachmentFile::new("logo.png", "image/png", vec![0x7F, 0x45, 0x4C, 0x46, 0x02]);
        let err = check_attachment(&file, 1024).unwrap_err();
        assert!(err.to_string().contains("ELF"));
    }

    #[test]
    fn test_detect_overrides_wrong_claim() {
        assert_eq!(detect_content_type("image.txt", &PNG, "text/plain"), "image/png");
    }

    #[test]
    fn test_detect_downgrades_fake_binary_claim() {
        assert_eq!(
            detect_content_type("photo.jpg", b"not really a jpeg", "image/jpeg"),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_detect_text_by_extension() {
        assert_eq!(
            detect_content_type("notes.md", b"# Syllabus", "application/octet-stream"),
            "text/markdown"
        );
    }

    #[test]
    fn test_storage_extension() {
        assert_eq!(storage_extension("whatever.bin", &PNG), "png");
        assert_eq!(storage_extension("notes.MD", b"# hi"), "md");
        assert_eq!(storage_extension("weird.ex$e", b"data"), "bin");
        assert_eq!(storage_extension("noext", b"data"), "bin");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("C:\\docs\\exam?.pdf"), "exam_.pdf");
        assert_eq!(sanitize_filename("   "), "unnamed_file");
        assert_eq!(sanitize_filename(".."), "unnamed_file");
    }
}
