//! Extension to MIME type lookup for cloud uploads

use std::collections::HashMap;

/// Fallback for unknown or missing extensions
pub const OCTET_STREAM: &str = "application/octet-stream";

lazy_static::lazy_static! {
    static ref MIME_TYPES: HashMap<&'static str, &'static str> = HashMap::from([
        ("pdf", "application/pdf"),
        ("doc", "application/msword"),
        ("docx", "application/vnd.openxmlformats-officedocument.wordprocessingml.document"),
        ("xls", "application/vnd.ms-excel"),
        ("xlsx", "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"),
        ("ppt", "application/vnd.ms-powerpoint"),
        ("pptx", "application/vnd.openxmlformats-officedocument.presentationml.presentation"),
        ("txt", "text/plain"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("png", "image/png"),
        ("gif", "image/gif"),
        ("mp4", "video/mp4"),
        ("avi", "video/x-msvideo"),
        ("mkv", "video/x-matroska"),
        ("mp3", "audio/mpeg"),
        ("wav", "audio/wav"),
        ("zip", "application/zip"),
        ("rar", "application/x-rar-compressed"),
        ("7z", "application/x-7z-compressed"),
    ]);
}

/// MIME type for a file name, by its lowercased extension
pub fn mime_type_for(file_name: &str) -> &'static str {
    let Some((_, extension)) = file_name.rsplit_once('.') else {
        return OCTET_STREAM;
    };
    MIME_TYPES
        .get(extension.to_ascii_lowercase().as_str())
        .copied()
        .unwrap_or(OCTET_STREAM)
}
