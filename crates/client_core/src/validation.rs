use std::path::Path;

use shared::domain::MessageKind;

use crate::error::ValidationError;

const BLOCKED_EXTENSIONS: &[&str] = &[
    "exe", "bat", "cmd", "sh", "js", "msi", "scr", "com", "pif", "vbs",
];
const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "tiff", "svg"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "wmv", "flv", "webm", "mkv", "3gp"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "wav", "ogg", "m4a", "aac", "flac", "wma"];
const VOICE_FILE_PREFIX: &str = "voice_";

pub fn validate_text(content: &str) -> Result<&str, ValidationError> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::EmptyMessage);
    }
    Ok(trimmed)
}

/// Checks an attachment before any upload is attempted and returns the kind
/// the server will file it under.
pub fn validate_attachment(
    file_name: &str,
    size: u64,
    max_bytes: u64,
) -> Result<MessageKind, ValidationError> {
    if file_name.trim().is_empty() {
        return Err(ValidationError::MissingFileName);
    }
    if let Some(extension) = extension_of(file_name) {
        if BLOCKED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(ValidationError::BlockedFileType { extension });
        }
    }
    if size > max_bytes {
        return Err(ValidationError::FileTooLarge {
            size,
            limit: max_bytes,
        });
    }
    Ok(classify_attachment(file_name))
}

pub fn classify_attachment(file_name: &str) -> MessageKind {
    let Some(extension) = extension_of(file_name) else {
        return MessageKind::File;
    };
    let extension = extension.as_str();
    if IMAGE_EXTENSIONS.contains(&extension) {
        MessageKind::Image
    } else if VIDEO_EXTENSIONS.contains(&extension) {
        MessageKind::Video
    } else if AUDIO_EXTENSIONS.contains(&extension) {
        if file_name.to_ascii_lowercase().contains(VOICE_FILE_PREFIX) {
            MessageKind::Voice
        } else {
            MessageKind::Audio
        }
    } else {
        MessageKind::File
    }
}

/// File name for an uploaded voice clip; the `voice_` prefix is what makes the
/// server file it as a voice note rather than plain audio.
pub fn voice_file_name(mime_type: &str, unix_millis: i64) -> String {
    let essence = mime_type.split(';').next().unwrap_or_default().trim();
    let extension = match essence {
        "audio/ogg" => "ogg",
        "audio/wav" | "audio/x-wav" => "wav",
        "audio/mpeg" => "mp3",
        "audio/mp4" | "audio/aac" => "m4a",
        _ => "webm",
    };
    format!("{VOICE_FILE_PREFIX}{unix_millis}.{extension}")
}

fn extension_of(file_name: &str) -> Option<String> {
    Path::new(file_name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
}
