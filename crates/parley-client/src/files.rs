//! File-service collaborator.
//!
//! File conversion and blob storage live outside the client. The client
//! consumes them through [`FileService`] in two places: attaching files to a
//! message (missing text is extracted first) and refreshing expiring download
//! links inside a fetched transcript.

use std::time::Duration;

use async_trait::async_trait;
use parley_core::Result;
use parley_core::content::{FileDescriptor, Files};
use serde_json::Value;
use tracing::{debug, warn};

/// External file processing and storage.
#[async_trait]
pub trait FileService: Send + Sync {
    /// Extract plain text from `file`.
    async fn convert_to_text(&self, file: &FileDescriptor) -> Result<String>;

    /// Mint a download URL for the stored object `key`, valid for `ttl`.
    async fn get_secure_url(&self, key: &str, ttl: Duration) -> Result<String>;
}

/// Fill in `text` for every file that lacks it.
///
/// Conversion failures propagate; the message is not sent half-converted.
pub async fn extract_missing_text(files: Files, service: &dyn FileService) -> Result<Files> {
    let mut out = Vec::with_capacity(files.len());
    for mut file in files.into_inner() {
        if file.text.is_none() {
            debug!(name = %file.name, "converting file to text");
            file.text = Some(service.convert_to_text(&file).await?);
        }
        out.push(file);
    }
    Ok(Files::new(out))
}

/// Replace the `url` of every object in `transcript` that carries both a
/// string `key` and a string `url` with a freshly minted link.
///
/// Best effort: an entry whose refresh fails keeps its original URL.
/// Returns how many entries were refreshed.
pub async fn refresh_transcript_links(
    transcript: &mut Value,
    service: &dyn FileService,
    ttl: Duration,
) -> usize {
    let mut targets = Vec::new();
    collect_file_entries(transcript, String::new(), &mut targets);

    let mut refreshed = 0;
    for (pointer, key) in targets {
        match service.get_secure_url(&key, ttl).await {
            Ok(url) => {
                if let Some(Value::Object(entry)) = transcript.pointer_mut(&pointer) {
                    let _ = entry.insert("url".into(), Value::String(url));
                    refreshed += 1;
                }
            }
            Err(e) => warn!(key, error = %e, "file link refresh failed; keeping original"),
        }
    }
    refreshed
}

fn collect_file_entries(value: &Value, pointer: String, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            if let (Some(Value::String(key)), Some(Value::String(_))) = (map.get("key"), map.get("url")) {
                out.push((pointer.clone(), key.clone()));
            }
            for (name, child) in map {
                collect_file_entries(child, format!("{pointer}/{}", escape_token(name)), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_file_entries(child, format!("{pointer}/{i}"), out);
            }
        }
        _ => {}
    }
}

/// RFC 6901 reference token escaping.
fn escape_token(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
