use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{LlmRequest, LlmResponse};

/// One file per key under `<dir>/<model name sanitized>/<hash>.json`.
/// Content is deterministic in the key, so concurrent writers of the same
/// entry are tolerated.
pub struct DiskCache {
    dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry {
    key: String,
    value: LlmResponse,
    created_at: String,
}

impl DiskCache {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    /// A corrupt or unreadable entry is a miss, never an error.
    #[must_use]
    pub fn get(&self, model_name: &str, key: &str) -> Option<LlmResponse> {
        let path = self.entry_path(model_name, key);
        let text = std::fs::read_to_string(path).ok()?;
        let entry: CacheEntry = serde_json::from_str(&text).ok()?;
        Some(entry.value)
    }

    pub fn put(&self, model_name: &str, key: &str, value: &LlmResponse) -> anyhow::Result<()> {
        let path = self.entry_path(model_name, key);
        let parent = path.parent().expect("cache entry has parent");
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create cache dir: {}", parent.display()))?;
        let entry = CacheEntry {
            key: key.to_string(),
            value: value.clone(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let text = serde_json::to_string(&entry).context("serialize cache entry")?;
        std::fs::write(&path, text)
            .with_context(|| format!("write cache entry: {}", path.display()))?;
        Ok(())
    }

    fn entry_path(&self, model_name: &str, key: &str) -> PathBuf {
        self.dir
            .join(sanitize_filename(model_name))
            .join(format!("{key}.json"))
    }
}

/// Stable hash of the canonicalized request payload, provider id included.
#[must_use]
pub fn request_key(provider_id: &str, request: &LlmRequest) -> String {
    let payload = serde_json::json!({
        "provider": provider_id,
        "model": request.model.name,
        "messages": request.messages,
        "temperature": request.model.temperature,
        "topP": request.model.top_p,
        "maxOutputTokens": request.model.max_output_tokens,
        "responseFormat": request.response_format,
    });
    sha256_hex(&payload.to_string())
}

#[must_use]
pub fn sha256_hex(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

fn sanitize_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for ch in name.chars() {
        match ch {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' | ' ' => out.push('_'),
            _ => out.push(ch),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Usage;

    fn response(text: &str) -> LlmResponse {
        LlmResponse {
            text: text.to_string(),
            usage: Usage::default(),
            raw: serde_json::json!({}),
        }
    }

    #[test]
    fn round_trips_an_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().to_path_buf());
        assert!(cache.get("gpt-4o mini", "abc").is_none());
        cache.put("gpt-4o mini", "abc", &response("hello")).expect("put");
        let hit = cache.get("gpt-4o mini", "abc").expect("hit");
        assert_eq!(hit.text, "hello");
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cache = DiskCache::new(dir.path().to_path_buf());
        cache.put("m", "k", &response("x")).expect("put");
        let path = dir.path().join("m").join("k.json");
        std::fs::write(&path, "{not json").expect("corrupt");
        assert!(cache.get("m", "k").is_none());
    }

    #[test]
    fn sanitizes_model_directory_names() {
        assert_eq!(sanitize_filename("openai/gpt-4o:latest"), "openai_gpt-4o_latest");
    }
}
