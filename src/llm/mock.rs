use once_cell::sync::Lazy;
use regex::Regex;

use crate::record::Usage;

use super::{LlmError, LlmRequest, LlmResponse, Role};

static WS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("ws regex"));

/// Deterministic offline provider: maps Japanese punctuation in the last
/// user message to its ASCII counterpart. No network, stable outputs.
pub struct MockProvider;

impl MockProvider {
    pub fn chat(&self, request: &LlmRequest) -> Result<LlmResponse, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or_default();

        let mut mapped = String::with_capacity(last_user.len());
        for ch in last_user.chars() {
            match ch {
                '。' => mapped.push_str(". "),
                '、' => mapped.push_str(", "),
                '！' => mapped.push_str("! "),
                '？' => mapped.push_str("? "),
                c => mapped.push(c),
            }
        }
        let text = WS_RE.replace_all(mapped.trim(), " ").into_owned();

        let prompt: usize = request
            .messages
            .iter()
            .map(|m| m.content.split_whitespace().count())
            .sum();
        let completion = text.split_whitespace().count();
        Ok(LlmResponse {
            text,
            usage: Usage {
                prompt: prompt as u32,
                completion: completion as u32,
                total: (prompt + completion) as u32,
            },
            raw: serde_json::json!({ "provider": "mock" }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{ChatMessage, ModelSpec, ProviderKind, ResponseFormat};

    fn request(messages: Vec<ChatMessage>) -> LlmRequest {
        LlmRequest {
            model: ModelSpec {
                provider: ProviderKind::Mock,
                name: "mock".into(),
                temperature: None,
                top_p: None,
                max_output_tokens: None,
                json_mode: None,
            },
            messages,
            response_format: ResponseFormat::Text,
        }
    }

    #[test]
    fn maps_punctuation_and_trims() {
        let resp = MockProvider
            .chat(&request(vec![
                ChatMessage::system("instructions"),
                ChatMessage::user("こんにちは、世界。"),
            ]))
            .expect("chat");
        assert_eq!(resp.text, "こんにちは, 世界.");
    }

    #[test]
    fn uses_last_user_message_and_collapses_whitespace() {
        let resp = MockProvider
            .chat(&request(vec![
                ChatMessage::user("ignored"),
                ChatMessage::user("  どこ？  ここ！  "),
            ]))
            .expect("chat");
        assert_eq!(resp.text, "どこ? ここ!");
    }

    #[test]
    fn output_is_stable() {
        let a = MockProvider
            .chat(&request(vec![ChatMessage::user("鍵はここ。")]))
            .expect("chat");
        let b = MockProvider
            .chat(&request(vec![ChatMessage::user("鍵はここ。")]))
            .expect("chat");
        assert_eq!(a.text, b.text);
        assert_eq!(a.text, "鍵はここ.");
        assert_eq!(a.usage.total, b.usage.total);
    }
}
