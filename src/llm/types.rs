use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    pub contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Content {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub text: String,
    #[serde(skip_serializing_if = "is_false", default)]
    pub thought: bool,
}

fn is_false(v: &bool) -> bool {
    !*v
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub response_mime_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct GenerateResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub usage_metadata: Option<UsageMetadata>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UsageMetadata {
    #[serde(default)]
    pub prompt_token_count: u64,
    #[serde(default)]
    pub candidates_token_count: u64,
    #[serde(default)]
    pub total_token_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub block_reason: String,
}

impl GenerateRequest {
    pub fn single_turn(prompt: &str, config: GenerationConfig) -> Self {
        Self {
            contents: vec![Content {
                role: "user".to_string(),
                parts: vec![Part {
                    text: prompt.to_string(),
                    thought: false,
                }],
            }],
            generation_config: Some(config),
        }
    }
}

impl GenerateResponse {
    /// 第一个候选的可见文本（跳过 thought 片段）。
    pub fn text(&self) -> String {
        let Some(content) = self.candidates.first().and_then(|c| c.content.as_ref()) else {
            return String::new();
        };
        let mut out = String::new();
        for p in &content.parts {
            if p.thought {
                continue;
            }
            out.push_str(&p.text);
        }
        out
    }

    pub fn total_tokens(&self) -> Option<u64> {
        let usage = self.usage_metadata.as_ref()?;
        if usage.total_token_count > 0 {
            return Some(usage.total_token_count);
        }
        let sum = usage.prompt_token_count + usage.candidates_token_count;
        (sum > 0).then_some(sum)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_text_skips_thoughts_and_reads_usage() {
        let body = r#"{
            "candidates": [{
                "content": {"role": "model", "parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "[{\"id\":\"p1\"}]"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 120, "candidatesTokenCount": 30, "totalTokenCount": 150}
        }"#;
        let resp: GenerateResponse = sonic_rs::from_str(body).unwrap();
        assert_eq!(resp.text(), "[{\"id\":\"p1\"}]");
        assert_eq!(resp.total_tokens(), Some(150));
    }

    #[test]
    fn total_tokens_falls_back_to_the_sum() {
        let body = r#"{"candidates": [], "usageMetadata": {"promptTokenCount": 10, "candidatesTokenCount": 5}}"#;
        let resp: GenerateResponse = sonic_rs::from_str(body).unwrap();
        assert_eq!(resp.text(), "");
        assert_eq!(resp.total_tokens(), Some(15));
    }

    #[test]
    fn request_serializes_in_camel_case() {
        let req = GenerateRequest::single_turn(
            "hi",
            GenerationConfig {
                temperature: 0.2,
                max_output_tokens: 64,
                response_mime_type: String::new(),
            },
        );
        let s = sonic_rs::to_string(&req).unwrap();
        assert!(s.contains("\"generationConfig\""));
        assert!(s.contains("\"maxOutputTokens\":64"));
        assert!(!s.contains("responseMimeType"));
    }
}
