//! Chat-completions wire types.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<RequestMessage<'a>>,
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<Thinking<'a>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Thinking<'a> {
    #[serde(rename = "type")]
    pub kind: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestMessage<'a> {
    pub role: &'static str,
    pub content: MessageContent<'a>,
}

/// Plain string for text turns, typed parts for image turns.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One streamed `chat.completion.chunk` event. Unknown fields are ignored.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CompletionChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChunkDelta {
    #[serde(default)]
    pub content: Option<String>,
}

impl CompletionChunk {
    /// `choices[0].delta.content`, if present.
    pub fn into_content(self) -> Option<String> {
        self.choices.into_iter().next()?.delta.content
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_request_shape() {
        let req = CompletionRequest {
            model: "m",
            messages: vec![RequestMessage {
                role: "user",
                content: MessageContent::Text("hello"),
            }],
            stream: true,
            thinking: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "model": "m",
                "messages": [{"role": "user", "content": "hello"}],
                "stream": true
            })
        );
    }

    #[test]
    fn image_request_shape() {
        let req = CompletionRequest {
            model: "m",
            messages: vec![RequestMessage {
                role: "user",
                content: MessageContent::Parts(vec![
                    ContentPart::Text { text: "what is this" },
                    ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: "data:image/jpeg;base64,AAAA".into(),
                        },
                    },
                ]),
            }],
            stream: true,
            thinking: Some(Thinking { kind: "disabled" }),
        };
        let value = serde_json::to_value(&req).unwrap();
        let parts = &value["messages"][0]["content"];
        assert_eq!(parts[0], serde_json::json!({"type": "text", "text": "what is this"}));
        assert_eq!(parts[1]["type"], "image_url");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/jpeg;base64,AAAA");
        assert_eq!(value["thinking"]["type"], "disabled");
    }

    #[test]
    fn chunk_content_extracted() {
        let chunk: CompletionChunk =
            serde_json::from_str(r#"{"id":"c1","choices":[{"index":0,"delta":{"content":"Hi"}}]}"#)
                .unwrap();
        assert_eq!(chunk.into_content().as_deref(), Some("Hi"));
    }

    #[test]
    fn chunk_without_choices_has_no_content() {
        let chunk: CompletionChunk = serde_json::from_str(r#"{"usage":{"total_tokens":3}}"#).unwrap();
        assert!(chunk.into_content().is_none());

        let chunk: CompletionChunk =
            serde_json::from_str(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap();
        assert!(chunk.into_content().is_none());
    }
}
