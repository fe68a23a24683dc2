// ============================================================================
// File: src/llm_client.rs
// Chat-completion client with structured (function/tool call) extraction
// ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;

use crate::config::LlmConfig;
use crate::models::{
    ChatCompletionRequest, ChatCompletionResponse, FunctionDefinition, Message, ResponseMessage,
    ToolDefinition,
};

/// A schema the model is asked to answer with
#[derive(Debug, Clone)]
pub struct StructuredSchema {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system_prompt: Option<String>,
    pub messages: Vec<Message>,
    pub schema: Option<StructuredSchema>,
    pub max_tokens: usize,
    pub temperature: f32,
}

/// Raw arguments of a structured call, still to be parsed by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredCall {
    pub name: String,
    pub arguments: String,
}

#[derive(Debug, Clone, Default)]
pub struct ChatReply {
    pub text: Option<String>,
    pub structured: Option<StructuredCall>,
    pub tokens_used: usize,
}

#[async_trait]
pub trait ChatProvider: Send + Sync {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply>;
}

pub struct LLMClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl LLMClient {
    pub fn new(config: &LlmConfig) -> Self {
        Self {
            client: Client::new(),
            api_key: config.api_key.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
        }
    }

    async fn make_api_call(&self, request: &ChatCompletionRequest) -> Result<ChatCompletionResponse> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("Chat provider API key is not configured"))?;

        tracing::debug!(
            model = %self.model,
            temperature = request.temperature,
            max_tokens = request.max_tokens,
            structured = request.tools.is_some(),
            "calling chat completion"
        );

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            return Err(anyhow!(
                "API error for model '{}': HTTP {}\nResponse: {}",
                self.model,
                status,
                error_text
            ));
        }

        let response_text = response.text().await?;
        serde_json::from_str(&response_text).map_err(|e| {
            anyhow!(
                "Failed to parse response from model '{}': {}\nRaw response: {}",
                self.model,
                e,
                response_text
            )
        })
    }

    fn estimate_tokens(text: &str) -> usize {
        // Rough estimation: ~4 characters per token
        text.len() / 4
    }
}

#[async_trait]
impl ChatProvider for LLMClient {
    async fn complete(&self, request: ChatRequest) -> Result<ChatReply> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system_prompt) = request.system_prompt {
            messages.push(Message::system(system_prompt));
        }
        messages.extend(request.messages);

        let (tools, tool_choice) = match &request.schema {
            Some(schema) => (
                Some(vec![ToolDefinition {
                    kind: "function".to_string(),
                    function: FunctionDefinition {
                        name: schema.name.clone(),
                        description: schema.description.clone(),
                        parameters: schema.parameters.clone(),
                    },
                }]),
                Some(serde_json::json!({ "type": "function", "function": { "name": schema.name } })),
            ),
            None => (None, None),
        };

        let api_request = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            tools,
            tool_choice,
        };

        let response_data = self.make_api_call(&api_request).await?;
        let choice = response_data.choices.into_iter().next().ok_or_else(|| {
            anyhow!("Model '{}' returned no choices. Response may be empty.", self.model)
        })?;

        let reply = reply_from_message(choice.message);
        if reply.text.is_none() && reply.structured.is_none() {
            return Err(anyhow!("Model '{}' returned empty content.", self.model));
        }

        let tokens_used = response_data.usage.map(|u| u.total_tokens).unwrap_or_else(|| {
            Self::estimate_tokens(reply.text.as_deref().unwrap_or_default())
        });

        Ok(ChatReply { tokens_used, ..reply })
    }
}

/// Tool calls take precedence over the legacy `function_call` field
fn reply_from_message(message: ResponseMessage) -> ChatReply {
    let structured = message
        .tool_calls
        .into_iter()
        .next()
        .map(|call| call.function)
        .or(message.function_call)
        .map(|f| StructuredCall { name: f.name, arguments: f.arguments });

    ChatReply {
        text: message.content.filter(|c| !c.trim().is_empty()),
        structured,
        tokens_used: 0,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn client(base_url: String, api_key: Option<&str>) -> LLMClient {
        LLMClient::new(&LlmConfig {
            api_key: api_key.map(str::to_string),
            base_url,
            ..Default::default()
        })
    }

    fn request(schema: Option<StructuredSchema>) -> ChatRequest {
        ChatRequest {
            system_prompt: Some("You are a car advisor".to_string()),
            messages: vec![Message::user("I need a sedan")],
            schema,
            max_tokens: 100,
            temperature: 0.2,
        }
    }

    #[tokio::test]
    async fn test_plain_text_reply() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/chat/completions")
            .match_header("authorization", "Bearer sk-test")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "messages": [
                    { "role": "system", "content": "You are a car advisor" },
                    { "role": "user", "content": "I need a sedan" }
                ]
            })))
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"What is your budget?"}}],"usage":{"total_tokens":42}}"#)
            .create_async()
            .await;

        let actual = client(server.url(), Some("sk-test")).complete(request(None)).await.unwrap();

        mock.assert_async().await;
        assert_eq!(actual.text.as_deref(), Some("What is your budget?"));
        assert_eq!(actual.structured, None);
        assert_eq!(actual.tokens_used, 42);
    }

    #[tokio::test]
    async fn test_tool_call_reply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .match_body(mockito::Matcher::PartialJson(serde_json::json!({
                "tool_choice": { "type": "function", "function": { "name": "recommend_vehicles" } }
            })))
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"content":null,"tool_calls":[{"id":"c1","type":"function","function":{"name":"recommend_vehicles","arguments":"{\"vehicles\":[]}"}}]}}]}"#,
            )
            .create_async()
            .await;
        let schema = StructuredSchema {
            name: "recommend_vehicles".to_string(),
            description: "Pick vehicles".to_string(),
            parameters: serde_json::json!({ "type": "object" }),
        };

        let actual = client(server.url(), Some("k")).complete(request(Some(schema))).await.unwrap();

        let expected = StructuredCall {
            name: "recommend_vehicles".to_string(),
            arguments: r#"{"vehicles":[]}"#.to_string(),
        };
        assert_eq!(actual.text, None);
        assert_eq!(actual.structured, Some(expected));
    }

    #[tokio::test]
    async fn test_legacy_function_call_reply() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[{"message":{"content":"","function_call":{"name":"f","arguments":"{}"}}}]}"#)
            .create_async()
            .await;

        let actual = client(server.url(), Some("k")).complete(request(None)).await.unwrap();

        assert_eq!(actual.text, None);
        assert_eq!(actual.structured.map(|s| s.name), Some("f".to_string()));
    }

    #[tokio::test]
    async fn test_http_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(500)
            .with_body("overloaded")
            .create_async()
            .await;

        let actual = client(server.url(), Some("k")).complete(request(None)).await;

        assert!(actual.unwrap_err().to_string().contains("HTTP 500"));
    }

    #[tokio::test]
    async fn test_empty_choices_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(r#"{"choices":[]}"#)
            .create_async()
            .await;

        let actual = client(server.url(), Some("k")).complete(request(None)).await;

        assert!(actual.is_err());
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_calling() {
        let actual = client("http://127.0.0.1:9".to_string(), None).complete(request(None)).await;

        assert!(actual.unwrap_err().to_string().contains("not configured"));
    }
}
