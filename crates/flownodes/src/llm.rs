use crate::prompt::{check_template, load_template, render};
use async_trait::async_trait;
use flowcore::{Tool, ToolContext, ToolDefinition, ToolError, ToolOutput, ToolType, Value};
use flowruntime::ToolFactory;
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const ROLES: [&str; 4] = ["system", "user", "assistant", "function"];

/// Request parameters passed through to the API rather than into the template.
const PARAMETERS: [&str; 7] = [
    "model",
    "deployment_name",
    "temperature",
    "max_tokens",
    "top_p",
    "stop",
    "api_version",
];

/// Split a rendered chat prompt on `role:` lines (optionally `# role:`).
/// Text without any role marker becomes a single user message.
pub fn parse_chat(prompt: &str) -> Vec<Value> {
    let mut messages = Vec::new();
    let mut role: Option<&str> = None;
    let mut content = String::new();

    let mut flush = |role: Option<&str>, content: &mut String| {
        if let Some(role) = role {
            messages.push(json!({"role": role, "content": content.trim()}));
        }
        content.clear();
    };

    for line in prompt.lines() {
        let marker = line
            .trim()
            .trim_start_matches('#')
            .trim()
            .strip_suffix(':')
            .map(|r| r.trim().to_ascii_lowercase());
        match marker.as_deref().and_then(|m| ROLES.iter().copied().find(|r| *r == m)) {
            Some(next) => {
                flush(role, &mut content);
                role = Some(next);
            }
            None => {
                content.push_str(line);
                content.push('\n');
            }
        }
    }
    if role.is_none() {
        let text = content.trim().to_string();
        return vec![json!({"role": "user", "content": text})];
    }
    flush(role, &mut content);
    messages
}

/// Chat completion over an OpenAI-compatible endpoint
pub struct LlmTool {
    definition: ToolDefinition,
    template: Option<String>,
    client: reqwest::Client,
}

impl LlmTool {
    /// The connection object handed in by the resolver.
    fn connection<'a>(&self, inputs: &'a HashMap<String, Value>) -> Result<&'a serde_json::Map<String, Value>, ToolError> {
        let by_name = inputs.get("connection").and_then(Value::as_object);
        let by_schema = || {
            self.definition
                .connection_inputs()
                .find_map(|name| inputs.get(name).and_then(Value::as_object))
        };
        by_name
            .or_else(by_schema)
            .ok_or_else(|| ToolError::MissingInput("connection".to_string()))
    }

    fn build_request(&self, inputs: &HashMap<String, Value>) -> Result<(String, Value), ToolError> {
        let connection = self.connection(inputs)?;
        let api_base = connection
            .get("api_base")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::Configuration("connection has no api_base".to_string()))?;

        let template = match &self.template {
            Some(template) => template.clone(),
            None => inputs
                .get("prompt")
                .and_then(Value::as_str)
                .map(String::from)
                .ok_or_else(|| ToolError::MissingInput("prompt".to_string()))?,
        };
        let variables: HashMap<String, Value> = inputs
            .iter()
            .filter(|(k, _)| {
                k.as_str() != "prompt"
                    && !PARAMETERS.contains(&k.as_str())
                    && !self.is_connection_input(k)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let rendered = render(&template, &variables)?;

        let mut body = json!({ "messages": parse_chat(&rendered) });
        let model = inputs
            .get("model")
            .or_else(|| inputs.get("deployment_name"))
            .cloned();
        if let Some(model) = model {
            body["model"] = model;
        }
        for key in ["temperature", "max_tokens", "top_p", "stop"] {
            if let Some(value) = inputs.get(key).filter(|v| !v.is_null()) {
                body[key] = value.clone();
            }
        }
        let url = format!("{}/chat/completions", api_base.trim_end_matches('/'));
        Ok((url, body))
    }

    fn is_connection_input(&self, name: &str) -> bool {
        name == "connection" || self.definition.connection_inputs().any(|c| c == name)
    }
}

#[async_trait]
impl Tool for LlmTool {
    fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    async fn invoke(&self, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let (url, body) = self.build_request(&ctx.inputs)?;
        let connection = self.connection(&ctx.inputs)?;
        ctx.events.info(format!("POST {}", url));

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = connection.get("api_key").and_then(Value::as_str) {
            request = request.bearer_auth(key).header("api-key", key);
        }
        if let Some(version) = connection.get("api_version").and_then(Value::as_str) {
            request = request.query(&[("api-version", version)]);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("LLM request failed: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ToolError::ExecutionFailed(format!("LLM API error ({}): {}", status, text)));
        }
        let reply: Value = response
            .json()
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to parse response: {}", e)))?;

        let content = reply["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| ToolError::ExecutionFailed("response has no message content".to_string()))?
            .to_string();
        let mut output = ToolOutput::new(content);
        if let Some(usage) = reply.get("usage").and_then(Value::as_object) {
            for (name, value) in usage {
                output = output.with_metric(name.clone(), value.clone());
            }
        }
        Ok(output)
    }
}

pub struct LlmToolFactory {
    client: reqwest::Client,
}

impl LlmToolFactory {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for LlmToolFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolFactory for LlmToolFactory {
    fn tool_type(&self) -> ToolType {
        ToolType::Llm
    }

    fn create(&self, definition: &ToolDefinition, working_dir: &Path) -> Result<Arc<dyn Tool>, ToolError> {
        // Without code or source the template comes from the `prompt` input.
        let template = if definition.code.is_some() || definition.source.is_some() {
            let template = load_template(definition, working_dir)?;
            check_template(&definition.name, &template)?;
            Some(template)
        } else {
            None
        };
        Ok(Arc::new(LlmTool {
            definition: definition.clone(),
            template,
            client: self.client.clone(),
        }))
    }

    fn description(&self) -> &str {
        "Chat completions over an OpenAI-compatible API"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_prompt_splits_on_roles() {
        let messages = parse_chat("# system:\nBe brief.\n\nuser:\nWhat is 2+2?\nAssistant:\n4\n");
        assert_eq!(
            messages,
            vec![
                json!({"role": "system", "content": "Be brief."}),
                json!({"role": "user", "content": "What is 2+2?"}),
                json!({"role": "assistant", "content": "4"}),
            ]
        );
        assert_eq!(parse_chat("just text"), vec![json!({"role": "user", "content": "just text"})]);
    }

    #[test]
    fn request_uses_connection_and_renders_template() {
        let inputs = HashMap::from([
            (
                "connection".to_string(),
                json!({"api_base": "https://example.test/v1/", "api_key": "k"}),
            ),
            ("topic".to_string(), json!("cats")),
            ("model".to_string(), json!("gpt-test")),
            ("temperature".to_string(), json!(0.2)),
        ]);

        let llm = LlmTool {
            definition: ToolDefinition::new("joke.jinja2", ToolType::Llm),
            template: Some("system:\nYou tell jokes.\nuser:\nA joke about {{ topic }}".to_string()),
            client: reqwest::Client::new(),
        };
        let (url, body) = llm.build_request(&inputs).unwrap();
        assert_eq!(url, "https://example.test/v1/chat/completions");
        assert_eq!(body["model"], json!("gpt-test"));
        assert_eq!(body["temperature"], json!(0.2));
        assert_eq!(body["messages"][1]["content"], json!("A joke about cats"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn missing_connection_is_reported() {
        let llm = LlmTool {
            definition: ToolDefinition::new("chat", ToolType::Llm),
            template: None,
            client: reqwest::Client::new(),
        };
        let inputs = HashMap::from([("prompt".to_string(), json!("hi"))]);
        assert_eq!(
            llm.build_request(&inputs).unwrap_err(),
            ToolError::MissingInput("connection".to_string())
        );
    }
}
