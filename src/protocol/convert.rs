use serde_json::Value;

use crate::protocol::chat::{ChatMessage, ChatRequest};
use crate::protocol::responses::{ResponsesInput, ResponsesRequest};

/// Convert a Responses API request into a Chat Completions request.
///
/// This conversion never fails: fields of unexpected shape are treated as
/// absent and skipped, so the worst outcome is a sparser Chat request.
#[must_use]
pub fn responses_to_chat(request: &ResponsesRequest) -> ChatRequest {
    let mut messages = Vec::new();

    if !request.instructions.is_empty() {
        messages.push(ChatMessage {
            role: "system".to_string(),
            content: Value::String(request.instructions.clone()),
        });
    }

    match &request.input {
        Some(ResponsesInput::Text(text)) => {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: Value::String(text.clone()),
            });
        }
        Some(ResponsesInput::Items(items)) => {
            append_item_messages(&mut messages, items);
        }
        // Unrecognized input shape: hand it to the upstream as-is and let it
        // decide whether the value is usable.
        Some(ResponsesInput::Other(value)) => {
            messages.push(ChatMessage {
                role: "user".to_string(),
                content: value.clone(),
            });
        }
        None => {}
    }

    ChatRequest {
        model: request.model.clone(),
        messages,
        tools: request.tools.as_deref().and_then(convert_tools),
        tool_choice: request.tool_choice.clone(),
        max_tokens: request.max_output_tokens.filter(|&limit| limit > 0),
        temperature: request.temperature,
        top_p: request.top_p,
        stream: request.stream,
    }
}

fn append_item_messages(messages: &mut Vec<ChatMessage>, items: &[Value]) {
    for item in items {
        let Value::Object(fields) = item else {
            continue;
        };
        let role = match fields.get("role") {
            Some(Value::String(role)) => role.as_str(),
            _ => "",
        };
        // Codex sends system instructions under the "developer" role.
        let role = if role == "developer" { "system" } else { role };
        let Some(text) = fields.get("content").and_then(flatten_content) else {
            continue;
        };
        if role.is_empty() || text.is_empty() {
            continue;
        }
        messages.push(ChatMessage {
            role: role.to_string(),
            content: Value::String(text),
        });
    }
}

/// Flatten message content to a plain string: strings pass through, and a
/// content-part array yields the `text` of its first part only.
fn flatten_content(content: &Value) -> Option<String> {
    match content {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => match parts.first() {
            Some(Value::Object(part)) => match part.get("text") {
                Some(Value::String(text)) => Some(text.clone()),
                _ => None,
            },
            _ => None,
        },
        _ => None,
    }
}

/// Rewrite tools into Chat Completions shape, dropping anything that is not
/// a function tool. A tool that already carries a `function` sub-object is
/// passed through unchanged, so the conversion is idempotent.
fn convert_tools(tools: &[Value]) -> Option<Vec<Value>> {
    let mut converted = Vec::new();
    for tool in tools {
        let Value::Object(fields) = tool else {
            continue;
        };
        let tool_type = match fields.get("type") {
            Some(Value::String(tool_type)) => tool_type.as_str(),
            _ => "",
        };
        if tool_type != "function" {
            tracing::debug!(tool_type, "dropping unsupported tool type");
            continue;
        }
        if fields.contains_key("function") {
            converted.push(tool.clone());
            continue;
        }
        converted.push(synthesize_function_tool(fields));
    }
    if converted.is_empty() {
        None
    } else {
        Some(converted)
    }
}

fn synthesize_function_tool(fields: &serde_json::Map<String, Value>) -> Value {
    let name = match fields.get("name") {
        Some(Value::String(name)) => name.clone(),
        _ => String::new(),
    };
    let mut function = serde_json::Map::new();
    function.insert("name".to_string(), Value::String(name));
    if let Some(Value::String(description)) = fields.get("description") {
        if !description.is_empty() {
            function.insert(
                "description".to_string(),
                Value::String(description.clone()),
            );
        }
    }
    if let Some(parameters) = fields.get("parameters") {
        if !parameters.is_null() {
            function.insert("parameters".to_string(), parameters.clone());
        }
    }
    if let Some(Value::Bool(true)) = fields.get("strict") {
        function.insert("strict".to_string(), Value::Bool(true));
    }

    let mut tool = serde_json::Map::new();
    tool.insert("type".to_string(), Value::String("function".to_string()));
    tool.insert("function".to_string(), Value::Object(function));
    Value::Object(tool)
}
