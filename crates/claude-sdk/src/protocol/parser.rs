use serde_json::{Map, Value};

use crate::error::{ErrorKind, Result, SdkError};

use super::messages::{
    AssistantMessage, ControlRequest, ControlResponse, GenericMessage, Message, ResultMessage,
    SystemMessage, UserMessage,
};

/// Type a framed JSON object by dispatching on its `type` discriminator.
///
/// Parsing is lenient on unknown fields so additive server evolutions keep
/// working; an unknown `type` comes back as [`Message::Generic`] with the
/// full object preserved.
pub fn parse_message(data: &Map<String, Value>) -> Result<Message> {
    let Some(msg_type) = data.get("type").and_then(Value::as_str) else {
        return Err(SdkError::with_details(
            "parse",
            ErrorKind::MessageParse,
            "missing message type",
        ));
    };

    let value = Value::Object(data.clone());
    let parse_err = |what: &str, e: serde_json::Error| {
        SdkError::with_details("parse", ErrorKind::MessageParse, format!("{what}: {e}"))
    };

    match msg_type {
        "user" => serde_json::from_value::<UserMessage>(value)
            .map(Message::User)
            .map_err(|e| parse_err("user message", e)),
        "assistant" => serde_json::from_value::<AssistantMessage>(value)
            .map(Message::Assistant)
            .map_err(|e| parse_err("assistant message", e)),
        "system" => serde_json::from_value::<SystemMessage>(value)
            .map(Message::System)
            .map_err(|e| parse_err("system message", e)),
        "result" => serde_json::from_value::<ResultMessage>(value)
            .map(Message::Result)
            .map_err(|e| parse_err("result message", e)),
        "control_request" => serde_json::from_value::<ControlRequest>(value)
            .map(Message::ControlRequest)
            .map_err(|e| parse_err("control request", e)),
        "control_response" => serde_json::from_value::<ControlResponse>(value)
            .map(Message::ControlResponse)
            .map_err(|e| parse_err("control response", e)),
        other => Ok(Message::Generic(GenericMessage {
            msg_type: other.to_string(),
            data: data.clone(),
        })),
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────
