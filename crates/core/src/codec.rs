//! Payload codec: durable, self-describing encoding of heterogeneous payloads.
//!
//! The handler column holds `{"type": "<TYPE_NAME>", "data": <payload JSON>}`.
//! Decoding resolves `type` through a [`PayloadRegistry`] populated by the
//! deployment; names that are not registered fail closed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CodecError;
use crate::payload::{Payload, PayloadType};

/// Type name under which command payloads are stored.
pub const COMMAND_TYPE: &str = "Command";

type DecodeFn = Arc<dyn Fn(Value) -> Result<Arc<dyn Payload>, CodecError> + Send + Sync>;

/// Body of a registered command.
pub type CommandFn = Arc<dyn Fn(Value) -> anyhow::Result<()> + Send + Sync>;

/// A payload in its stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub job_type: String,
    pub handler: String,
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    type_name: String,
    data: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CommandCall {
    name: String,
    #[serde(default)]
    args: Value,
}

/// Maps stored type names to reconstruction logic.
#[derive(Clone, Default)]
pub struct PayloadRegistry {
    decoders: HashMap<String, DecodeFn>,
    commands: HashMap<String, CommandFn>,
}

impl std::fmt::Debug for PayloadRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PayloadRegistry")
            .field("types", &self.type_names())
            .field("commands", &self.commands.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl PayloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `P` enqueueable and decodable.
    pub fn register<P: PayloadType>(&mut self) -> &mut Self {
        let decode: DecodeFn = Arc::new(|data: Value| {
            let payload: P = serde_json::from_value(data)
                .map_err(|e| CodecError::malformed(P::TYPE_NAME, e))?;
            Ok(Arc::new(payload) as Arc<dyn Payload>)
        });
        self.decoders.insert(P::TYPE_NAME.to_string(), decode);
        self
    }

    /// Register a named command. Jobs refer to it by name and carry JSON
    /// arguments; the body itself never leaves the process.
    pub fn register_command<F>(&mut self, name: impl Into<String>, body: F) -> &mut Self
    where
        F: Fn(Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.commands.insert(name.into(), Arc::new(body));
        self
    }

    pub fn is_registered(&self, type_name: &str) -> bool {
        self.decoders.contains_key(type_name)
            || (type_name == COMMAND_TYPE && !self.commands.is_empty())
    }

    pub fn has_command(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    /// Registered type names, sorted.
    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.decoders.keys().cloned().collect();
        if !self.commands.is_empty() {
            names.push(COMMAND_TYPE.to_string());
        }
        names.sort();
        names
    }

    /// Encode `payload`, refusing types this registry could not decode again.
    pub fn encode<P: PayloadType>(&self, payload: &P) -> Result<EncodedPayload, CodecError> {
        if !self.decoders.contains_key(P::TYPE_NAME) {
            return Err(CodecError::InvalidPayload(P::TYPE_NAME.to_string()));
        }
        let data = serde_json::to_value(payload).map_err(|e| CodecError::Serialize {
            job_type: P::TYPE_NAME.to_string(),
            reason: e.to_string(),
        })?;
        envelope(P::TYPE_NAME, data)
    }

    /// Encode a call to a registered command.
    pub fn encode_command(&self, name: &str, args: Value) -> Result<EncodedPayload, CodecError> {
        if !self.has_command(name) {
            return Err(CodecError::InvalidPayload(format!("{COMMAND_TYPE}:{name}")));
        }
        let call = CommandCall {
            name: name.to_string(),
            args,
        };
        let data = serde_json::to_value(&call).map_err(|e| CodecError::Serialize {
            job_type: COMMAND_TYPE.to_string(),
            reason: e.to_string(),
        })?;
        envelope(COMMAND_TYPE, data)
    }

    /// Rebuild a payload from its stored handler.
    pub fn decode(&self, handler: &str) -> Result<Arc<dyn Payload>, CodecError> {
        let envelope: Envelope = serde_json::from_str(handler).map_err(|e| {
            let job_type = peek_type_name(handler).unwrap_or_else(|| "<unknown>".to_string());
            CodecError::malformed(job_type, e)
        })?;

        if envelope.type_name == COMMAND_TYPE {
            return self.decode_command(envelope.data);
        }

        let decode = self
            .decoders
            .get(&envelope.type_name)
            .ok_or_else(|| CodecError::UnknownType(envelope.type_name.clone()))?;
        decode(envelope.data)
    }

    fn decode_command(&self, data: Value) -> Result<Arc<dyn Payload>, CodecError> {
        let call: CommandCall =
            serde_json::from_value(data).map_err(|e| CodecError::malformed(COMMAND_TYPE, e))?;
        let body = self
            .commands
            .get(&call.name)
            .cloned()
            .ok_or_else(|| CodecError::UnknownType(format!("{COMMAND_TYPE}:{}", call.name)))?;
        Ok(Arc::new(BoundCommand {
            name: call.name,
            args: call.args,
            body,
        }))
    }
}

fn envelope(type_name: &str, data: Value) -> Result<EncodedPayload, CodecError> {
    let handler = serde_json::to_string(&Envelope {
        type_name: type_name.to_string(),
        data,
    })
    .map_err(|e| CodecError::Serialize {
        job_type: type_name.to_string(),
        reason: e.to_string(),
    })?;
    Ok(EncodedPayload {
        job_type: type_name.to_string(),
        handler,
    })
}

/// Best-effort type name from a handler that failed to parse as an envelope.
fn peek_type_name(handler: &str) -> Option<String> {
    let value: Value = serde_json::from_str(handler).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}

/// A decoded command: the registered body plus the stored arguments.
struct BoundCommand {
    name: String,
    args: Value,
    body: CommandFn,
}

#[async_trait]
impl Payload for BoundCommand {
    async fn perform(&self) -> anyhow::Result<()> {
        let body = self.body.clone();
        let args = self.args.clone();
        // Command bodies are synchronous; keep them off the async workers.
        tokio::task::spawn_blocking(move || body(args)).await?
    }

    fn display_name(&self) -> Option<String> {
        Some(format!("{COMMAND_TYPE}:{}", self.name))
    }
}
