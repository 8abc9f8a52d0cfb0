use crate::error::ProviderErrorKind;
use crate::events::AgentEvent;
use crate::llm::{EventStream, Provider, ProviderRequest, StopReason, StreamEvent};
use crate::tools::{Tool, ToolContext};
use crate::types::TokenUsage;
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

// ===================
// Scripted provider
// ===================

/// Provider that plays back one pre-written event script per call.
/// Calls beyond the script list end the conversation with plain text.
pub struct ScriptedProvider {
    scripts: Mutex<VecDeque<Vec<StreamEvent>>>,
    pub calls: AtomicUsize,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// A turn that streams `text` in two fragments and ends.
    pub fn text_turn(text: &str) -> Vec<StreamEvent> {
        let (head, tail) = text.split_at(text.len() / 2);
        vec![
            StreamEvent::TextDelta {
                index: 0,
                text: head.to_string(),
            },
            StreamEvent::TextDelta {
                index: 0,
                text: tail.to_string(),
            },
            StreamEvent::Usage(TokenUsage {
                input_tokens: 10,
                output_tokens: 20,
            }),
            StreamEvent::TurnEnd {
                stop_reason: Some(StopReason::EndTurn),
            },
        ]
    }

    /// A turn requesting the given tool calls, arguments split across
    /// two deltas each.
    pub fn tool_call_turn(calls: Vec<(&str, &str, Value)>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (block, (id, name, args)) in calls.into_iter().enumerate() {
            let encoded = args.to_string();
            let (head, tail) = encoded.split_at(encoded.len() / 2);
            events.push(StreamEvent::ToolCallStart {
                index: block,
                id: id.to_string(),
                name: name.to_string(),
            });
            events.push(StreamEvent::ToolCallArgsDelta {
                index: block,
                partial_json: head.to_string(),
            });
            events.push(StreamEvent::ToolCallArgsDelta {
                index: block,
                partial_json: tail.to_string(),
            });
            events.push(StreamEvent::ToolCallEnd { index: block });
        }
        events.push(StreamEvent::Usage(TokenUsage {
            input_tokens: 15,
            output_tokens: 5,
        }));
        events.push(StreamEvent::TurnEnd {
            stop_reason: Some(StopReason::ToolUse),
        });
        events
    }

    /// A turn that fails immediately with the given classification.
    pub fn error_turn(kind: ProviderErrorKind) -> Vec<StreamEvent> {
        vec![StreamEvent::error(kind, format!("scripted {kind}"))]
    }
}

impl Provider for ScriptedProvider {
    fn send(&self, _request: ProviderRequest) -> EventStream<'_> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .expect("lock poisoned")
            .pop_front()
            .unwrap_or_else(|| Self::text_turn("Done"));
        Box::pin(futures::stream::iter(script))
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Provider whose stream emits a little text, then never finishes.
/// Exercises cancellation mid-stream.
pub struct StallingProvider;

impl Provider for StallingProvider {
    fn send(&self, _request: ProviderRequest) -> EventStream<'_> {
        use futures::StreamExt;
        let head = futures::stream::iter(vec![StreamEvent::TextDelta {
            index: 0,
            text: "thinking".to_string(),
        }]);
        Box::pin(head.chain(futures::stream::pending()))
    }

    fn model(&self) -> &str {
        "stalling-model"
    }

    fn name(&self) -> &'static str {
        "stalling"
    }
}

// ===================
// Mock tools
// ===================

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &'static str {
        "echo"
    }

    fn description(&self) -> &'static str {
        "Echo the message back"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "message": { "type": "string" } },
            "required": ["message"]
        })
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<String> {
        Ok(format!(
            "Echo: {}",
            args.get("message").and_then(Value::as_str).unwrap_or("")
        ))
    }
}

pub struct ListDirTool;

#[async_trait]
impl Tool for ListDirTool {
    fn name(&self) -> &'static str {
        "list_dir"
    }

    fn description(&self) -> &'static str {
        "List directory entries"
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "path": { "type": "string" } },
            "required": ["path"]
        })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        Ok("Cargo.toml\nsrc/main.rs\nsrc/lib.rs".to_string())
    }
}

pub struct FailingTool;

#[async_trait]
impl Tool for FailingTool {
    fn name(&self) -> &'static str {
        "failing"
    }

    fn description(&self) -> &'static str {
        "Always fails"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        Err(anyhow!("deliberate failure"))
    }
}

pub struct SlowTool;

#[async_trait]
impl Tool for SlowTool {
    fn name(&self) -> &'static str {
        "slow"
    }

    fn description(&self) -> &'static str {
        "Sleeps far longer than any test runs"
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {} })
    }

    async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok("finally".to_string())
    }
}

// ===================
// Event collection
// ===================

/// Spawn a task collecting every event until the sender side closes.
pub fn collect_events() -> (
    tokio::sync::mpsc::Sender<AgentEvent>,
    tokio::task::JoinHandle<Vec<AgentEvent>>,
) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(256);
    let handle = tokio::spawn(async move {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    });
    (tx, handle)
}
