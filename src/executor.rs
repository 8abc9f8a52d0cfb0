//! Concurrent execution of one assistant turn's tool calls.
//!
//! The executor validates every call against its declared schema, runs the
//! valid ones concurrently under a bounded worker pool, and returns one
//! result per call in the original call order. This is a synchronization
//! barrier: the loop sends nothing to the provider until every call has
//! completed, timed out, or been resolved as cancelled.

use crate::conversation::Message;
use crate::tools::{ToolContext, ToolRegistry, validate_args};
use log::{debug, warn};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// One tool call extracted from an assistant message.
#[derive(Clone, Debug)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

impl ToolCallRequest {
    /// Extract the pending calls from an assistant message.
    #[must_use]
    pub fn from_message(message: &Message) -> Vec<Self> {
        message
            .tool_calls()
            .map(|(id, name, arguments)| Self {
                id: id.to_string(),
                name: name.to_string(),
                arguments: arguments.clone(),
            })
            .collect()
    }
}

/// Outcome classification for a single tool call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Ok,
    Error,
    Cancelled,
}

/// The resolved outcome of one tool call.
#[derive(Clone, Debug)]
pub struct ToolResultRecord {
    pub call_id: String,
    pub name: String,
    pub status: ToolStatus,
    pub content: String,
    pub duration_ms: Option<u64>,
}

impl ToolResultRecord {
    #[must_use]
    pub fn ok(call_id: impl Into<String>, name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            status: ToolStatus::Ok,
            content: content.into(),
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn error(
        call_id: impl Into<String>,
        name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            status: ToolStatus::Error,
            content: content.into(),
            duration_ms: None,
        }
    }

    #[must_use]
    pub fn cancelled(call_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            name: name.into(),
            status: ToolStatus::Cancelled,
            content: "cancelled: tool execution was stopped before completion".to_string(),
            duration_ms: None,
        }
    }

    #[must_use]
    pub const fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    /// Convert into the history message resolving the call. Cancelled
    /// results are recorded as errors so every provider accepts them.
    #[must_use]
    pub fn to_message(&self) -> Message {
        Message::tool_result(&self.call_id, &self.content, self.status != ToolStatus::Ok)
    }
}

/// Configuration for the tool batch executor.
#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Worker pool bound for one batch.
    pub max_concurrency: usize,
    /// Timeout per invocation when the tool declares none.
    pub default_timeout: Duration,
    /// How long in-flight tools get to finish after cancellation.
    pub cancel_grace: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            default_timeout: Duration::from_secs(300),
            cancel_grace: Duration::from_secs(2),
        }
    }
}

impl ExecutorConfig {
    #[must_use]
    pub const fn with_max_concurrency(mut self, bound: usize) -> Self {
        self.max_concurrency = bound;
        self
    }

    #[must_use]
    pub const fn with_default_timeout(mut self, value: Duration) -> Self {
        self.default_timeout = value;
        self
    }

    #[must_use]
    pub const fn with_cancel_grace(mut self, value: Duration) -> Self {
        self.cancel_grace = value;
        self
    }
}

/// Runs tool batches against a registry.
#[derive(Clone)]
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl ToolExecutor {
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    /// Execute a batch of tool calls.
    ///
    /// Guarantees: the returned vector has exactly one record per call, in
    /// the original order; invalid arguments and unknown names produce
    /// error records without invoking any handler; a failing or panicking
    /// handler produces an error record without affecting its siblings;
    /// after cancellation every unfinished call resolves to a `Cancelled`
    /// record once the grace period elapses.
    pub async fn execute_batch(
        &self,
        calls: &[ToolCallRequest],
        ctx: &Arc<ToolContext>,
        cancel: &CancellationToken,
    ) -> Vec<ToolResultRecord> {
        let mut slots: Vec<Option<ToolResultRecord>> = vec![None; calls.len()];
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut handles = Vec::new();

        for (index, call) in calls.iter().enumerate() {
            let Some(tool) = self.registry.get(&call.name) else {
                debug!("rejecting call {} to unknown tool {}", call.id, call.name);
                slots[index] = Some(ToolResultRecord::error(
                    &call.id,
                    &call.name,
                    format!("unknown tool: {}", call.name),
                ));
                continue;
            };

            if let Err(reason) = validate_args(&tool.input_schema(), &call.arguments) {
                debug!("rejecting call {} to {}: {reason}", call.id, call.name);
                slots[index] = Some(ToolResultRecord::error(
                    &call.id,
                    &call.name,
                    format!("invalid arguments: {reason}"),
                ));
                continue;
            }

            let tool = Arc::clone(tool);
            let call = call.clone();
            let ctx = Arc::clone(ctx);
            let cancel = cancel.clone();
            let semaphore = Arc::clone(&semaphore);
            let per_call_timeout = tool.timeout().unwrap_or(self.config.default_timeout);
            let grace = self.config.cancel_grace;

            handles.push((
                index,
                tokio::spawn(async move {
                    run_one(tool, call, ctx, cancel, semaphore, per_call_timeout, grace).await
                }),
            ));
        }

        for (index, handle) in handles {
            let call = &calls[index];
            slots[index] = Some(match handle.await {
                Ok(record) => record,
                Err(join_error) => {
                    warn!("tool task for call {} aborted: {join_error}", call.id);
                    ToolResultRecord::error(
                        &call.id,
                        &call.name,
                        format!("tool task aborted: {join_error}"),
                    )
                }
            });
        }

        slots
            .into_iter()
            .map(|slot| slot.expect("every slot is filled by validation or a task"))
            .collect()
    }
}

async fn run_one(
    tool: Arc<dyn crate::tools::Tool>,
    call: ToolCallRequest,
    ctx: Arc<ToolContext>,
    cancel: CancellationToken,
    semaphore: Arc<Semaphore>,
    per_call_timeout: Duration,
    grace: Duration,
) -> ToolResultRecord {
    let permit = tokio::select! {
        permit = semaphore.acquire_owned() => match permit {
            Ok(p) => p,
            Err(_) => return ToolResultRecord::error(&call.id, &call.name, "executor shut down"),
        },
        () = cancel.cancelled() => return ToolResultRecord::cancelled(&call.id, &call.name),
    };
    let _permit = permit;

    if cancel.is_cancelled() {
        return ToolResultRecord::cancelled(&call.id, &call.name);
    }

    let started = Instant::now();
    let mut work = std::pin::pin!(timeout(
        per_call_timeout,
        tool.execute(call.arguments.clone(), &ctx)
    ));

    let outcome = tokio::select! {
        outcome = &mut work => outcome,
        () = cancel.cancelled() => {
            // Grace window: let an in-flight tool finish rather than
            // dropping it mid-mutation of the filesystem.
            match timeout(grace, &mut work).await {
                Ok(outcome) => outcome,
                Err(_) => return ToolResultRecord::cancelled(&call.id, &call.name)
                    .with_duration(elapsed_ms(started)),
            }
        }
    };

    let record = match outcome {
        Ok(Ok(content)) => ToolResultRecord::ok(&call.id, &call.name, content),
        Ok(Err(error)) => {
            ToolResultRecord::error(&call.id, &call.name, format!("tool error: {error:#}"))
        }
        Err(_) => ToolResultRecord::error(
            &call.id,
            &call.name,
            format!("timed out after {}s", per_call_timeout.as_secs_f64()),
        ),
    };
    record.with_duration(elapsed_ms(started))
}

#[allow(clippy::cast_possible_truncation)]
fn elapsed_ms(started: Instant) -> u64 {
    let millis = started.elapsed().as_millis();
    if millis > u128::from(u64::MAX) {
        u64::MAX
    } else {
        millis as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::Tool;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

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

    struct FailingTool;

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

    struct SlowTool {
        sleep: Duration,
        declared_timeout: Option<Duration>,
    }

    #[async_trait]
    impl Tool for SlowTool {
        fn name(&self) -> &'static str {
            "slow"
        }

        fn description(&self) -> &'static str {
            "Sleeps before answering"
        }

        fn input_schema(&self) -> Value {
            json!({ "type": "object", "properties": {} })
        }

        fn timeout(&self) -> Option<Duration> {
            self.declared_timeout
        }

        async fn execute(&self, _args: Value, _ctx: &ToolContext) -> Result<String> {
            tokio::time::sleep(self.sleep).await;
            Ok("slow done".to_string())
        }
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCallRequest {
        ToolCallRequest {
            id: id.to_string(),
            name: name.to_string(),
            arguments: args,
        }
    }

    fn executor_with(tools: Vec<Box<dyn FnOnce(&mut ToolRegistry)>>) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        for register in tools {
            register(&mut registry);
        }
        ToolExecutor::new(Arc::new(registry), ExecutorConfig::default())
    }

    fn test_ctx() -> Arc<ToolContext> {
        Arc::new(ToolContext::new("."))
    }

    #[tokio::test]
    async fn mixed_batch_preserves_order_and_statuses() {
        let executor = executor_with(vec![
            Box::new(|r| {
                r.register(EchoTool).expect("register echo");
            }),
            Box::new(|r| {
                r.register(FailingTool).expect("register failing");
            }),
        ]);

        // One invalid (missing required field), one throwing, one ok.
        let calls = vec![
            call("c1", "echo", json!({})),
            call("c2", "failing", json!({})),
            call("c3", "echo", json!({ "message": "hi" })),
        ];

        let records = executor
            .execute_batch(&calls, &test_ctx(), &CancellationToken::new())
            .await;

        assert_eq!(records.len(), 3);
        assert_eq!(records[0].call_id, "c1");
        assert_eq!(records[1].call_id, "c2");
        assert_eq!(records[2].call_id, "c3");
        assert_eq!(records[0].status, ToolStatus::Error);
        assert!(records[0].content.contains("invalid arguments"));
        assert_eq!(records[1].status, ToolStatus::Error);
        assert!(records[1].content.contains("deliberate failure"));
        assert_eq!(records[2].status, ToolStatus::Ok);
        assert_eq!(records[2].content, "Echo: hi");
    }

    #[tokio::test]
    async fn unknown_tool_yields_error_record() {
        let executor = executor_with(vec![]);
        let records = executor
            .execute_batch(
                &[call("c1", "nope", json!({}))],
                &test_ctx(),
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, ToolStatus::Error);
        assert!(records[0].content.contains("unknown tool"));
    }

    #[tokio::test]
    async fn order_is_call_order_not_completion_order() {
        let mut registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                sleep: Duration::from_millis(150),
                declared_timeout: None,
            })
            .expect("register slow");
        registry.register(EchoTool).expect("register echo");
        let executor = ToolExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default().with_max_concurrency(4),
        );

        let calls = vec![
            call("slow_first", "slow", json!({})),
            call("fast_second", "echo", json!({ "message": "quick" })),
        ];
        let records = executor
            .execute_batch(&calls, &test_ctx(), &CancellationToken::new())
            .await;

        assert_eq!(records[0].call_id, "slow_first");
        assert_eq!(records[0].status, ToolStatus::Ok);
        assert_eq!(records[1].call_id, "fast_second");
        assert_eq!(records[1].status, ToolStatus::Ok);
    }

    #[tokio::test]
    async fn declared_timeout_produces_error_record() {
        let mut registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                sleep: Duration::from_secs(30),
                declared_timeout: Some(Duration::from_millis(50)),
            })
            .expect("register slow");
        let executor = ToolExecutor::new(Arc::new(registry), ExecutorConfig::default());

        let records = executor
            .execute_batch(
                &[call("c1", "slow", json!({}))],
                &test_ctx(),
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(records[0].status, ToolStatus::Error);
        assert!(records[0].content.contains("timed out"));
    }

    #[tokio::test]
    async fn cancellation_resolves_every_pending_call() {
        let mut registry = ToolRegistry::new();
        registry.register(EchoTool).expect("register echo");
        registry
            .register(SlowTool {
                sleep: Duration::from_secs(30),
                declared_timeout: None,
            })
            .expect("register slow");
        let executor = ToolExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default()
                .with_max_concurrency(8)
                .with_cancel_grace(Duration::from_millis(50)),
        );

        // 3 fast calls complete; 2 slow ones are pending when cancellation
        // fires and must come back as cancelled, never missing.
        let calls = vec![
            call("f1", "echo", json!({ "message": "a" })),
            call("f2", "echo", json!({ "message": "b" })),
            call("f3", "echo", json!({ "message": "c" })),
            call("s1", "slow", json!({})),
            call("s2", "slow", json!({})),
        ];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let records = executor.execute_batch(&calls, &test_ctx(), &cancel).await;

        assert_eq!(records.len(), 5);
        let ids: Vec<&str> = records.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["f1", "f2", "f3", "s1", "s2"]);
        assert_eq!(records[0].status, ToolStatus::Ok);
        assert_eq!(records[1].status, ToolStatus::Ok);
        assert_eq!(records[2].status, ToolStatus::Ok);
        assert_eq!(records[3].status, ToolStatus::Cancelled);
        assert_eq!(records[4].status, ToolStatus::Cancelled);
    }

    #[tokio::test]
    async fn grace_period_lets_in_flight_work_finish() {
        let mut registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                sleep: Duration::from_millis(80),
                declared_timeout: None,
            })
            .expect("register slow");
        let executor = ToolExecutor::new(
            Arc::new(registry),
            ExecutorConfig::default().with_cancel_grace(Duration::from_secs(5)),
        );

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        // Cancellation fires mid-run, but the 80ms of remaining work fits
        // inside the grace window, so the real result is kept.
        let records = executor
            .execute_batch(&[call("c1", "slow", json!({}))], &test_ctx(), &cancel)
            .await;
        assert_eq!(records[0].status, ToolStatus::Ok);
        assert_eq!(records[0].content, "slow done");
    }

    #[tokio::test]
    async fn already_cancelled_batch_short_circuits() {
        let mut registry = ToolRegistry::new();
        registry
            .register(SlowTool {
                sleep: Duration::from_secs(30),
                declared_timeout: None,
            })
            .expect("register slow");
        let executor = ToolExecutor::new(Arc::new(registry), ExecutorConfig::default());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let records = executor
            .execute_batch(&[call("c1", "slow", json!({}))], &test_ctx(), &cancel)
            .await;
        assert_eq!(records[0].status, ToolStatus::Cancelled);
    }

    #[test]
    fn cancelled_record_becomes_error_result_message() {
        let record = ToolResultRecord::cancelled("c1", "slow");
        let message = record.to_message();
        assert!(message.has_tool_results());
        match &message.blocks[0] {
            crate::conversation::ContentBlock::ToolResult {
                call_id,
                content,
                is_error,
            } => {
                assert_eq!(call_id, "c1");
                assert!(content.starts_with("cancelled"));
                assert_eq!(*is_error, Some(true));
            }
            other => panic!("expected tool result, got {other:?}"),
        }
    }
}
