//! The turn state machine.
//!
//! `Sending → Streaming → (ToolExecuting ⇄ Sending) → Done | Failed |
//! Cancelled`. Stream consumption is the single long-lived suspension
//! point; cancellation is checked there and between tool completions. The
//! session is persisted exactly once, at the terminal transition — never
//! mid-stream — so a crash loses at most the in-flight turn.

use super::AgentLoop;
use super::helpers::{backoff_delay, send_event};
use crate::conversation::Message;
use crate::error::{AgentError, ProviderErrorKind};
use crate::events::AgentEvent;
use crate::executor::ToolCallRequest;
use crate::llm::{Provider, ProviderRequest, StreamEvent, TurnAccumulator};
use crate::session::Session;
use crate::tools::ToolContext;
use crate::types::TokenUsage;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Terminal outcome of one user turn.
#[derive(Debug)]
pub enum TurnResult {
    /// The model produced a final answer.
    Done {
        final_text: String,
        rounds: usize,
        usage: TokenUsage,
    },
    /// The turn failed; [`AgentError::session_usable`] says whether the
    /// session can take another turn.
    Failed(AgentError),
    /// The caller cancelled; history is complete up to the cancellation.
    Cancelled { rounds: usize },
}

enum LoopState {
    Sending,
    Streaming(ProviderRequest),
    ToolExecuting(Vec<ToolCallRequest>),
}

enum StreamOutcome {
    Completed { message: Message, usage: TokenUsage },
    Failed {
        kind: ProviderErrorKind,
        retryable: bool,
        message: String,
    },
    Cancelled,
}

pub(super) async fn drive<P: Provider>(
    agent: &AgentLoop<P>,
    session: &mut Session,
    input: String,
    events: &mpsc::Sender<AgentEvent>,
    cancel: &CancellationToken,
) -> TurnResult {
    session.conversation.append(Message::user(input));

    let tool_ctx = Arc::new(ToolContext::new(session.working_dir.clone()));
    let mut rounds: usize = 0;
    let mut attempt: u32 = 0;
    let mut total_usage = TokenUsage::default();
    let mut state = LoopState::Sending;

    let result = loop {
        state = match state {
            LoopState::Sending => {
                if cancel.is_cancelled() {
                    break TurnResult::Cancelled { rounds };
                }

                match agent
                    .compactor
                    .compact(
                        &mut session.conversation,
                        &session.model,
                        agent.summarizer.as_ref(),
                    )
                    .await
                {
                    Ok(Some(report)) => {
                        info!(
                            "context compacted: {} -> {} messages, {} -> {} tokens",
                            report.original_count,
                            report.new_count,
                            report.original_tokens,
                            report.new_tokens
                        );
                        send_event(
                            events,
                            AgentEvent::ContextCompacted {
                                original_count: report.original_count,
                                new_count: report.new_count,
                                original_tokens: report.original_tokens,
                                new_tokens: report.new_tokens,
                            },
                        )
                        .await;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        // Keep the full history and let the provider
                        // reject it if it truly no longer fits.
                        warn!("compaction failed, continuing uncompacted: {e:#}");
                    }
                }

                if attempt == 0 {
                    rounds += 1;
                    if rounds > agent.config.max_tool_rounds {
                        warn!("tool-round budget exhausted at {rounds}");
                        break TurnResult::Failed(AgentError::MaxToolRounds {
                            limit: agent.config.max_tool_rounds,
                        });
                    }
                    send_event(events, AgentEvent::RoundStarted { round: rounds }).await;
                }

                LoopState::Streaming(ProviderRequest {
                    system: agent.config.system_prompt.clone(),
                    messages: session.conversation.snapshot().to_vec(),
                    tools: agent.registry.schemas(),
                    max_tokens: session.model.max_tokens,
                })
            }

            LoopState::Streaming(request) => {
                debug!(
                    "dispatching round {rounds} (attempt {attempt}) with {} messages",
                    request.messages.len()
                );
                match consume_stream(agent.provider.as_ref(), request, events, cancel).await {
                    StreamOutcome::Completed { message, usage } => {
                        attempt = 0;
                        total_usage.add(&usage);
                        if let Some(text) = message.text() {
                            send_event(events, AgentEvent::text(text)).await;
                        }
                        let calls = ToolCallRequest::from_message(&message);
                        let final_text = message.text().unwrap_or_default();
                        session.conversation.append(message);

                        if calls.is_empty() {
                            info!("turn complete after {rounds} round(s)");
                            break TurnResult::Done {
                                final_text,
                                rounds,
                                usage: total_usage,
                            };
                        }
                        LoopState::ToolExecuting(calls)
                    }
                    StreamOutcome::Failed {
                        kind,
                        retryable,
                        message,
                    } => {
                        if !retryable {
                            error!("fatal provider error ({kind}): {message}");
                            break TurnResult::Failed(AgentError::Provider {
                                kind,
                                retryable: false,
                                message,
                            });
                        }
                        attempt += 1;
                        if attempt > agent.config.retry.max_retries {
                            error!(
                                "retries exhausted after {attempt} attempts ({kind}): {message}"
                            );
                            break TurnResult::Failed(AgentError::RetriesExhausted {
                                attempts: attempt,
                                message,
                            });
                        }
                        let delay = backoff_delay(attempt, &agent.config.retry);
                        warn!(
                            "retryable provider error ({kind}), backing off {}ms (attempt {attempt}): {message}",
                            delay.as_millis()
                        );
                        send_event(
                            events,
                            AgentEvent::Retrying {
                                attempt,
                                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                                message,
                            },
                        )
                        .await;
                        tokio::time::sleep(delay).await;
                        LoopState::Sending
                    }
                    StreamOutcome::Cancelled => {
                        // The draft assistant message is discarded whole, so
                        // no tool call ever enters history unanswered.
                        info!("turn cancelled while streaming (round {rounds})");
                        break TurnResult::Cancelled { rounds };
                    }
                }
            }

            LoopState::ToolExecuting(calls) => {
                for call in &calls {
                    send_event(
                        events,
                        AgentEvent::ToolCallStarted {
                            id: call.id.clone(),
                            name: call.name.clone(),
                            arguments: call.arguments.clone(),
                        },
                    )
                    .await;
                }

                let records = agent.executor.execute_batch(&calls, &tool_ctx, cancel).await;

                for record in &records {
                    send_event(
                        events,
                        AgentEvent::ToolCallFinished {
                            id: record.call_id.clone(),
                            name: record.name.clone(),
                            status: record.status,
                            content: record.content.clone(),
                            duration_ms: record.duration_ms,
                        },
                    )
                    .await;
                    session.conversation.append(record.to_message());
                }

                if cancel.is_cancelled() {
                    info!("turn cancelled during tool execution (round {rounds})");
                    break TurnResult::Cancelled { rounds };
                }
                LoopState::Sending
            }
        };
    };

    finalize(agent, session, events, result).await
}

/// Consume one provider stream, forwarding text immediately and buffering
/// tool-call events into the accumulator. This is the loop's only
/// long-lived suspension point, so cancellation is raced against every
/// stream read.
async fn consume_stream<P: Provider>(
    provider: &P,
    request: ProviderRequest,
    events: &mpsc::Sender<AgentEvent>,
    cancel: &CancellationToken,
) -> StreamOutcome {
    use futures::StreamExt;

    let mut stream = provider.send(request);
    let mut accumulator = TurnAccumulator::new();

    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => return StreamOutcome::Cancelled,
            next = stream.next() => next,
        };
        let Some(event) = next else {
            break;
        };

        accumulator.apply(&event);
        match event {
            StreamEvent::TextDelta { text, .. } => {
                send_event(events, AgentEvent::text_delta(text)).await;
            }
            StreamEvent::Error {
                kind,
                retryable,
                message,
            } => {
                return StreamOutcome::Failed {
                    kind,
                    retryable,
                    message,
                };
            }
            StreamEvent::TurnEnd { stop_reason } => {
                debug!("stream finished with stop_reason {stop_reason:?}");
            }
            StreamEvent::ToolCallStart { .. }
            | StreamEvent::ToolCallArgsDelta { .. }
            | StreamEvent::ToolCallEnd { .. }
            | StreamEvent::Usage(_) => {}
        }
    }

    let usage = accumulator.usage();
    StreamOutcome::Completed {
        message: accumulator.into_message(),
        usage,
    }
}

/// Persist at the terminal transition and emit the matching event.
///
/// A persistence failure after a successful or cancelled turn surfaces as
/// `Failed` — the in-memory session is intact and usable, but the caller
/// must know the record on disk is stale. A turn that already failed keeps
/// its original error; the persistence problem is only logged.
async fn finalize<P: Provider>(
    agent: &AgentLoop<P>,
    session: &mut Session,
    events: &mpsc::Sender<AgentEvent>,
    result: TurnResult,
) -> TurnResult {
    let result = match agent.sessions.persist(session).await {
        Ok(()) => result,
        Err(persist_error) => match result {
            TurnResult::Failed(original) => {
                error!("failed to persist session after error: {persist_error}");
                TurnResult::Failed(original)
            }
            TurnResult::Done { .. } | TurnResult::Cancelled { .. } => {
                error!("failed to persist completed turn: {persist_error}");
                TurnResult::Failed(persist_error)
            }
        },
    };

    match &result {
        TurnResult::Done {
            final_text,
            rounds,
            usage,
        } => {
            send_event(
                events,
                AgentEvent::done(final_text.clone(), *rounds, usage.clone()),
            )
            .await;
        }
        TurnResult::Failed(err) => {
            let retryable = matches!(err, AgentError::Provider { retryable: true, .. });
            send_event(events, AgentEvent::failed(err.to_string(), retryable)).await;
        }
        TurnResult::Cancelled { rounds } => {
            send_event(events, AgentEvent::Cancelled { rounds: *rounds }).await;
        }
    }
    result
}
