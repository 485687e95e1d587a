//! Frame dispatch.
//!
//! Per request id the output contract is: one `ack`, zero-or-more
//! `progress`, then exactly one of `result` | `error`. The responder
//! enforces terminal uniqueness; the worker wrapper enforces the deadline,
//! the cancellation grace, and panic containment.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use {serde_json::Value, tokio_util::sync::CancellationToken, tracing::{debug, warn}};

use {
    relay_metrics::{counter, histogram, tool as tool_metrics},
    relay_protocol::{
        CANCEL_GRACE_MS, ErrorKind, ErrorShape, Frame, ModelInfo, ProgressLevel,
    },
    relay_tools::{DedupScope, ProgressSink, Tool, ToolContext, ToolOutput},
};

use crate::{
    concurrency::{CallOutcome, ConcurrencyController, Fingerprint, FlightRole, permit_deadline},
    outbound::ConnQueue,
    session::Session,
    state::GatewayState,
};

// ── Responder ────────────────────────────────────────────────────────────────

/// Guards the one-terminal-frame-per-request invariant.
struct Responder {
    queue: Arc<ConnQueue>,
    request_id: String,
    terminal_sent: AtomicBool,
}

impl Responder {
    fn new(queue: Arc<ConnQueue>, request_id: String) -> Self {
        Self {
            queue,
            request_id,
            terminal_sent: AtomicBool::new(false),
        }
    }

    fn ack(&self) {
        self.queue.send(&Frame::Ack {
            request_id: self.request_id.clone(),
        });
    }

    fn terminal(&self, outcome: &CallOutcome) {
        if self.terminal_sent.swap(true, Ordering::AcqRel) {
            debug!(request_id = %self.request_id, "suppressing duplicate terminal");
            return;
        }
        let frame = match outcome {
            CallOutcome::Success {
                value,
                usage,
                continuation_id,
            } => Frame::Result {
                request_id: self.request_id.clone(),
                value: value.clone(),
                usage: usage.clone(),
                continuation_id: *continuation_id,
            },
            CallOutcome::Failure(shape) => {
                Frame::error(Some(self.request_id.clone()), shape.clone())
            },
        };
        self.queue.send(&frame);
    }
}

/// Progress sink bound to one request on one connection.
struct WsProgressSink {
    queue: Arc<ConnQueue>,
    request_id: String,
}

impl ProgressSink for WsProgressSink {
    fn emit(&self, level: ProgressLevel, message: &str, fields: Option<Value>) {
        self.queue.send(&Frame::Progress {
            request_id: self.request_id.clone(),
            level,
            message: message.to_string(),
            fields,
        });
    }
}

// ── Frame dispatch ───────────────────────────────────────────────────────────

pub async fn handle_frame(state: &Arc<GatewayState>, session: &Arc<Session>, frame: Frame) {
    match frame {
        Frame::ListTools {} => {
            session.queue.send(&Frame::Tools {
                items: state.tools.visible_for(&session.client_name),
            });
        },
        Frame::ListModels {} => {
            let items = state
                .providers
                .model_catalog()
                .into_iter()
                .map(|(provider, model, context_window, supports)| ModelInfo {
                    provider,
                    model,
                    context_window,
                    supports_images: supports.images,
                    supports_files: supports.files,
                    supports_websearch: supports.websearch,
                    supports_streaming: supports.streaming,
                })
                .collect();
            session.queue.send(&Frame::Models { items });
        },
        Frame::Ping {} => {
            session.queue.send(&Frame::Pong {
                server_time_ms: chrono::Utc::now().timestamp_millis().max(0) as u64,
            });
        },
        Frame::Cancel { request_id } => {
            match session.calls.get(&request_id) {
                Some(token) => {
                    debug!(request_id = %request_id, "client cancel");
                    token.cancel();
                },
                None => debug!(request_id = %request_id, "cancel for unknown request"),
            }
        },
        Frame::CallTool {
            request_id,
            tool,
            arguments,
            continuation_id,
            timeout,
        } => {
            handle_call(state, session, request_id, tool, arguments, continuation_id, timeout);
        },
        Frame::Hello { .. } => {
            session.queue.send(&Frame::error(
                None,
                ErrorShape::new(ErrorKind::InvalidRequest, "handshake already complete"),
            ));
        },
        // Server-to-client frames arriving inbound are ignored.
        _ => debug!("ignoring non-request frame"),
    }
}

// ── call_tool ────────────────────────────────────────────────────────────────

fn handle_call(
    state: &Arc<GatewayState>,
    session: &Arc<Session>,
    request_id: String,
    tool_name: String,
    arguments: serde_json::Map<String, Value>,
    continuation_raw: Option<String>,
    timeout: Option<f64>,
) {
    let queue = Arc::clone(&session.queue);

    // ── Validation, before any permit ────────────────────────────────────
    if request_id.trim().is_empty() {
        queue.send(&Frame::error(
            None,
            ErrorShape::new(ErrorKind::InvalidRequest, "request_id must be non-empty"),
        ));
        return;
    }

    if !state.tools.permitted(&session.client_name, &tool_name) {
        queue.send(&Frame::error(
            Some(request_id),
            ErrorShape::new(ErrorKind::UnknownTool, format!("unknown tool: {tool_name}")),
        ));
        return;
    }
    let Some(tool) = state.tools.create(&tool_name) else {
        queue.send(&Frame::error(
            Some(request_id),
            ErrorShape::new(ErrorKind::UnknownTool, format!("unknown tool: {tool_name}")),
        ));
        return;
    };

    let continuation_id = match continuation_raw {
        None => None,
        Some(raw) => match relay_common::ids::parse_continuation(&raw) {
            Some(id) => Some(id),
            None => {
                queue.send(&Frame::error(
                    Some(request_id),
                    ErrorShape::new(
                        ErrorKind::InvalidRequest,
                        format!("continuation_id is not a UUID: {raw}"),
                    ),
                ));
                return;
            },
        },
    };

    let responder = Arc::new(Responder::new(Arc::clone(&queue), request_id.clone()));
    responder.ack();

    // Deadline hierarchy: min(client, per-tool default), bounded by the
    // daemon ceiling. A spent budget fails before any permit.
    let client_budget = match timeout {
        Some(t) if !t.is_finite() => {
            responder.terminal(&CallOutcome::failure(
                ErrorKind::InvalidRequest,
                "timeout must be a finite number of seconds",
            ));
            return;
        },
        Some(t) if t <= 0.0 => {
            responder.terminal(&CallOutcome::failure(
                ErrorKind::TimedOut,
                "requested timeout is already expired",
            ));
            return;
        },
        Some(t) => Some(Duration::from_secs_f64(t)),
        None => None,
    };
    let tool_budget = tool
        .timeout_hint(&arguments)
        .unwrap_or(state.config.timeouts.tool_default);
    let deadline =
        Instant::now() + state.config.timeouts.deadline_for(client_budget, tool_budget);

    let call_cancel = session.cancel.child_token();
    session
        .calls
        .insert(request_id.clone(), call_cancel.clone());

    let state = Arc::clone(state);
    let session = Arc::clone(session);
    tokio::spawn(async move {
        let started = Instant::now();
        let outcome = run_call(
            &state,
            &session,
            &tool,
            &tool_name,
            &request_id,
            arguments,
            continuation_id,
            deadline,
            &call_cancel,
        )
        .await;

        let outcome_label = match &outcome {
            CallOutcome::Success { .. } => "success",
            CallOutcome::Failure(shape) => match shape.kind {
                ErrorKind::TimedOut => "timeout",
                ErrorKind::Cancelled => "cancelled",
                ErrorKind::Overloaded | ErrorKind::SessionOverloaded => "overloaded",
                _ => "error",
            },
        };
        counter!(tool_metrics::CALLS_TOTAL, "tool" => tool_name.clone(), "outcome" => outcome_label)
            .increment(1);
        histogram!(tool_metrics::CALL_DURATION_SECONDS, "tool" => tool_name.clone())
            .record(started.elapsed().as_secs_f64());

        responder.terminal(&outcome);
        session.calls.remove(&request_id);
    });
}

/// Admission → single-flight → execution. Returns the terminal outcome.
#[allow(clippy::too_many_arguments)]
async fn run_call(
    state: &Arc<GatewayState>,
    session: &Arc<Session>,
    tool: &Arc<dyn Tool>,
    tool_name: &str,
    request_id: &str,
    arguments: serde_json::Map<String, Value>,
    continuation_id: Option<uuid::Uuid>,
    deadline: Instant,
    call_cancel: &CancellationToken,
) -> CallOutcome {
    // An explicitly supplied continuation must refer to a live conversation.
    if let Some(id) = continuation_id
        && !state.conversations.is_live(id).await
    {
        return CallOutcome::Failure(
            ErrorShape::new(
                ErrorKind::ContinuationNotFound,
                format!("continuation {id} is unknown or expired"),
            )
            .with_details(serde_json::json!({
                "recovery": "omit continuation_id to start a new conversation"
            })),
        );
    }

    // Session admission comes from the session manager; global and provider
    // permits follow only once this call leads a flight.
    let session_permit = match state
        .sessions
        .acquire(session, permit_deadline(deadline))
        .await
    {
        Ok(permit) => permit,
        Err(shape) => return CallOutcome::Failure(shape),
    };

    let scope = match tool.dedup_scope() {
        DedupScope::Global => None,
        DedupScope::PerSession => Some(session.id),
    };
    let fingerprint = Fingerprint::compute(tool_name, &arguments, continuation_id, scope);

    let outcome = match state.controller.join_flight(fingerprint) {
        FlightRole::Waiter(rx) => {
            debug!(request_id, fingerprint = %fingerprint.to_hex(), "attached to in-flight call");
            ConcurrencyController::await_leader(rx, call_cancel, deadline).await
        },
        FlightRole::Leader(guard) => {
            let outcome = lead_call(
                state,
                session,
                tool,
                request_id,
                arguments,
                continuation_id,
                deadline,
                call_cancel,
            )
            .await;
            guard.settle(outcome.clone());
            outcome
        },
    };

    drop(session_permit);
    outcome
}

/// Leader path: global permit, then the tool worker under deadline,
/// cancellation grace, and panic containment.
#[allow(clippy::too_many_arguments)]
async fn lead_call(
    state: &Arc<GatewayState>,
    session: &Arc<Session>,
    tool: &Arc<dyn Tool>,
    request_id: &str,
    arguments: serde_json::Map<String, Value>,
    continuation_id: Option<uuid::Uuid>,
    deadline: Instant,
    call_cancel: &CancellationToken,
) -> CallOutcome {
    let global_permit = match state.controller.acquire_global(permit_deadline(deadline)).await {
        Ok(permit) => permit,
        Err(shape) => return CallOutcome::Failure(shape),
    };

    let progress: Arc<dyn ProgressSink> = Arc::new(WsProgressSink {
        queue: Arc::clone(&session.queue),
        request_id: request_id.to_string(),
    });

    let ctx = ToolContext {
        arguments,
        continuation_id,
        session_id: session.id,
        client_name: session.client_name.clone(),
        conversations: Arc::clone(&state.conversations),
        repo: Arc::clone(&state.repo),
        backend: Arc::clone(&state.backend),
        progress,
        cancel: call_cancel.clone(),
        deadline,
    };

    let tool = Arc::clone(tool);
    let mut worker = tokio::spawn(async move { tool.execute(ctx).await });
    let grace = Duration::from_millis(CANCEL_GRACE_MS);

    let outcome = tokio::select! {
        finished = &mut worker => worker_outcome(finished),
        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
            call_cancel.cancel();
            match tokio::time::timeout(grace, &mut worker).await {
                Ok(_) => {},
                Err(_) => {
                    // Stuck past grace: detach the worker and move on.
                    warn!(request_id, "tool ignored cancellation, detaching worker");
                    worker.abort();
                },
            }
            CallOutcome::failure(ErrorKind::TimedOut, "deadline expired during execution")
        },
        _ = call_cancel.cancelled() => {
            match tokio::time::timeout(grace, &mut worker).await {
                Ok(_) => {},
                Err(_) => {
                    warn!(request_id, "tool ignored cancellation, detaching worker");
                    worker.abort();
                },
            }
            CallOutcome::failure(ErrorKind::Cancelled, "call cancelled")
        },
    };

    drop(global_permit);
    outcome
}

fn worker_outcome(
    finished: Result<Result<ToolOutput, ErrorShape>, tokio::task::JoinError>,
) -> CallOutcome {
    match finished {
        Ok(Ok(output)) => CallOutcome::Success {
            value: output.value,
            usage: output.usage,
            continuation_id: output.continuation_id,
        },
        Ok(Err(shape)) => CallOutcome::Failure(shape),
        Err(join) if join.is_panic() => {
            warn!("tool worker panicked");
            CallOutcome::failure(ErrorKind::Internal, "tool worker panicked")
        },
        Err(_) => CallOutcome::failure(ErrorKind::Cancelled, "tool worker aborted"),
    }
}
