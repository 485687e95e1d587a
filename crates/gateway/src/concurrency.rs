//! Admission control and single-flight deduplication.
//!
//! Permits are acquired global → provider (the session layer is handled by
//! the session manager before this point) and released in reverse. A call's
//! fingerprint is computed before any permit is taken: if an identical call
//! is already in flight the new call attaches as a waiter and consumes no
//! provider capacity.

use std::{
    sync::{Arc, atomic::AtomicUsize},
    time::Instant,
};

use {
    dashmap::DashMap,
    serde_json::Value,
    sha2::{Digest, Sha256},
    tokio::sync::{OwnedSemaphorePermit, Semaphore, watch},
    tokio_util::sync::CancellationToken,
    uuid::Uuid,
};

use {
    relay_metrics::{counter, daemon},
    relay_protocol::{ErrorKind, ErrorShape, UsageInfo},
};

use crate::health::HealthState;

/// Argument keys elided from fingerprints: they vary per request without
/// changing what the call computes.
const VOLATILE_KEYS: &[&str] = &["request_id", "timestamp", "_ts", "nonce"];

/// A permit granted with less than this left on the clock cannot complete a
/// provider call; waiting that long must fail `Overloaded`, not `TimedOut`.
pub const PERMIT_HEADROOM: std::time::Duration = std::time::Duration::from_millis(50);

/// Deadline for permit waits: headroom short of the call deadline.
#[must_use]
pub fn permit_deadline(deadline: Instant) -> Instant {
    deadline.checked_sub(PERMIT_HEADROOM).unwrap_or(deadline)
}

// ── Fingerprint ──────────────────────────────────────────────────────────────

/// Stable hash over `(tool, normalized arguments, continuation, scope)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    #[must_use]
    pub fn compute(
        tool: &str,
        arguments: &serde_json::Map<String, Value>,
        continuation_id: Option<Uuid>,
        session_scope: Option<Uuid>,
    ) -> Self {
        let mut canonical = String::new();
        canonicalize_map(arguments, true, &mut canonical);

        let mut hasher = Sha256::new();
        hasher.update(tool.as_bytes());
        hasher.update([0]);
        hasher.update(canonical.as_bytes());
        hasher.update([0]);
        match continuation_id {
            Some(id) => hasher.update(id.as_bytes()),
            None => hasher.update(b"-"),
        }
        hasher.update([0]);
        match session_scope {
            Some(id) => hasher.update(id.as_bytes()),
            None => hasher.update(b"global"),
        }
        Self(hasher.finalize().into())
    }

    #[must_use]
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

fn canonicalize_map(map: &serde_json::Map<String, Value>, top_level: bool, out: &mut String) {
    out.push('{');
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    let mut first = true;
    for key in keys {
        if top_level && VOLATILE_KEYS.contains(&key.as_str()) {
            continue;
        }
        if !first {
            out.push(',');
        }
        first = false;
        out.push_str(key);
        out.push(':');
        if let Some(value) = map.get(key) {
            canonicalize_value(value, out);
        }
    }
    out.push('}');
}

fn canonicalize_value(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => canonicalize_map(map, false, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonicalize_value(item, out);
            }
            out.push(']');
        },
        other => out.push_str(&other.to_string()),
    }
}

// ── Call outcome ─────────────────────────────────────────────────────────────

/// Terminal outcome shared between a single-flight leader and its waiters.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    Success {
        value: Value,
        usage: Option<UsageInfo>,
        continuation_id: Option<Uuid>,
    },
    Failure(ErrorShape),
}

impl CallOutcome {
    #[must_use]
    pub fn failure(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::Failure(ErrorShape::new(kind, message))
    }
}

// ── Single-flight map ────────────────────────────────────────────────────────

struct Flight {
    tx: watch::Sender<Option<CallOutcome>>,
    waiters: AtomicUsize,
}

/// How a call joined the flight for its fingerprint.
pub enum FlightRole {
    /// First call for this fingerprint: executes the tool and settles.
    Leader(FlightGuard),
    /// Attached to an in-flight leader: awaits the shared outcome.
    Waiter(watch::Receiver<Option<CallOutcome>>),
}

/// Held by the leader; settling publishes the outcome to every waiter and
/// retires the fingerprint. Dropping without settling publishes `Cancelled`.
pub struct FlightGuard {
    inflight: Arc<DashMap<Fingerprint, Flight>>,
    fingerprint: Fingerprint,
    settled: bool,
}

impl FlightGuard {
    pub fn settle(mut self, outcome: CallOutcome) {
        self.publish(outcome);
        self.settled = true;
    }

    fn publish(&self, outcome: CallOutcome) {
        if let Some((_, flight)) = self.inflight.remove(&self.fingerprint) {
            let _ = flight.tx.send(Some(outcome));
        }
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.publish(CallOutcome::failure(
                ErrorKind::Cancelled,
                "single-flight leader did not complete",
            ));
        }
    }
}

// ── Controller ───────────────────────────────────────────────────────────────

pub struct ConcurrencyController {
    global: Arc<Semaphore>,
    provider_cap: usize,
    per_provider: DashMap<String, Arc<Semaphore>>,
    inflight: Arc<DashMap<Fingerprint, Flight>>,
    health: Arc<HealthState>,
}

/// Global permit wrapper keeping the inflight gauge honest.
pub struct GlobalPermit {
    _permit: OwnedSemaphorePermit,
    health: Arc<HealthState>,
}

impl Drop for GlobalPermit {
    fn drop(&mut self) {
        self.health.inflight_dec();
    }
}

impl ConcurrencyController {
    #[must_use]
    pub fn new(global_cap: usize, provider_cap: usize, health: Arc<HealthState>) -> Self {
        Self {
            global: Arc::new(Semaphore::new(global_cap.max(1))),
            provider_cap: provider_cap.max(1),
            per_provider: DashMap::new(),
            inflight: Arc::new(DashMap::new()),
            health,
        }
    }

    /// Join the flight for a fingerprint: leader if first, waiter otherwise.
    #[must_use]
    pub fn join_flight(&self, fingerprint: Fingerprint) -> FlightRole {
        use dashmap::mapref::entry::Entry;
        match self.inflight.entry(fingerprint) {
            Entry::Occupied(occupied) => {
                occupied
                    .get()
                    .waiters
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                counter!(daemon::SINGLEFLIGHT_DEDUP_TOTAL).increment(1);
                FlightRole::Waiter(occupied.get().tx.subscribe())
            },
            Entry::Vacant(vacant) => {
                let (tx, _rx) = watch::channel(None);
                vacant.insert(Flight {
                    tx,
                    waiters: AtomicUsize::new(0),
                });
                FlightRole::Leader(FlightGuard {
                    inflight: Arc::clone(&self.inflight),
                    fingerprint,
                    settled: false,
                })
            },
        }
    }

    /// Await a leader's outcome. Cancelling a waiter only detaches it.
    pub async fn await_leader(
        mut rx: watch::Receiver<Option<CallOutcome>>,
        cancel: &CancellationToken,
        deadline: Instant,
    ) -> CallOutcome {
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return CallOutcome::failure(ErrorKind::Cancelled, "call cancelled");
                },
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                    return CallOutcome::failure(ErrorKind::TimedOut, "deadline expired while waiting on identical call");
                },
                changed = rx.changed() => {
                    if changed.is_err() {
                        return CallOutcome::failure(ErrorKind::Cancelled, "leader went away");
                    }
                },
            }
        }
    }

    /// Acquire the daemon-wide permit, waiting no longer than the deadline.
    pub async fn acquire_global(&self, deadline: Instant) -> Result<GlobalPermit, ErrorShape> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, Arc::clone(&self.global).acquire_owned()).await {
            Ok(Ok(permit)) => {
                self.health.inflight_inc();
                Ok(GlobalPermit {
                    _permit: permit,
                    health: Arc::clone(&self.health),
                })
            },
            Ok(Err(_)) => Err(ErrorShape::new(
                ErrorKind::Internal,
                "global semaphore closed",
            )),
            Err(_) => Err(ErrorShape::new(
                ErrorKind::Overloaded,
                "daemon concurrency saturated",
            )),
        }
    }

    /// Acquire a per-provider permit, waiting no longer than the deadline.
    pub async fn acquire_provider(
        &self,
        provider: &str,
        deadline: Instant,
    ) -> Result<OwnedSemaphorePermit, ErrorShape> {
        let semaphore = Arc::clone(
            &self
                .per_provider
                .entry(provider.to_string())
                .or_insert_with(|| Arc::new(Semaphore::new(self.provider_cap))),
        );
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, semaphore.acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(ErrorShape::new(
                ErrorKind::Internal,
                "provider semaphore closed",
            )),
            Err(_) => Err(ErrorShape::new(
                ErrorKind::Overloaded,
                format!("provider {provider} concurrency saturated"),
            )),
        }
    }

    /// Number of distinct fingerprints currently in flight.
    #[must_use]
    pub fn inflight_fingerprints(&self) -> usize {
        self.inflight.len()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    fn args(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn controller(global: usize, provider: usize) -> ConcurrencyController {
        ConcurrencyController::new(global, provider, Arc::new(HealthState::new()))
    }

    #[test]
    fn fingerprint_ignores_key_order_and_volatile_fields() {
        let a = Fingerprint::compute(
            "chat",
            &args(&[
                ("prompt", json!("hi")),
                ("model", json!("auto")),
                ("request_id", json!("r1")),
            ]),
            None,
            None,
        );
        let b = Fingerprint::compute(
            "chat",
            &args(&[
                ("model", json!("auto")),
                ("prompt", json!("hi")),
                ("request_id", json!("r2")),
                ("timestamp", json!(123456)),
            ]),
            None,
            None,
        );
        assert_eq!(a, b);
    }

    #[test]
    fn fingerprint_separates_tools_sessions_and_continuations() {
        let arguments = args(&[("prompt", json!("hi"))]);
        let base = Fingerprint::compute("chat", &arguments, None, None);
        assert_ne!(base, Fingerprint::compute("analyze", &arguments, None, None));
        assert_ne!(
            base,
            Fingerprint::compute("chat", &arguments, Some(Uuid::new_v4()), None)
        );
        assert_ne!(
            base,
            Fingerprint::compute("chat", &arguments, None, Some(Uuid::new_v4()))
        );
    }

    #[test]
    fn nested_objects_canonicalize_recursively() {
        let a = Fingerprint::compute(
            "t",
            &args(&[("cfg", json!({ "b": 1, "a": [1, 2] }))]),
            None,
            None,
        );
        let b = Fingerprint::compute(
            "t",
            &args(&[("cfg", json!({ "a": [1, 2], "b": 1 }))]),
            None,
            None,
        );
        assert_eq!(a, b);
        // Nested volatile-looking keys are NOT elided.
        let c = Fingerprint::compute(
            "t",
            &args(&[("cfg", json!({ "a": [1, 2], "b": 1, "timestamp": 9 }))]),
            None,
            None,
        );
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn waiter_receives_the_leader_outcome() {
        let controller = controller(4, 4);
        let fp = Fingerprint::compute("chat", &args(&[("p", json!("x"))]), None, None);

        let FlightRole::Leader(guard) = controller.join_flight(fp) else {
            panic!("first join must lead");
        };
        let FlightRole::Waiter(rx) = controller.join_flight(fp) else {
            panic!("second join must wait");
        };

        let cancel = CancellationToken::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        let waiter = tokio::spawn(async move {
            ConcurrencyController::await_leader(rx, &cancel, deadline).await
        });

        guard.settle(CallOutcome::Success {
            value: json!({ "answer": 42 }),
            usage: None,
            continuation_id: None,
        });

        match waiter.await.unwrap() {
            CallOutcome::Success { value, .. } => assert_eq!(value["answer"], 42),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(controller.inflight_fingerprints(), 0);
    }

    #[tokio::test]
    async fn dropped_leader_cancels_waiters() {
        let controller = controller(4, 4);
        let fp = Fingerprint::compute("chat", &args(&[("p", json!("y"))]), None, None);

        let FlightRole::Leader(guard) = controller.join_flight(fp) else {
            panic!("first join must lead");
        };
        let FlightRole::Waiter(rx) = controller.join_flight(fp) else {
            panic!("second join must wait");
        };

        drop(guard);

        let cancel = CancellationToken::new();
        let outcome = ConcurrencyController::await_leader(
            rx,
            &cancel,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        match outcome {
            CallOutcome::Failure(shape) => assert_eq!(shape.kind, ErrorKind::Cancelled),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancelled_waiter_detaches_without_touching_the_leader() {
        let controller = controller(4, 4);
        let fp = Fingerprint::compute("chat", &args(&[("p", json!("z"))]), None, None);

        let FlightRole::Leader(_guard) = controller.join_flight(fp) else {
            panic!("first join must lead");
        };
        let FlightRole::Waiter(rx) = controller.join_flight(fp) else {
            panic!("second join must wait");
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = ConcurrencyController::await_leader(
            rx,
            &cancel,
            Instant::now() + Duration::from_secs(5),
        )
        .await;
        assert!(matches!(
            outcome,
            CallOutcome::Failure(ErrorShape {
                kind: ErrorKind::Cancelled,
                ..
            })
        ));
        // The leader's flight is still registered.
        assert_eq!(controller.inflight_fingerprints(), 1);
    }

    #[tokio::test]
    async fn saturated_global_semaphore_fails_overloaded() {
        let controller = controller(1, 4);
        let _held = controller
            .acquire_global(Instant::now() + Duration::from_secs(1))
            .await;
        let Err(err) = controller
            .acquire_global(Instant::now() + Duration::from_millis(20))
            .await
        else {
            panic!("second acquire must fail");
        };
        assert_eq!(err.kind, ErrorKind::Overloaded);
        assert!(err.retryable);
    }

    #[tokio::test]
    async fn provider_permits_are_isolated_per_provider() {
        let controller = controller(8, 1);
        let deadline = Instant::now() + Duration::from_millis(50);
        let _kimi = controller.acquire_provider("kimi", deadline).await.unwrap();
        // Same provider saturates…
        assert!(controller.acquire_provider("kimi", deadline).await.is_err());
        // …another provider does not.
        assert!(controller.acquire_provider("glm", deadline).await.is_ok());
    }

    #[tokio::test]
    async fn released_global_permit_restores_capacity() {
        let controller = controller(1, 1);
        let permit = controller
            .acquire_global(Instant::now() + Duration::from_secs(1))
            .await
            .unwrap();
        drop(permit);
        assert!(
            controller
                .acquire_global(Instant::now() + Duration::from_secs(1))
                .await
                .is_ok()
        );
    }
}
