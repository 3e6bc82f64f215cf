//! Channels, `select`, and `scope`/`spawn` blocks (spec C9).
//!
//! Channel send/receive/close is grounded on the teacher's
//! `crates/runtime/src/channel.rs`, minus its global ID-registry: that
//! registry exists only so an `extern "C"` caller can hold an opaque
//! integer handle instead of a real pointer. `Value::Channel` already owns
//! an `Arc<ChannelData>` directly (`core::value`), so a clone of the
//! `Value` is the handle — cloning it across a spawned coroutine is just an
//! `Arc` bump, exactly like the teacher's own `Arc<ChannelData>` comment
//! says. `scope`/`spawn` join tracking (an atomic active-count plus a
//! condvar barrier) is ported from `crates/runtime/src/scheduler.rs`'s
//! `ACTIVE_STRANDS`/`SHUTDOWN_CONDVAR`, scoped per block instead of
//! process-global so nested `scope` blocks don't interfere with each
//! other's join barrier.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use phase_core::{ChannelData, Value, ValueKind};
use rand::seq::SliceRandom;

use crate::error::EvalError;

/// Default queue depth when a script asks for an unbuffered (rendezvous)
/// channel; `may`'s mpmc queue needs capacity >= 1, so true zero-capacity
/// handoff is approximated with a depth-1 buffer (documented, not hidden).
const RENDEZVOUS_CAPACITY: usize = 1;

pub fn make_channel(capacity: usize) -> Value {
    let cap = capacity.max(RENDEZVOUS_CAPACITY);
    let (sender, receiver) = may::sync::mpmc::bounded(cap);
    let data = ChannelData { sender, receiver, closed: std::sync::atomic::AtomicBool::new(false) };
    Value::flux(ValueKind::Channel(Arc::new(data)))
}

fn as_channel(v: &Value) -> Result<&Arc<ChannelData>, EvalError> {
    match &v.kind {
        ValueKind::Channel(c) => Ok(c),
        other => Err(EvalError::type_error(format!("expected a channel, got {}", other_name(other)))),
    }
}

fn other_name(kind: &ValueKind) -> String {
    Value::new(kind.clone(), phase_core::Phase::Flux).type_name().to_string()
}

/// Only crystal-phase values (or the always-immutable scalar kinds) may
/// cross a channel: a flux value would let the receiver observe mutation
/// from a heap it doesn't own (spec 4.8/4.9 send constraint).
fn check_sendable(value: &Value) -> Result<(), EvalError> {
    let always_ok = matches!(
        value.kind,
        ValueKind::Int(_) | ValueKind::Float(_) | ValueKind::Bool(_) | ValueKind::Unit | ValueKind::Nil
    );
    if always_ok || value.phase == phase_core::Phase::Crystal {
        Ok(())
    } else {
        Err(EvalError::PhaseViolation {
            message: format!("Channel.send requires a crystal value, got {} ({})", value.type_name(), value.phase),
            trace: Vec::new(),
        })
    }
}

/// Sends `value` into the channel. Ownership transfer through
/// `may::sync::mpmc::Sender` already gives the "deep-cloned except
/// Channel/Ref" semantics spec 4.9 asks for: our containers don't alias
/// unless they hold a `Channel` or `Ref`, which legitimately should share.
pub fn send(chan: &Value, value: Value) -> Result<(), EvalError> {
    let data = as_channel(chan)?;
    check_sendable(&value)?;
    if data.closed.load(Ordering::Acquire) {
        return Err(EvalError::ChannelClosed { trace: Vec::new() });
    }
    data.sender.send(value).map_err(|_| EvalError::ChannelClosed { trace: Vec::new() })
}

/// Blocking receive. Returns `Ok(None)` once the channel is closed and
/// drained, matching close-idempotence (P9): repeated receives after that
/// point keep returning `Ok(None)` rather than erroring.
pub fn receive(chan: &Value) -> Result<Option<Value>, EvalError> {
    let data = as_channel(chan)?;
    match data.receiver.recv() {
        Ok(v) => Ok(Some(v)),
        Err(_) => Ok(None),
    }
}

/// Non-blocking receive, used by `select`'s initial scan.
pub fn try_receive(chan: &Value) -> Result<Option<Value>, EvalError> {
    let data = as_channel(chan)?;
    match data.receiver.try_recv() {
        Ok(v) => Ok(Some(v)),
        Err(may::sync::mpmc::TryRecvError::Empty) => Ok(None),
        Err(may::sync::mpmc::TryRecvError::Disconnected) => Ok(None),
    }
}

pub fn try_send(chan: &Value, value: Value) -> Result<bool, EvalError> {
    let data = as_channel(chan)?;
    check_sendable(&value)?;
    if data.closed.load(Ordering::Acquire) {
        return Err(EvalError::ChannelClosed { trace: Vec::new() });
    }
    match data.sender.try_send(value) {
        Ok(()) => Ok(true),
        Err(may::sync::mpmc::TrySendError::Full(_)) => Ok(false),
        Err(may::sync::mpmc::TrySendError::Disconnected(_)) => {
            Err(EvalError::ChannelClosed { trace: Vec::new() })
        }
    }
}

/// Idempotent close (P9): closing twice is a no-op, not an error.
pub fn close(chan: &Value) -> Result<(), EvalError> {
    let data = as_channel(chan)?;
    data.closed.store(true, Ordering::Release);
    Ok(())
}

pub fn is_closed(chan: &Value) -> Result<bool, EvalError> {
    Ok(as_channel(chan)?.closed.load(Ordering::Acquire))
}

/// One `select` arm, pre-resolved to a concrete channel handle.
pub struct SelectCandidate<'a> {
    pub channel: &'a Value,
    pub is_send: bool,
    pub send_value: Option<Value>,
}

pub enum SelectOutcome {
    /// Index into the candidate slice, plus the received value for a recv
    /// arm (`None` for a send arm, which only needed to succeed).
    Ready(usize, Option<Value>),
    Default,
    TimedOut,
}

/// One non-blocking pass over every candidate arm in a shuffled order
/// (spec 4.9's "shuffle, then non-blocking scan" description), so that
/// when multiple channels are simultaneously ready no single arm is
/// starved by always being checked last.
pub fn select_scan(candidates: &mut [SelectCandidate]) -> Result<Option<SelectOutcome>, EvalError> {
    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.shuffle(&mut rand::thread_rng());

    for idx in order {
        let candidate = &mut candidates[idx];
        if candidate.is_send {
            let value = candidate.send_value.take().expect("send arm without a value");
            if try_send(candidate.channel, value.clone())? {
                return Ok(Some(SelectOutcome::Ready(idx, None)));
            }
            candidate.send_value = Some(value);
        } else if let Some(v) = try_receive(candidate.channel)? {
            return Ok(Some(SelectOutcome::Ready(idx, Some(v))));
        }
    }
    Ok(None)
}

/// Runs `select_scan` in a loop, backing off briefly between empty passes,
/// until something is ready, the `default` arm applies (no waiting at
/// all), or `timeout` elapses.
pub fn select_blocking(
    candidates: &mut [SelectCandidate],
    has_default: bool,
    timeout: Option<Duration>,
) -> Result<SelectOutcome, EvalError> {
    if let Some(outcome) = select_scan(candidates)? {
        return Ok(outcome);
    }
    if has_default {
        return Ok(SelectOutcome::Default);
    }
    let deadline = timeout.map(|d| std::time::Instant::now() + d);
    loop {
        std::thread::sleep(Duration::from_micros(200));
        if let Some(outcome) = select_scan(candidates)? {
            return Ok(outcome);
        }
        if let Some(deadline) = deadline {
            if std::time::Instant::now() >= deadline {
                return Ok(SelectOutcome::TimedOut);
            }
        }
    }
}

/// Join barrier for one `scope { ... }` block: every `spawn`ed child
/// strand increments `active` on start and decrements (notifying the
/// condvar) on completion; `join_all` blocks until the count returns to
/// zero (spec 4.9, P10 scope-block join guarantee). A single first error
/// from any child (or `Return`/`Break`/`Continue` escaping a spawn body,
/// which is concurrency misuse) is latched and surfaced by `join_all`;
/// later errors are discarded.
#[derive(Clone)]
pub struct ScopeJoin {
    active: Arc<AtomicUsize>,
    gate: Arc<(Mutex<()>, Condvar)>,
    first_error: Arc<Mutex<Option<EvalError>>>,
}

impl ScopeJoin {
    pub fn new() -> Self {
        ScopeJoin {
            active: Arc::new(AtomicUsize::new(0)),
            gate: Arc::new((Mutex::new(()), Condvar::new())),
            first_error: Arc::new(Mutex::new(None)),
        }
    }

    /// Spawns `f` as a `may` green thread, tracked by this scope's barrier.
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() -> Result<(), EvalError> + Send + 'static,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let active = self.active.clone();
        let gate = self.gate.clone();
        let first_error = self.first_error.clone();
        may::coroutine::spawn(move || {
            if let Err(e) = f() {
                let mut slot = first_error.lock().unwrap();
                if slot.is_none() {
                    *slot = Some(e);
                }
            }
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                let (lock, cvar) = &*gate;
                let _guard = lock.lock().unwrap();
                cvar.notify_all();
            }
        });
    }

    /// Blocks the calling strand until every spawned child has completed,
    /// then surfaces the first child error encountered, if any.
    pub fn join_all(&self) -> Result<(), EvalError> {
        let (lock, cvar) = &*self.gate;
        let mut guard = lock.lock().unwrap();
        while self.active.load(Ordering::SeqCst) > 0 {
            guard = cvar.wait(guard).unwrap();
        }
        drop(guard);
        match self.first_error.lock().unwrap().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }
}

impl Default for ScopeJoin {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_then_receive_roundtrips() {
        let chan = make_channel(1);
        send(&chan, Value::int(42)).unwrap();
        let v = receive(&chan).unwrap().unwrap();
        assert!(v.eq_value(&Value::int(42)));
    }

    #[test]
    fn close_is_idempotent() {
        let chan = make_channel(1);
        close(&chan).unwrap();
        close(&chan).unwrap();
        assert!(is_closed(&chan).unwrap());
    }

    #[test]
    fn receive_after_close_and_drain_returns_none() {
        let chan = make_channel(1);
        send(&chan, Value::int(1)).unwrap();
        close(&chan).unwrap();
        assert!(receive(&chan).unwrap().is_some());
        assert!(receive(&chan).unwrap().is_none());
    }

    #[test]
    fn send_rejects_flux_value() {
        let chan = make_channel(1);
        let flux_array = Value::array(vec![Value::int(1)]);
        let err = send(&chan, flux_array).unwrap_err();
        assert!(matches!(err, EvalError::PhaseViolation { .. }));
    }

    #[test]
    fn send_accepts_crystal_value() {
        let chan = make_channel(1);
        let crystal_array = Value::new(ValueKind::Array(vec![Value::int(1)]), phase_core::Phase::Crystal);
        assert!(send(&chan, crystal_array).is_ok());
    }

    #[test]
    fn scope_join_waits_for_spawned_children() {
        let scope = ScopeJoin::new();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let counter = counter.clone();
            scope.spawn(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        scope.join_all().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn join_all_surfaces_first_child_error() {
        let scope = ScopeJoin::new();
        scope.spawn(|| Ok(()));
        scope.spawn(|| Err(EvalError::ConcurrencyMisuse { message: "boom".into(), trace: Vec::new() }));
        let err = scope.join_all().unwrap_err();
        assert!(matches!(err, EvalError::ConcurrencyMisuse { .. }));
    }
}
