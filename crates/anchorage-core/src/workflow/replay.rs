//! Replay machinery.
//!
//! - `ReplayLog` indexes recorded History by `call_id` so a re-executed
//!   workflow function can be answered from History instead of running
//!   side effects.
//! - `ReplayGate` releases recorded resolutions (activity results, fired
//!   timers, signal arrivals) strictly in History order, so concurrently
//!   launched calls observe the same completion order as the original run.
//! - `Mailbox` buffers signal payloads per name, FIFO.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anchorage_types::error::EngineError;
use anchorage_types::workflow::{EventKind, HistoryEvent, SignalPayload};
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ReplayLog
// ---------------------------------------------------------------------------

/// The recorded half of one workflow call.
#[derive(Debug, Clone)]
pub(crate) struct RecordedCall {
    /// `ActivityScheduled` or `TimerStarted`.
    pub scheduled: HistoryEvent,
    /// Matching resolution, if the call finished before the last save.
    pub resolution: Option<HistoryEvent>,
}

/// Recorded calls of an instance keyed by `call_id`.
#[derive(Debug, Default)]
pub(crate) struct ReplayLog {
    calls: HashMap<u64, RecordedCall>,
    last_call: u64,
}

impl ReplayLog {
    pub(crate) fn from_history(history: &[HistoryEvent]) -> Result<Self, EngineError> {
        let mut log = Self::default();
        for event in history {
            let Some(call_id) = event.call_id else {
                continue;
            };
            match event.kind {
                EventKind::ActivityScheduled | EventKind::TimerStarted => {
                    if log.calls.contains_key(&call_id) {
                        return Err(corrupt(call_id, "call scheduled twice"));
                    }
                    log.calls.insert(
                        call_id,
                        RecordedCall {
                            scheduled: event.clone(),
                            resolution: None,
                        },
                    );
                    log.last_call = log.last_call.max(call_id);
                }
                EventKind::ActivityCompleted | EventKind::ActivityFailed | EventKind::TimerFired => {
                    let call = log
                        .calls
                        .get_mut(&call_id)
                        .ok_or_else(|| corrupt(call_id, "resolution without a scheduled event"))?;
                    let expected = match call.scheduled.kind {
                        EventKind::ActivityScheduled => {
                            matches!(event.kind, EventKind::ActivityCompleted | EventKind::ActivityFailed)
                        }
                        _ => event.kind == EventKind::TimerFired,
                    };
                    if !expected || call.resolution.is_some() {
                        return Err(corrupt(
                            call_id,
                            &format!("unexpected {} after {}", event.kind, call.scheduled.kind),
                        ));
                    }
                    call.resolution = Some(event.clone());
                }
                _ => {}
            }
        }
        Ok(log)
    }

    pub(crate) fn get(&self, call_id: u64) -> Option<&RecordedCall> {
        self.calls.get(&call_id)
    }

    /// Highest recorded `call_id` (0 for an empty History).
    pub(crate) fn last_call(&self) -> u64 {
        self.last_call
    }
}

fn corrupt(call_id: u64, detail: &str) -> EngineError {
    EngineError::NonDeterministic {
        call_id,
        detail: format!("history is inconsistent: {detail}"),
    }
}

// ---------------------------------------------------------------------------
// Mailbox
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MailboxState {
    queues: HashMap<String, VecDeque<Value>>,
    closed: bool,
}

/// Per-instance, per-name FIFO signal buffer.
#[derive(Clone)]
pub(crate) struct Mailbox {
    state: Arc<Mutex<MailboxState>>,
    notify: Arc<watch::Sender<u64>>,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            state: Arc::default(),
            notify: Arc::new(watch::Sender::new(0)),
        }
    }
}

impl Mailbox {
    pub(crate) fn deliver(&self, name: &str, payload: Value) {
        lock(&self.state)
            .queues
            .entry(name.to_string())
            .or_default()
            .push_back(payload);
        self.notify.send_modify(|v| *v += 1);
    }

    /// Wake every waiting receiver with `None`.
    pub(crate) fn close(&self) {
        lock(&self.state).closed = true;
        self.notify.send_modify(|v| *v += 1);
    }

    /// Next payload for `name`; `None` once closed or cancelled.
    pub(crate) async fn recv(&self, name: &str, token: &CancellationToken) -> Option<Value> {
        let mut changes = self.notify.subscribe();
        loop {
            {
                let mut state = lock(&self.state);
                if let Some(payload) = state.queues.get_mut(name).and_then(VecDeque::pop_front) {
                    return Some(payload);
                }
                if state.closed {
                    return None;
                }
            }
            tokio::select! {
                _ = token.cancelled() => return None,
                changed = changes.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }

    pub(crate) fn pending(&self, name: &str) -> usize {
        lock(&self.state).queues.get(name).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// ReplayGate
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum GateEntry {
    /// A recorded activity/timer resolution, by History sequence.
    Resolution(u64),
    /// A signal arrival, delivered to the mailbox when it reaches the head.
    Signal(SignalPayload),
}

/// Orders recorded resolutions during replay.
pub(crate) struct ReplayGate {
    queue: Mutex<VecDeque<GateEntry>>,
    turn: watch::Sender<u64>,
    mailbox: Mailbox,
}

impl ReplayGate {
    pub(crate) fn from_history(history: &[HistoryEvent], mailbox: Mailbox) -> Result<Self, EngineError> {
        let mut queue = VecDeque::new();
        for event in history.iter().filter(|e| e.kind.is_resolution()) {
            let entry = if event.kind == EventKind::SignalReceived {
                GateEntry::Signal(event.decode()?)
            } else {
                GateEntry::Resolution(event.sequence)
            };
            queue.push_back(entry);
        }
        let gate = Self {
            queue: Mutex::new(queue),
            turn: watch::Sender::new(0),
            mailbox,
        };
        gate.pump(&mut lock(&gate.queue));
        Ok(gate)
    }

    /// Deliver every signal at the head of the queue.
    fn pump(&self, queue: &mut VecDeque<GateEntry>) {
        while let Some(GateEntry::Signal(_)) = queue.front() {
            if let Some(GateEntry::Signal(signal)) = queue.pop_front() {
                self.mailbox.deliver(&signal.name, signal.payload);
            }
        }
    }

    fn advance(&self) {
        self.turn.send_modify(|v| *v += 1);
    }

    pub(crate) fn is_drained(&self) -> bool {
        lock(&self.queue).is_empty()
    }

    /// Claim the recorded resolution at `sequence`. Dropping the returned
    /// turn without completing it removes the entry from the queue.
    pub(crate) fn claim(&self, sequence: u64) -> Turn<'_> {
        Turn {
            gate: self,
            sequence,
            done: false,
        }
    }

    /// Wait until every recorded resolution has been consumed. Live
    /// resolutions call this before appending, so they land after the
    /// recorded ones in both this run and any later replay.
    pub(crate) async fn wait_drained(&self, token: &CancellationToken) -> Result<(), EngineError> {
        let mut turns = self.turn.subscribe();
        loop {
            if self.is_drained() {
                return Ok(());
            }
            wait_for_turn(&mut turns, token).await?;
        }
    }

    /// Route a live signal through the queue if recorded resolutions are
    /// still pending, otherwise straight into the mailbox.
    pub(crate) fn push_live_signal(&self, signal: SignalPayload) {
        let mut queue = lock(&self.queue);
        if queue.is_empty() {
            drop(queue);
            self.mailbox.deliver(&signal.name, signal.payload);
        } else {
            queue.push_back(GateEntry::Signal(signal));
        }
    }

    fn remove(&self, sequence: u64) {
        let mut queue = lock(&self.queue);
        if let Some(pos) = queue
            .iter()
            .position(|e| *e == GateEntry::Resolution(sequence))
        {
            queue.remove(pos);
            self.pump(&mut queue);
        }
        drop(queue);
        self.advance();
    }
}

async fn wait_for_turn(
    turns: &mut watch::Receiver<u64>,
    token: &CancellationToken,
) -> Result<(), EngineError> {
    tokio::select! {
        _ = token.cancelled() => Err(EngineError::Cancelled),
        changed = turns.changed() => changed.map_err(|_| EngineError::Cancelled),
    }
}

/// A claimed position in the replay queue.
pub(crate) struct Turn<'a> {
    gate: &'a ReplayGate,
    sequence: u64,
    done: bool,
}

impl Turn<'_> {
    /// Wait until this resolution is at the head of the queue.
    pub(crate) async fn wait(&mut self, token: &CancellationToken) -> Result<(), EngineError> {
        let mut turns = self.gate.turn.subscribe();
        loop {
            let at_head = lock(&self.gate.queue).front() == Some(&GateEntry::Resolution(self.sequence));
            if at_head {
                return Ok(());
            }
            wait_for_turn(&mut turns, token).await?;
        }
    }

    /// Consume the resolution and release the next one.
    pub(crate) fn complete(mut self) {
        self.done = true;
        self.gate.remove(self.sequence);
    }
}

impl Drop for Turn<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.gate.remove(self.sequence);
        }
    }
}
