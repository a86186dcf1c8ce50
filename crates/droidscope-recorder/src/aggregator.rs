//! Event aggregation - fragments in, finished records out
//!
//! Pending events are keyed by `(wall-clock millisecond, kind, device)`.
//! A fragment with a kind looks up or creates its event; a fragment without
//! one (coordinates, pressure) is carried onto the most recently active
//! event. Events flush when both coordinates are known or when they have
//! been pending for the buffer timeout, whichever comes first.
//!
//! A TouchDown or KeyDown waits for its foreground-app query before it can
//! flush, and its buffer timeout starts over once the query settles. The
//! reader is blocked for the length of the query, so the rest of the frame
//! is still unread when it returns.
//!
//! The aggregator never reads a clock itself. Callers pass the wall-clock
//! stamp and the monotonic `Instant`, which keeps every policy testable.

use crate::events::{Coordinates, EventKind, FinishedRecord};
use crate::tokenizer::Fragment;
use droidscope_core::apps::{AppContext, UNKNOWN};
use std::time::{Duration, Instant};
use tracing::trace;

/// Identity of a pending event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EventKey {
    pub timestamp: String,
    pub kind: EventKind,
    pub device: String,
}

/// An in-flight event, owned by the aggregator until it flushes.
#[derive(Debug, Clone)]
pub struct PendingEvent {
    pub key: EventKey,
    pub package: String,
    pub activity: String,
    pub coordinates: Coordinates,
    pub extra_info: String,
    /// Start of the buffer timeout
    pub created_at: Instant,
    /// Foreground-app query still in flight
    pub awaiting_context: bool,
}

impl PendingEvent {
    pub fn is_complete(&self) -> bool {
        self.coordinates.is_complete()
    }

    fn merge(&mut self, fragment: &Fragment) {
        if let Some(x) = fragment.x {
            self.coordinates.x = Some(x);
        }
        if let Some(y) = fragment.y {
            self.coordinates.y = Some(y);
        }
        if let Some(extra) = &fragment.extra {
            self.extra_info = extra.clone();
        }
    }

    fn finish(self, resource_id: String, event_id: u64) -> FinishedRecord {
        FinishedRecord {
            timestamp: self.key.timestamp,
            device: self.key.device,
            package: self.package,
            activity: self.activity,
            event_type: self.key.kind,
            coordinates: self.coordinates,
            resource_id,
            extra_info: self.extra_info,
            event_id,
        }
    }
}

/// Wall-clock stamp used for event keys and records.
pub fn wall_stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

pub struct Aggregator {
    /// Creation order
    pending: Vec<PendingEvent>,
    last_active: Option<EventKey>,
    /// Kind-less fields seen while no open event could take them
    carry: Fragment,
    context: AppContext,
    timeout: Duration,
    next_id: u64,
}

impl Aggregator {
    pub fn new(timeout: Duration, context: AppContext) -> Self {
        Self {
            pending: Vec::new(),
            last_active: None,
            carry: Fragment::default(),
            context,
            timeout,
            next_id: 0,
        }
    }

    pub fn context(&self) -> &AppContext {
        &self.context
    }

    pub fn pending(&self) -> &[PendingEvent] {
        &self.pending
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty()
    }

    /// Apply one fragment.
    ///
    /// Returns the event key when the fragment is a TouchDown or KeyDown; the
    /// caller should then query the foreground app and report it through
    /// [`Aggregator::update_context`].
    pub fn apply(
        &mut self,
        fragment: Fragment,
        device: &str,
        stamp: &str,
        now: Instant,
    ) -> Option<EventKey> {
        let Some(kind) = fragment.kind else {
            self.carry_forward(fragment);
            return None;
        };

        let key = EventKey {
            timestamp: stamp.to_string(),
            kind,
            device: device.to_string(),
        };
        let idx = match self.position(&key) {
            Some(idx) => idx,
            None => {
                let carried = std::mem::take(&mut self.carry);
                let mut event = PendingEvent {
                    key: key.clone(),
                    package: self.context.package.clone(),
                    activity: self.context.activity.clone(),
                    coordinates: Coordinates::default(),
                    extra_info: String::new(),
                    created_at: now,
                    awaiting_context: false,
                };
                event.merge(&carried);
                self.pending.push(event);
                self.pending.len() - 1
            }
        };
        let event = &mut self.pending[idx];
        event.merge(&fragment);
        if kind.is_significant() {
            event.awaiting_context = true;
        }
        self.last_active = Some(key.clone());

        kind.is_significant().then_some(key)
    }

    fn carry_forward(&mut self, fragment: Fragment) {
        if let Some(idx) = self.last_active.as_ref().and_then(|k| self.position(k)) {
            if !self.pending[idx].is_complete() {
                self.pending[idx].merge(&fragment);
                return;
            }
        }
        trace!(?fragment, "no open event, carrying fragment");
        if fragment.x.is_some() {
            self.carry.x = fragment.x;
        }
        if fragment.y.is_some() {
            self.carry.y = fragment.y;
        }
        if fragment.extra.is_some() {
            self.carry.extra = fragment.extra;
        }
    }

    fn position(&self, key: &EventKey) -> Option<usize> {
        self.pending.iter().position(|e| &e.key == key)
    }

    /// Record a freshly queried foreground app. Known values replace the
    /// current context and are stamped onto the event `key`, if still
    /// pending. Returns true when the context changed.
    pub fn update_context(&mut self, key: &EventKey, fresh: &AppContext, now: Instant) -> bool {
        let changed = self.context.update(fresh);
        if let Some(idx) = self.position(key) {
            let event = &mut self.pending[idx];
            event.package = self.context.package.clone();
            event.activity = self.context.activity.clone();
        }
        self.settle_context(key, now);
        changed
    }

    /// The query for `key` failed; the event keeps the context it was
    /// created with and becomes flushable again.
    pub fn settle_context(&mut self, key: &EventKey, now: Instant) {
        if let Some(idx) = self.position(key) {
            let event = &mut self.pending[idx];
            event.awaiting_context = false;
            event.created_at = now;
        }
    }

    /// Flush every event that is complete or has timed out, in creation order.
    /// Events awaiting their context query are held.
    pub fn flush_due(
        &mut self,
        now: Instant,
        resolve: impl Fn(i32, i32) -> String,
    ) -> Vec<FinishedRecord> {
        let timeout = self.timeout;
        self.flush_where(resolve, |e| {
            !e.awaiting_context
                && (e.is_complete() || now.saturating_duration_since(e.created_at) >= timeout)
        })
    }

    /// Flush everything still pending (session end).
    pub fn drain(&mut self, resolve: impl Fn(i32, i32) -> String) -> Vec<FinishedRecord> {
        self.flush_where(resolve, |_| true)
    }

    fn flush_where(
        &mut self,
        resolve: impl Fn(i32, i32) -> String,
        due: impl Fn(&PendingEvent) -> bool,
    ) -> Vec<FinishedRecord> {
        let (ready, keep): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.pending).into_iter().partition(|e| due(e));
        self.pending = keep;

        let mut records = Vec::with_capacity(ready.len());
        for event in ready {
            if self.last_active.as_ref() == Some(&event.key) {
                self.last_active = None;
            }
            let resource_id = match event.coordinates.point() {
                Some((x, y)) => resolve(x, y),
                None => UNKNOWN.to_string(),
            };
            records.push(event.finish(resource_id, self.next_id));
            self.next_id += 1;
        }
        records
    }
}
