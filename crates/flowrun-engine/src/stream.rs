use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use flowrun_core::types::{Completion, LogEvent, RunId, RunOutcome};

struct StreamEntry {
    tx: broadcast::Sender<LogEvent>,
    closed: Option<(Completion, Instant)>,
}

impl StreamEntry {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, closed: None }
    }
}

/// Per-run live event channels.
///
/// Streams are created on demand by whichever side arrives first, the engine
/// starting the run or a listener attaching early. Each stream is a bounded
/// broadcast channel, so listeners see only events published after they
/// subscribe, and a listener that falls more than `capacity` events behind
/// skips the oldest ones.
pub struct LogStreamRegistry {
    capacity: usize,
    streams: Mutex<HashMap<RunId, StreamEntry>>,
}

impl LogStreamRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RunId, StreamEntry>> {
        self.streams.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the stream for a run if it does not exist yet.
    pub fn create(&self, run_id: &RunId) {
        let capacity = self.capacity;
        self.lock()
            .entry(run_id.clone())
            .or_insert_with(|| StreamEntry::new(capacity));
    }

    /// Publish an event. No-op if the run has no open stream.
    pub fn publish(&self, run_id: &RunId, event: LogEvent) {
        let streams = self.lock();
        if let Some(entry) = streams.get(run_id) {
            if entry.closed.is_none() {
                let _ = entry.tx.send(event);
            }
        }
    }

    /// Publish the completion marker and mark the stream closed.
    pub fn close(&self, run_id: &RunId, outcome: RunOutcome) {
        let capacity = self.capacity;
        let mut streams = self.lock();
        let entry = streams
            .entry(run_id.clone())
            .or_insert_with(|| StreamEntry::new(capacity));
        if entry.closed.is_some() {
            return;
        }
        let completion = Completion::new(outcome);
        let _ = entry.tx.send(LogEvent::Completed(completion.clone()));
        entry.closed = Some((completion, Instant::now()));
        debug!(run_id = %run_id, listeners = entry.tx.receiver_count(), "Log stream closed");
    }

    /// Attach a live listener, creating the stream if needed.
    ///
    /// Attaching to a closed stream yields only its completion marker.
    pub fn subscribe(&self, run_id: &RunId) -> LogSubscription {
        let capacity = self.capacity;
        let mut streams = self.lock();
        let entry = streams
            .entry(run_id.clone())
            .or_insert_with(|| StreamEntry::new(capacity));
        match &entry.closed {
            Some((completion, _)) => LogSubscription::finished(run_id.clone(), completion.clone()),
            None => LogSubscription::live(run_id.clone(), entry.tx.subscribe()),
        }
    }

    pub fn contains(&self, run_id: &RunId) -> bool {
        self.lock().contains_key(run_id)
    }

    pub fn is_closed(&self, run_id: &RunId) -> bool {
        self.lock()
            .get(run_id)
            .is_some_and(|entry| entry.closed.is_some())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop streams closed for longer than `retention`. Returns how many.
    pub fn evict_closed(&self, retention: Duration) -> usize {
        let mut streams = self.lock();
        let before = streams.len();
        streams.retain(|_, entry| match &entry.closed {
            Some((_, closed_at)) => closed_at.elapsed() < retention,
            None => true,
        });
        let evicted = before - streams.len();
        if evicted > 0 {
            debug!(evicted, "Evicted closed log streams");
        }
        evicted
    }
}

/// A listener's view of one run's log stream.
///
/// Yields node events in execution order and ends after the completion
/// marker.
pub struct LogSubscription {
    run_id: RunId,
    rx: Option<broadcast::Receiver<LogEvent>>,
    pending: Option<Completion>,
    finished: bool,
}

impl LogSubscription {
    fn live(run_id: RunId, rx: broadcast::Receiver<LogEvent>) -> Self {
        Self {
            run_id,
            rx: Some(rx),
            pending: None,
            finished: false,
        }
    }

    /// A subscription that only yields `completion`.
    pub fn finished(run_id: RunId, completion: Completion) -> Self {
        Self {
            run_id,
            rx: None,
            pending: Some(completion),
            finished: false,
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Next event, or `None` once the completion marker has been returned or
    /// the stream was dropped.
    pub async fn next(&mut self) -> Option<LogEvent> {
        if self.finished {
            return None;
        }
        if let Some(completion) = self.pending.take() {
            self.finished = true;
            return Some(LogEvent::Completed(completion));
        }
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if event.is_completion() {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(run_id = %self.run_id, skipped, "Log listener lagged, skipped events");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Convert into a `Stream` of events.
    pub fn into_stream(self) -> BoxStream<'static, LogEvent> {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next().await?;
            Some((event, sub))
        })
        .boxed()
    }

    /// Read every remaining event, completion marker included.
    pub async fn collect(mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }
}
