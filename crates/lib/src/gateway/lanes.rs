//! Per-conversation lanes: inbound events for one conversation are handled one at a time,
//! in arrival order, while different conversations run concurrently.
//!
//! A lane is a worker task with an unbounded queue. It exits after `idle` without events;
//! the lane map lock is held while a lane retires so no event is queued on a dead lane.
//! Lanes waiting for events are not busy: only running handlers count toward [`Lanes::busy`].

use crate::channels::InboundEvent;
use crate::routing::ConversationKey;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;

pub type LaneHandler = Arc<dyn Fn(InboundEvent) -> BoxFuture<'static, ()> + Send + Sync>;

type LaneMap = Arc<Mutex<HashMap<ConversationKey, mpsc::UnboundedSender<InboundEvent>>>>;

pub struct Lanes {
    lanes: LaneMap,
    handler: LaneHandler,
    idle: Duration,
    in_flight: Arc<AtomicUsize>,
}

/// Counts one running handler; released on drop so a panicking handler is not counted forever.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn enter(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn lock(map: &LaneMap) -> MutexGuard<'_, HashMap<ConversationKey, mpsc::UnboundedSender<InboundEvent>>> {
    map.lock().unwrap_or_else(|p| p.into_inner())
}

impl Lanes {
    pub fn new(handler: LaneHandler, idle: Duration) -> Self {
        Self {
            lanes: Arc::new(Mutex::new(HashMap::new())),
            handler,
            idle,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Queue an event on its conversation's lane, starting the lane if needed.
    pub fn dispatch(&self, event: InboundEvent) {
        let key = event.key();
        let mut lanes = lock(&self.lanes);
        let event = match lanes.get(&key) {
            Some(tx) => match tx.send(event) {
                Ok(()) => return,
                // Worker died (handler panicked); start a new one.
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(event);
        lanes.insert(key.clone(), tx);
        tokio::spawn(run_lane(
            key,
            rx,
            self.lanes.clone(),
            self.handler.clone(),
            self.idle,
            self.in_flight.clone(),
        ));
    }

    /// Number of conversations with a live lane (running or waiting for events).
    pub fn active(&self) -> usize {
        lock(&self.lanes).len()
    }

    /// Number of events being handled right now.
    pub fn busy(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no handler is running, at most `timeout`. Returns how many were still busy.
    pub async fn drain(&self, timeout: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.busy() > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.busy()
    }
}

async fn run_lane(
    key: ConversationKey,
    mut rx: mpsc::UnboundedReceiver<InboundEvent>,
    lanes: LaneMap,
    handler: LaneHandler,
    idle: Duration,
    in_flight: Arc<AtomicUsize>,
) {
    log::debug!("{}: lane started", key);
    loop {
        let next = match tokio::time::timeout(idle, rx.recv()).await {
            Ok(Some(event)) => Some(event),
            Ok(None) => None,
            Err(_) => {
                let mut map = lock(&lanes);
                match rx.try_recv() {
                    Ok(event) => Some(event),
                    Err(_) => {
                        map.remove(&key);
                        None
                    }
                }
            }
        };
        match next {
            Some(event) => {
                let _running = InFlight::enter(&in_flight);
                handler(event).await;
            }
            None => break,
        }
    }
    log::debug!("{}: lane retired", key);
}
