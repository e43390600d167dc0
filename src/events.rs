use std::fmt;
use std::panic::Location;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum RecvError {
    #[error("Channel closed")]
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TryRecvError {
    #[error("Channel empty")]
    Empty,
    #[error("Channel closed")]
    Closed,
}

/// The channel on which the sampling components announce what they are doing.
#[derive(Debug)]
pub struct EventChannel {
    tx: broadcast::Sender<DasEventInfo>,
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<DasEventInfo>,
}

#[derive(Debug)]
pub struct EventSubscriber {
    rx: broadcast::Receiver<DasEventInfo>,
}

impl EventChannel {
    pub fn new() -> EventChannel {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        EventChannel { tx }
    }

    pub(crate) fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
        }
    }

    pub fn subscribe(&self) -> EventSubscriber {
        EventSubscriber {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for EventChannel {
    fn default() -> Self {
        EventChannel::new()
    }
}

impl EventPublisher {
    #[track_caller]
    pub(crate) fn send(&self, event: DasEvent) {
        let location = Location::caller();

        let info = DasEventInfo {
            event,
            time: SystemTime::now(),
            file_path: location.file(),
            file_line: location.line(),
        };

        // Events are purely informational, nobody listening is fine.
        let _ = self.tx.send(info);
    }
}

impl EventSubscriber {
    /// Returns the next event, waiting for one if none is buffered.
    pub async fn recv(&mut self) -> Result<DasEventInfo, RecvError> {
        loop {
            let missed = match self.rx.recv().await {
                Ok(info) => return Ok(info),
                Err(broadcast::error::RecvError::Lagged(missed)) => missed,
                Err(broadcast::error::RecvError::Closed) => return Err(RecvError::Closed),
            };

            self.report_lag(missed);
        }
    }

    /// Returns the next buffered event without waiting.
    pub fn try_recv(&mut self) -> Result<DasEventInfo, TryRecvError> {
        loop {
            let missed = match self.rx.try_recv() {
                Ok(info) => return Ok(info),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => missed,
                Err(broadcast::error::TryRecvError::Empty) => return Err(TryRecvError::Empty),
                Err(broadcast::error::TryRecvError::Closed) => return Err(TryRecvError::Closed),
            };

            self.report_lag(missed);
        }
    }

    /// Oldest events are overwritten when a subscriber falls behind the
    /// channel capacity; the receiver resumes from the oldest retained one.
    fn report_lag(&self, missed: u64) {
        debug!("event subscriber lagging, {missed} events were skipped");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DasEventInfo {
    pub event: DasEvent,
    pub time: SystemTime,
    pub file_path: &'static str,
    pub file_line: u32,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum DasEvent {
    /// A range of heights was handed to a worker.
    SamplingStarted { from: u64, to: u64 },

    /// Sampling of a single height finished.
    SamplingFinished {
        height: u64,
        accepted: bool,
        took: Duration,
    },

    /// Every known height has been dispatched and all workers went idle.
    CaughtUp { network_head: u64 },
}

impl fmt::Display for DasEvent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            DasEvent::SamplingStarted { from, to } => {
                write!(f, "Sampling of blocks {from}-{to} started.")
            }
            DasEvent::SamplingFinished {
                height,
                accepted,
                took,
            } => {
                let acc = if *accepted { "accepted" } else { "rejected" };
                write!(f, "Sampling of block {height} finished and {acc}. Took {took:?}.")
            }
            DasEvent::CaughtUp { network_head } => {
                write!(f, "Sampling caught up with the network head {network_head}.")
            }
        }
    }
}
