use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::round_state::Step;
use super::state::ConsensusEvent;
use crate::types::{Height, Round};

/// A timeout for one (height, round, step).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeoutInfo {
    pub duration_ms: u64,
    pub height: Height,
    pub round: Round,
    pub step: Step,
}

impl TimeoutInfo {
    pub fn new(duration: Duration, height: Height, round: Round, step: Step) -> Self {
        TimeoutInfo {
            duration_ms: duration.as_millis() as u64,
            height,
            round,
            step,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }

    /// True if `self` is for an earlier (height, round, step) than `other`.
    pub fn is_before(&self, other: &TimeoutInfo) -> bool {
        (self.height, self.round, self.step) < (other.height, other.round, other.step)
    }
}

impl fmt::Display for TimeoutInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}/{}", self.duration(), self.height, self.round, self.step)
    }
}

/*
    Single pending timer. Scheduling a newer (height, round, step) aborts the
    current timer; scheduling an older one is ignored. A fired timeout is
    delivered to the consensus mailbox like any other event.
*/
pub struct TimeoutScheduler {
    mailbox: mpsc::Sender<ConsensusEvent>,
    current: Option<(TimeoutInfo, JoinHandle<()>)>,
}

impl TimeoutScheduler {
    pub fn new(mailbox: mpsc::Sender<ConsensusEvent>) -> Self {
        TimeoutScheduler {
            mailbox,
            current: None,
        }
    }

    pub fn schedule(&mut self, ti: TimeoutInfo) {
        if let Some((pending, handle)) = &self.current {
            if !handle.is_finished() && ti.is_before(pending) {
                trace!(timeout = %ti, pending = %pending, "ignoring older timeout");
                return;
            }
        }
        self.cancel();

        let mailbox = self.mailbox.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(ti.duration()).await;
            if mailbox.send(ConsensusEvent::Timeout(ti)).await.is_err() {
                debug!(timeout = %ti, "mailbox closed before timeout fired");
            }
        });
        debug!(timeout = %ti, "scheduled timeout");
        self.current = Some((ti, handle));
    }

    pub fn cancel(&mut self) {
        if let Some((_, handle)) = self.current.take() {
            handle.abort();
        }
    }

    pub fn pending(&self) -> Option<TimeoutInfo> {
        self.current.as_ref().map(|(ti, _)| *ti)
    }
}

impl Drop for TimeoutScheduler {
    fn drop(&mut self) {
        self.cancel();
    }
}
