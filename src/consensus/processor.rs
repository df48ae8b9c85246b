use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::message::MessageCodec;
use super::round_state::RoundStepSummary;
use super::state::{ConsensusError, ConsensusEvent, ConsensusState, Output};
use super::timeout::TimeoutScheduler;
use crate::network::PeerChannel;
use crate::types::Timestamp;

/// Events queued for the processing loop before producers wait.
pub const MAILBOX_CAPACITY: usize = 1000;

/*
    Drives one ConsensusState: a single task takes events from the mailbox
    one at a time, applies them, then carries out the outputs (encode and
    send to peers, arm the timer). Peer receivers and the timer only ever
    enqueue, so the round state has exactly one writer.

    A fatal error stops the loop after a final WAL flush. Shutdown lets the
    in-flight event finish, then flushes.
*/
pub struct ConsensusProcessor {
    cs: ConsensusState,
    mailbox: mpsc::Receiver<ConsensusEvent>,
    timeouts: TimeoutScheduler,
    peers: Arc<dyn PeerChannel>,
    codec: MessageCodec,
    flush_interval: Duration,
    status: watch::Sender<RoundStepSummary>,
}

impl ConsensusProcessor {
    pub fn new(
        cs: ConsensusState,
        mailbox_tx: mpsc::Sender<ConsensusEvent>,
        mailbox: mpsc::Receiver<ConsensusEvent>,
        peers: Arc<dyn PeerChannel>,
        flush_interval: Duration,
    ) -> (Self, watch::Receiver<RoundStepSummary>) {
        let (status, status_rx) = watch::channel(cs.round_state().summary());
        let processor = ConsensusProcessor {
            cs,
            mailbox,
            timeouts: TimeoutScheduler::new(mailbox_tx),
            peers,
            codec: MessageCodec::default(),
            flush_interval,
            status,
        };
        (processor, status_rx)
    }

    /// Runs until shutdown or a fatal error. Hands the state back on a clean
    /// stop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<ConsensusState, ConsensusError> {
        info!(height = self.cs.round_state().height, "starting consensus");
        if let Err(e) = self.cs.start(Timestamp::now()) {
            return Err(self.fail(e));
        }
        self.dispatch();

        let mut flush = tokio::time::interval(self.flush_interval);
        flush.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!(step = %self.cs.round_state().summary(), "stopping consensus");
                    break;
                }
                event = self.mailbox.recv() => {
                    let Some(event) = event else {
                        debug!("mailbox closed");
                        break;
                    };
                    if let Err(e) = self.cs.handle_event(event, Timestamp::now()) {
                        return Err(self.fail(e));
                    }
                    self.dispatch();
                }
                _ = flush.tick() => {
                    if let Err(e) = self.cs.flush_wal() {
                        return Err(self.fail(e));
                    }
                }
            }
        }

        self.timeouts.cancel();
        self.cs.flush_wal()?;
        Ok(self.cs)
    }

    fn fail(&mut self, err: ConsensusError) -> ConsensusError {
        error!(step = %self.cs.round_state().summary(), err = %err, "consensus halted");
        self.timeouts.cancel();
        if let Err(e) = self.cs.flush_wal() {
            error!(err = %e, "final wal flush failed");
        }
        err
    }

    fn dispatch(&mut self) {
        for output in self.cs.take_outputs() {
            match output {
                Output::Broadcast(msg) => match self.codec.encode(&msg) {
                    Ok(bytes) => self.peers.broadcast(msg.channel(), bytes),
                    Err(e) => warn!(err = %e, "cannot encode outbound message"),
                },
                Output::SendTo(peer, msg) => match self.codec.encode(&msg) {
                    Ok(bytes) => {
                        if !self.peers.send(&peer, msg.channel(), bytes) {
                            debug!(%peer, "peer gone, reply dropped");
                        }
                    }
                    Err(e) => warn!(err = %e, "cannot encode outbound message"),
                },
                Output::ScheduleTimeout(ti) => self.timeouts.schedule(ti),
            }
        }
        self.status.send_replace(self.cs.round_state().summary());
    }
}
