use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio_util::sync::CancellationToken;
use tokio_util::time::delay_queue::Key;
use tokio_util::time::DelayQueue;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TimerCommand {
    /// Start the timer, or restart it from the full timeout if already running.
    Arm { address: String, epoch: u64 },
    Disarm { address: String },
}

/// Sending side of the failure detector, held by the registry.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    sender: UnboundedSender<TimerCommand>,
}

/// Receiving side, consumed by [`FailureDetector::new`].
#[derive(Debug)]
pub struct TimerCommands {
    receiver: UnboundedReceiver<TimerCommand>,
}

impl TimerHandle {
    pub fn channel() -> (TimerHandle, TimerCommands) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (TimerHandle { sender }, TimerCommands { receiver })
    }

    pub(crate) fn arm(&self, address: &str, epoch: u64) {
        self.send(TimerCommand::Arm { address: address.to_owned(), epoch });
    }

    pub(crate) fn disarm(&self, address: &str) {
        self.send(TimerCommand::Disarm { address: address.to_owned() });
    }

    fn send(&self, command: TimerCommand) {
        // the scheduler is gone once the node shut down, timers are moot then
        if self.sender.send(command).is_err() {
            log::trace!("Failure detector stopped, dropping timer command");
        }
    }
}

#[cfg(test)]
impl TimerCommands {
    pub(crate) fn try_next(&mut self) -> Option<TimerCommand> {
        self.receiver.try_recv().ok()
    }
}

struct Armed {
    key: Key,
    epoch: u64,
}

/// Expiry timers for every alive member, kept in one timer wheel.
///
/// Each timer fires `cleanup_timeout` after it was last armed. Firing calls
/// back with the address and the epoch the timer was armed with, so the
/// receiver of the callback can tell a stale expiry from a current one.
pub struct FailureDetector {
    cleanup_timeout: Duration,
    commands: UnboundedReceiver<TimerCommand>,
    queue: DelayQueue<String>,
    armed: HashMap<String, Armed>,
}

impl FailureDetector {
    pub fn new(cleanup_timeout: Duration, commands: TimerCommands) -> FailureDetector {
        FailureDetector {
            cleanup_timeout,
            commands: commands.receiver,
            queue: DelayQueue::new(),
            armed: HashMap::new(),
        }
    }

    /// Services timers until cancelled. Every outstanding timer is dropped on return.
    pub async fn run<F>(mut self, cancellation_token: CancellationToken, mut on_expire: F)
        where F: FnMut(&str, u64) + Send,
    {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    break;
                }
                command = self.commands.recv() => {
                    match command {
                        Some(command) => self.apply(command),
                        None => {
                            log::debug!("Timer handles dropped, failure detector will be stopped");
                            break;
                        }
                    }
                }
                Some(expired) = poll_fn(|cx| self.queue.poll_expired(cx)), if !self.queue.is_empty() => {
                    let address = expired.into_inner();
                    if let Some(armed) = self.armed.remove(&address) {
                        log::debug!("No heartbeat from {} within {:?}", address, self.cleanup_timeout);
                        on_expire(&address, armed.epoch);
                    }
                }
            }
        }
        log::debug!("Failure detector stopped with {} timers outstanding", self.armed.len());
        self.queue.clear();
        self.armed.clear();
    }

    fn apply(&mut self, command: TimerCommand) {
        match command {
            TimerCommand::Arm { address, epoch } => match self.armed.get_mut(&address) {
                Some(armed) => {
                    self.queue.reset(&armed.key, self.cleanup_timeout);
                    armed.epoch = epoch;
                }
                None => {
                    let key = self.queue.insert(address.clone(), self.cleanup_timeout);
                    self.armed.insert(address, Armed { key, epoch });
                }
            },
            TimerCommand::Disarm { address } => {
                if let Some(armed) = self.armed.remove(&address) {
                    self.queue.remove(&armed.key);
                }
            }
        }
    }
}
