use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, trace, warn};

use crate::error::TransportError;

/// Mesh node address. Displayed in the usual `!hex` notation.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn from_raw(value: u32) -> NodeId {
        NodeId(value)
    }

    pub const fn to_raw(self) -> u32 {
        self.0
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "!{:08x}", self.0)
    }
}

/// Immediate result of handing one datagram to the radio driver.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SendOutcome {
    Sent,
    /// The driver's egress queue is full; try again shortly.
    Busy,
    /// The driver reported a hard send failure.
    Error,
}

/// The datagram contract the transport consumes from the radio driver.
///
/// The driver may drop, reorder, duplicate, or delay datagrams; it must not
/// fragment them (frames fit one datagram by construction). One process-wide
/// instance, passed in explicitly.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RadioSender: Send + Sync + 'static {
    async fn send_datagram(&self, dest: NodeId, bytes: &[u8]) -> SendOutcome;

    fn local_node(&self) -> NodeId;
}

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(5);
const ATTEMPTS_PER_SEND: u32 = 3;

/// Wraps the driver with retry-with-backoff and a latched down state.
///
/// `Busy`/`Error` outcomes are retried with doubling delays. Once
/// `max_send_failures` consecutive attempts have failed the handle latches
/// `RadioDown`; subsequent sends make a single probe attempt, and the first
/// success clears the latch.
pub struct RadioHandle {
    sender: Arc<dyn RadioSender>,
    max_send_failures: u32,
    consecutive_failures: AtomicU32,
    down: AtomicBool,
}

impl RadioHandle {
    pub fn new(sender: Arc<dyn RadioSender>, max_send_failures: u32) -> RadioHandle {
        RadioHandle {
            sender,
            max_send_failures,
            consecutive_failures: AtomicU32::new(0),
            down: AtomicBool::new(false),
        }
    }

    pub fn local_node(&self) -> NodeId {
        self.sender.local_node()
    }

    pub fn is_down(&self) -> bool {
        self.down.load(Ordering::Acquire)
    }

    pub async fn send(&self, dest: NodeId, bytes: &[u8]) -> Result<(), TransportError> {
        let attempts = if self.is_down() { 1 } else { ATTEMPTS_PER_SEND };
        let mut delay = INITIAL_RETRY_DELAY;

        for attempt in 0..attempts {
            match self.sender.send_datagram(dest, bytes).await {
                SendOutcome::Sent => {
                    self.consecutive_failures.store(0, Ordering::Release);
                    if self.down.swap(false, Ordering::AcqRel) {
                        warn!("radio recovered, clearing down latch");
                    }
                    trace!("sent {} bytes to {}", bytes.len(), dest);
                    return Ok(());
                }
                outcome @ (SendOutcome::Busy | SendOutcome::Error) => {
                    let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                    debug!(
                        "radio send to {} failed ({:?}), attempt {}, {} consecutive failures",
                        dest,
                        outcome,
                        attempt + 1,
                        failures
                    );
                    if failures >= self.max_send_failures {
                        if !self.down.swap(true, Ordering::AcqRel) {
                            error!("{} consecutive radio failures - marking radio down", failures);
                        }
                        return Err(TransportError::RadioDown);
                    }
                }
            }

            if attempt + 1 < attempts {
                sleep(delay).await;
                delay = (delay * 2).min(MAX_RETRY_DELAY);
            }
        }

        if self.is_down() {
            Err(TransportError::RadioDown)
        } else {
            Err(TransportError::RadioBusy)
        }
    }
}
