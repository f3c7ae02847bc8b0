//! Bounded-retry outbound DP queries.
//! Sleepy end devices often never answer a query; exhausting the retry
//! budget is therefore a normal outcome ("no data"), not a failure.

use crate::dispatch::RawTransport;
use crate::error::{Result, TuyaZigError};
use crate::protocol::{self, DataPoint, SequenceCounter};
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, sleep};
use tokio_util::sync::CancellationToken;

/// Retry behavior for DP queries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before giving up
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt thereafter
    pub base_delay: Duration,
    /// How long each attempt waits for the device to report back
    pub response_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            response_timeout: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff for the given zero-based attempt index, with a
    /// little jitter so a fleet of sessions does not wake in lockstep.
    fn backoff_duration(&self, attempt: u32) -> Duration {
        let base = self.base_delay.saturating_mul(2u32.saturating_pow(attempt));
        let jitter = Duration::from_millis(rand::rng().random_range(0..250));
        base + jitter
    }
}

/// Result of a query cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// The device reported at least one of the queried DPs
    Data(Vec<DataPoint>),
    /// No report arrived within the retry budget; normal for send-only
    /// devices that answer nothing while asleep
    NoData,
}

/// Sends DP queries with bounded retries and exponential backoff.
pub struct RequestRetrier {
    device_id: String,
    policy: RetryPolicy,
    transport: Arc<dyn RawTransport>,
    seq: Arc<SequenceCounter>,
    inbound: broadcast::Sender<DataPoint>,
    cancel: CancellationToken,
}

impl RequestRetrier {
    pub fn new(
        device_id: String,
        policy: RetryPolicy,
        transport: Arc<dyn RawTransport>,
        seq: Arc<SequenceCounter>,
        inbound: broadcast::Sender<DataPoint>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            device_id,
            policy,
            transport,
            seq,
            inbound,
            cancel,
        }
    }

    /// Query the given DP ids, retrying on timeout. Each attempt carries
    /// a fresh sequence number. Returns `NoData` after exhausting the
    /// budget; errs only if the session is torn down mid-flight.
    pub async fn query(&self, dp_ids: &[u8]) -> Result<QueryOutcome> {
        for attempt in 0..self.policy.max_attempts {
            if attempt > 0 {
                let backoff = self.policy.backoff_duration(attempt - 1);
                debug!(
                    "[{}] Query attempt {}/{} after {:?} backoff",
                    self.device_id,
                    attempt + 1,
                    self.policy.max_attempts,
                    backoff
                );
                tokio::select! {
                    _ = sleep(backoff) => {}
                    _ = self.cancel.cancelled() => return Err(TuyaZigError::SessionClosed),
                }
            }

            // Subscribe before sending so a fast reply cannot slip past.
            let rx = self.inbound.subscribe();
            let seq = self.seq.next();
            let frame = protocol::encode_query(seq, dp_ids);

            if let Err(e) = self.transport.send(&frame) {
                warn!(
                    "[{}] Query send failed (seq={}): {}",
                    self.device_id, seq, e
                );
                continue;
            }
            debug!(
                "[{}] Query sent (seq={}, dps={:?}): {}",
                self.device_id,
                seq,
                dp_ids,
                hex::encode(&frame)
            );

            tokio::select! {
                reported = self.collect_reports(rx, dp_ids) => {
                    if !reported.is_empty() {
                        return Ok(QueryOutcome::Data(reported));
                    }
                }
                _ = self.cancel.cancelled() => return Err(TuyaZigError::SessionClosed),
            }
        }

        debug!(
            "[{}] No response after {} attempts, reporting no data",
            self.device_id, self.policy.max_attempts
        );
        Ok(QueryOutcome::NoData)
    }

    /// Gather reports for the queried ids until all have been seen or the
    /// per-attempt timeout elapses. A partial set still counts as data.
    async fn collect_reports(
        &self,
        mut rx: broadcast::Receiver<DataPoint>,
        dp_ids: &[u8],
    ) -> Vec<DataPoint> {
        let mut reported: Vec<DataPoint> = Vec::new();
        let deadline = tokio::time::Instant::now() + self.policy.response_timeout;

        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                recv = rx.recv() => match recv {
                    Ok(dp) => {
                        if dp_ids.contains(&dp.id) && !reported.iter().any(|r| r.id == dp.id) {
                            reported.push(dp);
                            if reported.len() == dp_ids.len() {
                                break;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("[{}] Inbound stream lagged by {} frames", self.device_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        reported
    }
}
