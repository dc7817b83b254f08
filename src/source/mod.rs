//! Channel sources
//!
//! A channel session runs up to three sources at once: the live
//! multicast stream, the unicast fast-channel-change burst, and the
//! unicast loss-recovery stream. Each source owns a receive task that
//! decodes inbound RTP and deposits payload into its own segment ring
//! buffer, and reports stream metadata to the session over an event
//! channel.

mod live;
mod fcc;
mod recovery;

pub use live::LiveSource;
pub use fcc::FastChangeSource;
pub use recovery::{RecoverySource, RECOVERY_BUFFER_CAPACITY};

use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::Error;
use crate::packet::StreamType;
use crate::{RtpSequenceNumber, RtpSsrc};

/// How long `close` waits for a receive task to wind down before
/// aborting it
pub(crate) const CLOSE_GRACE_MS: u64 = 500;

/// Wake signal between a receive task and a blocked reader
///
/// The reader closes the gate and waits; the receive task opens it
/// after every deposit and when it exits, so a reader never sleeps
/// through data arrival or source shutdown.
pub struct DataCondition {
    open: AtomicBool,
    notify: Notify,
}

impl DataCondition {
    pub fn new() -> Self {
        Self {
            open: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Open the gate and wake every waiter
    pub fn open(&self) {
        self.open.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Close the gate so the next `wait` blocks
    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }

    /// Wait until the gate is open
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.open.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }

    /// Whether the gate is currently open
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

impl Default for DataCondition {
    fn default() -> Self {
        Self::new()
    }
}

/// Events a source reports to the session
#[derive(Debug, Clone)]
pub enum SourceEvent {
    /// Metadata of a decoded packet, stamped with its arrival reading
    /// of the shared clock
    StreamInfo {
        stream_type: StreamType,
        sequence: RtpSequenceNumber,
        timestamp: u64,
    },

    /// Synchronization source of the stream, reported once after the
    /// first packet
    SyncSource { ssrc: RtpSsrc },

    /// The FCC server signaled that the live join may start
    SwitchReady,

    /// The source failed and stopped
    Error(Error),
}

/// Common contract of the three channel sources
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Start the transport and the receive task
    async fn open(&self) -> crate::Result<()>;

    /// Drain buffered payload into `out`, one segment at most
    fn read(&self, out: &mut [u8]) -> usize;

    /// Stop the receive task and release the transport; idempotent and
    /// safe without a prior successful open
    async fn close(&self);

    /// Whether the source has been opened and not yet closed
    fn is_opened(&self) -> bool;

    /// Whether the ring buffer holds undrained payload
    fn has_data_available(&self) -> bool;

    /// Sequence number at the head of the ring buffer
    fn current_sequence(&self) -> Option<RtpSequenceNumber>;

    /// Deposit timestamp at the head of the ring buffer
    fn current_timestamp(&self) -> Option<u64>;

    /// Wake condition readers block on while this source has no data
    fn condition(&self) -> &DataCondition;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_condition_open_releases_waiter() {
        let condition = Arc::new(DataCondition::new());
        let waiter = condition.clone();

        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        condition.open();
        tokio::time::timeout(Duration::from_millis(500), handle)
            .await
            .expect("waiter not released")
            .unwrap();
    }

    #[tokio::test]
    async fn test_condition_wait_returns_when_already_open() {
        let condition = DataCondition::new();
        condition.open();

        tokio::time::timeout(Duration::from_millis(100), condition.wait())
            .await
            .expect("open condition should not block");
    }

    #[tokio::test]
    async fn test_condition_close_blocks_again() {
        let condition = Arc::new(DataCondition::new());
        condition.open();
        condition.close();

        let waiter = condition.clone();
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        condition.open();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_condition_no_missed_wakeup() {
        // Open the gate right when the waiter is between its flag check
        // and its sleep; the registered notification must still land
        let condition = Arc::new(DataCondition::new());
        for _ in 0..50 {
            condition.close();
            let waiter = condition.clone();
            let handle = tokio::spawn(async move {
                waiter.wait().await;
            });
            condition.open();
            tokio::time::timeout(Duration::from_millis(500), handle)
                .await
                .expect("missed wakeup")
                .unwrap();
        }
    }
}
