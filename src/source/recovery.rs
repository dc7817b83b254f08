//! Lost packet recovery source
//!
//! Talks to a retransmission server: losses detected on the live stream
//! are converted into RTCP NACK requests, and the retransmitted packets
//! are accepted only while their sequence number is outstanding. Each
//! accepted packet is stored with the timestamp of its request, not its
//! arrival, so the merge logic can age-compare it against live data.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffer::SegmentRingBuffer;
use crate::packet::rtcp::{build_nack_entries, RtcpCompoundBuilder};
use crate::packet::RtpPacket;
use crate::transport::{RtpTransport, RtpTransportConfig, UdpRtpTransport};
use crate::{Error, Result, RtpSequenceNumber, RtpSsrc, DEFAULT_MAX_PACKET_SIZE};
use super::{ChannelSource, DataCondition, SourceEvent, CLOSE_GRACE_MS};

/// Ring buffer capacity of the recovery source, in segments
pub const RECOVERY_BUFFER_CAPACITY: usize = 512;

/// Retransmissions from a lost packet recovery server
pub struct RecoverySource {
    /// Retransmission server address
    server: SocketAddr,

    /// Payload buffer drained by the consumer
    buffer: Arc<Mutex<SegmentRingBuffer>>,

    /// Reader wake signal
    condition: Arc<DataCondition>,

    /// Event channel to the session
    events: mpsc::Sender<SourceEvent>,

    /// RTCP identity used for NACK compounds
    builder: RtcpCompoundBuilder,

    /// Outstanding requests, sequence number to request timestamp
    pending: Arc<Mutex<HashMap<RtpSequenceNumber, u64>>>,

    /// Media sender SSRC named in NACK packets, learned from the live stream
    media_ssrc: Arc<AtomicU32>,

    /// Whether the source is open
    active: Arc<AtomicBool>,

    /// Cooperative cancellation for the receive task
    cancel: Arc<Notify>,

    /// Transport, present while open
    transport: Mutex<Option<Arc<dyn RtpTransport>>>,

    /// Receive task handle
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RecoverySource {
    /// Create a recovery source talking to `server`
    pub fn new(server: SocketAddr, events: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            server,
            buffer: Arc::new(Mutex::new(SegmentRingBuffer::new(
                RECOVERY_BUFFER_CAPACITY,
                DEFAULT_MAX_PACKET_SIZE,
            ))),
            condition: Arc::new(DataCondition::new()),
            events,
            builder: RtcpCompoundBuilder::with_generated_identity(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            media_ssrc: Arc::new(AtomicU32::new(0)),
            active: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            transport: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Record the live stream's SSRC for use as the NACK media sender
    pub fn set_media_ssrc(&self, ssrc: RtpSsrc) {
        self.media_ssrc.store(ssrc, Ordering::SeqCst);
    }

    /// Number of sequences currently awaiting retransmission
    pub fn pending_requests(&self) -> usize {
        self.pending.lock().len()
    }

    /// Bundle `num_lost` sequences following `last_received` into NACK
    /// entries, stamp them as outstanding, and send the request.
    ///
    /// `detected_at` is the clock reading of the packet that revealed
    /// the gap, so a recovered packet ages as if it had arrived then.
    pub async fn request_retransmission(
        &self,
        last_received: RtpSequenceNumber,
        num_lost: u32,
        detected_at: u64,
    ) -> Result<()> {
        let entries = build_nack_entries(last_received, num_lost);
        if entries.is_empty() {
            return Ok(());
        }

        let transport = self
            .transport
            .lock()
            .clone()
            .ok_or_else(|| Error::SessionError("recovery source is not open".to_string()))?;

        {
            let mut pending = self.pending.lock();
            for entry in &entries {
                for sequence in entry.sequences() {
                    pending.insert(sequence, detected_at);
                }
            }
        }

        let request = self
            .builder
            .build_nack_packet(self.media_ssrc.load(Ordering::SeqCst), &entries);
        debug!(
            "Requesting retransmission of {} sequence(s) after {}",
            num_lost, last_received
        );
        transport.send_rtcp(&request).await
    }

    /// Discard all outstanding requests and buffered retransmissions
    pub fn reset_recovery(&self) {
        self.pending.lock().clear();
        self.buffer.lock().reset();
    }
}

#[async_trait]
impl ChannelSource for RecoverySource {
    async fn open(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let transport = match UdpRtpTransport::new(RtpTransportConfig {
            remote_addr: Some(self.server),
            ..RtpTransportConfig::default()
        })
        .await
        {
            Ok(transport) => Arc::new(transport) as Arc<dyn RtpTransport>,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.transport.lock() = Some(transport.clone());

        let buffer = self.buffer.clone();
        let condition = self.condition.clone();
        let events = self.events.clone();
        let pending = self.pending.clone();
        let active = self.active.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];

            // Retransmissions arrive only after a grant, so there is no
            // receive timeout here
            loop {
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let received = tokio::select! {
                    _ = cancel.notified() => break,
                    received = transport.recv(&mut buf) => received,
                };

                let size = match received {
                    Ok(size) => size,
                    Err(e) => {
                        warn!("Recovery receive failed: {}", e);
                        let _ = events.send(SourceEvent::Error(e)).await;
                        break;
                    }
                };

                let packet = match RtpPacket::decode(&buf[..size]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Dropping undecodable retransmission: {}", e);
                        continue;
                    }
                };

                let requested_at = match pending.lock().remove(&packet.sequence_number) {
                    Some(requested_at) => requested_at,
                    None => {
                        trace!(
                            "Dropping unsolicited retransmission of sequence {}",
                            packet.sequence_number
                        );
                        continue;
                    }
                };

                let deposited = buffer.lock().put_at(
                    packet.sequence_number,
                    requested_at,
                    &packet.payload,
                );
                match deposited {
                    Ok(_) => condition.open(),
                    Err(e) => {
                        trace!(
                            "Recovery buffer full, dropping sequence {}: {}",
                            packet.sequence_number, e
                        );
                    }
                }
            }

            let _ = transport.close().await;
            condition.open();
        });
        *self.task.lock() = Some(task);

        info!("Opened recovery source against {}", self.server);
        Ok(())
    }

    fn read(&self, out: &mut [u8]) -> usize {
        let size = self.buffer.lock().get(out);
        self.condition.close();
        size
    }

    async fn close(&self) {
        if !self.active.swap(false, Ordering::SeqCst) {
            return;
        }
        self.cancel.notify_one();

        let task = self.task.lock().take();
        if let Some(mut task) = task {
            if tokio::time::timeout(Duration::from_millis(CLOSE_GRACE_MS), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }

        let transport = self.transport.lock().take();
        if let Some(transport) = transport {
            let _ = transport.close().await;
        }
        self.reset_recovery();
        self.condition.open();
        info!("Closed recovery source against {}", self.server);
    }

    fn is_opened(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn has_data_available(&self) -> bool {
        self.buffer.lock().has_data_available()
    }

    fn current_sequence(&self) -> Option<RtpSequenceNumber> {
        self.buffer.lock().head_sequence()
    }

    fn current_timestamp(&self) -> Option<u64> {
        self.buffer.lock().head_timestamp()
    }

    fn condition(&self) -> &DataCondition {
        &self.condition
    }
}
