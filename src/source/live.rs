//! Live channel source
//!
//! Receives the multicast (or unicast) live stream, reports per-packet
//! metadata to the session so it can detect loss and drive the channel
//! switch, and buffers payload for the consumer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::buffer::{clock_millis, SegmentRingBuffer};
use crate::packet::RtpPacket;
use crate::transport::{RtpTransport, RtpTransportConfig, UdpRtpTransport};
use crate::{Result, RtpSequenceNumber, DEFAULT_MAX_PACKET_SIZE};
use super::{ChannelSource, DataCondition, SourceEvent, CLOSE_GRACE_MS};

/// Ring buffer capacity of the live source, in segments
pub const LIVE_BUFFER_CAPACITY: usize = 2048;

/// Receive timeout of the live socket in milliseconds
pub const LIVE_RECV_TIMEOUT_MS: u64 = 8000;

/// The live multicast/unicast stream of a channel
pub struct LiveSource {
    /// Address of the live stream
    address: SocketAddr,

    /// Payload buffer drained by the consumer
    buffer: Arc<Mutex<SegmentRingBuffer>>,

    /// Reader wake signal
    condition: Arc<DataCondition>,

    /// Event channel to the session
    events: mpsc::Sender<SourceEvent>,

    /// Whether the source is open
    active: Arc<AtomicBool>,

    /// Cooperative cancellation for the receive task
    cancel: Arc<Notify>,

    /// Transport, present while open
    transport: Mutex<Option<Arc<dyn RtpTransport>>>,

    /// Receive task handle
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LiveSource {
    /// Create a live source for `address`, reporting to `events`
    pub fn new(address: SocketAddr, events: mpsc::Sender<SourceEvent>) -> Self {
        Self {
            address,
            buffer: Arc::new(Mutex::new(SegmentRingBuffer::new(
                LIVE_BUFFER_CAPACITY,
                DEFAULT_MAX_PACKET_SIZE,
            ))),
            condition: Arc::new(DataCondition::new()),
            events,
            active: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            transport: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Address the transport is actually bound to, while open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.transport.lock().as_ref().and_then(|t| t.local_addr().ok())
    }
}

#[async_trait]
impl ChannelSource for LiveSource {
    async fn open(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let transport = match UdpRtpTransport::new(RtpTransportConfig {
            local_addr: self.address,
            remote_addr: None,
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
        let active = self.active.clone();
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            let mut reported_sync = false;

            loop {
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let outcome = tokio::select! {
                    _ = cancel.notified() => break,
                    outcome = tokio::time::timeout(
                        Duration::from_millis(LIVE_RECV_TIMEOUT_MS),
                        transport.recv(&mut buf),
                    ) => outcome,
                };

                let size = match outcome {
                    // Receive timeout, not fatal
                    Err(_) => continue,
                    Ok(Ok(size)) => size,
                    Ok(Err(e)) => {
                        warn!("Live receive failed: {}", e);
                        let _ = events.send(SourceEvent::Error(e)).await;
                        break;
                    }
                };

                let packet = match RtpPacket::decode(&buf[..size]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Dropping undecodable live packet: {}", e);
                        continue;
                    }
                };

                if !reported_sync {
                    reported_sync = true;
                    let _ = events.send(SourceEvent::SyncSource { ssrc: packet.ssrc }).await;
                }

                // The event and the deposit carry the same stamp so loss
                // detection can age-match against the buffered packet
                let now = clock_millis();
                let _ = events
                    .send(SourceEvent::StreamInfo {
                        stream_type: packet.stream_type(),
                        sequence: packet.sequence_number,
                        timestamp: now,
                    })
                    .await;

                let deposited = buffer
                    .lock()
                    .put_at(packet.sequence_number, now, &packet.payload);
                match deposited {
                    Ok(_) => condition.open(),
                    Err(e) => {
                        trace!("Live buffer full, dropping sequence {}: {}", packet.sequence_number, e);
                    }
                }
            }

            let _ = transport.close().await;
            condition.open();
        });
        *self.task.lock() = Some(task);

        info!("Opened live source on {}", self.address);
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
        self.condition.open();
        info!("Closed live source on {}", self.address);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::MpegPayloadType;
    use bytes::Bytes;
    use tokio::net::UdpSocket;

    fn ts_packet(sequence: u16, payload: &[u8]) -> Vec<u8> {
        RtpPacket::new(
            MpegPayloadType::Mpeg2Ts,
            sequence,
            1000,
            0x11223344,
            Bytes::new(),
            Bytes::copy_from_slice(payload),
        )
        .encode()
        .unwrap()
        .to_vec()
    }

    #[tokio::test]
    async fn test_live_source_receives_and_buffers() {
        let (tx, mut rx) = mpsc::channel(100);
        let source = LiveSource::new("127.0.0.1:0".parse().unwrap(), tx);
        source.open().await.unwrap();
        let dest = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(&ts_packet(10, b"one"), dest).await.unwrap();
        sender.send_to(&ts_packet(11, b"two"), dest).await.unwrap();

        // First event is the sync source, then per-packet stream info
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::SyncSource { ssrc } => assert_eq!(ssrc, 0x11223344),
            other => panic!("expected SyncSource, got {:?}", other),
        }
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::StreamInfo { sequence, .. } => assert_eq!(sequence, 10),
            other => panic!("expected StreamInfo, got {:?}", other),
        }

        source.condition().wait().await;
        let mut out = [0u8; 32];
        let n = source.read(&mut out);
        assert_eq!(&out[..n], b"one");

        // The second packet may still be in flight
        tokio::time::sleep(Duration::from_millis(50)).await;
        let n = source.read(&mut out);
        assert_eq!(&out[..n], b"two");
        assert_eq!(source.current_sequence(), None);

        source.close().await;
        assert!(!source.is_opened());
    }

    #[tokio::test]
    async fn test_live_source_drops_garbage() {
        let (tx, mut rx) = mpsc::channel(100);
        let source = LiveSource::new("127.0.0.1:0".parse().unwrap(), tx);
        source.open().await.unwrap();
        let dest = source.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"not rtp at all", dest).await.unwrap();
        sender.send_to(&ts_packet(5, b"good"), dest).await.unwrap();

        // Only the valid packet surfaces
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::SyncSource { .. } => {}
            other => panic!("expected SyncSource, got {:?}", other),
        }

        source.condition().wait().await;
        let mut out = [0u8; 32];
        let n = source.read(&mut out);
        assert_eq!(&out[..n], b"good");

        source.close().await;
    }

    #[tokio::test]
    async fn test_close_without_open_is_safe() {
        let (tx, _rx) = mpsc::channel(100);
        let source = LiveSource::new("127.0.0.1:0".parse().unwrap(), tx);
        source.close().await;
        assert!(!source.is_opened());
    }
}
