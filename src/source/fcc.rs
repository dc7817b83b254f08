//! Fast channel change source
//!
//! Requests a unicast catch-up burst from the fast channel change server
//! and buffers it until the consumer joins the live stream. The request
//! and teardown travel as RTCP compound packets on the same socket the
//! burst arrives on.

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
use crate::packet::rtcp::{fcc_request_data, RtcpCompoundBuilder, FCC_REQUEST_NAME};
use crate::packet::{RtpPacket, StreamType};
use crate::transport::{RtpTransport, RtpTransportConfig, UdpRtpTransport};
use crate::{Result, RtpSequenceNumber, DEFAULT_MAX_PACKET_SIZE};
use super::{ChannelSource, DataCondition, SourceEvent, CLOSE_GRACE_MS};

/// Ring buffer capacity of the burst source, in segments
pub const FCC_BUFFER_CAPACITY: usize = 1024;

/// Receive timeout of the burst socket in milliseconds
pub const FCC_RECV_TIMEOUT_MS: u64 = 200;

/// Unicast catch-up burst from the fast channel change server
pub struct FastChangeSource {
    /// Fast channel change server address
    server: SocketAddr,

    /// Live stream address advertised in the burst request
    live_address: SocketAddr,

    /// Payload buffer drained by the consumer
    buffer: Arc<Mutex<SegmentRingBuffer>>,

    /// Reader wake signal
    condition: Arc<DataCondition>,

    /// Event channel to the session
    events: mpsc::Sender<SourceEvent>,

    /// RTCP identity shared by the request and the goodbye
    builder: RtcpCompoundBuilder,

    /// Whether the source is open
    active: Arc<AtomicBool>,

    /// Cooperative cancellation for the receive task
    cancel: Arc<Notify>,

    /// Audio packets are no longer deposited once the live stream has them
    audio_disabled: Arc<AtomicBool>,

    /// Video packets are no longer deposited once the live stream has them
    video_disabled: Arc<AtomicBool>,

    /// Transport, present while open
    transport: Mutex<Option<Arc<dyn RtpTransport>>>,

    /// Receive task handle
    task: Mutex<Option<JoinHandle<()>>>,
}

impl FastChangeSource {
    /// Create a burst source talking to `server` about the live stream
    /// at `live_address`
    pub fn new(
        server: SocketAddr,
        live_address: SocketAddr,
        events: mpsc::Sender<SourceEvent>,
    ) -> Self {
        Self {
            server,
            live_address,
            buffer: Arc::new(Mutex::new(SegmentRingBuffer::new(
                FCC_BUFFER_CAPACITY,
                DEFAULT_MAX_PACKET_SIZE,
            ))),
            condition: Arc::new(DataCondition::new()),
            events,
            builder: RtcpCompoundBuilder::with_generated_identity(),
            active: Arc::new(AtomicBool::new(false)),
            cancel: Arc::new(Notify::new()),
            audio_disabled: Arc::new(AtomicBool::new(false)),
            video_disabled: Arc::new(AtomicBool::new(false)),
            transport: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Stop depositing audio packets from the burst
    pub fn disable_audio(&self) {
        self.audio_disabled.store(true, Ordering::SeqCst);
    }

    /// Stop depositing video packets from the burst
    pub fn disable_video(&self) {
        self.video_disabled.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ChannelSource for FastChangeSource {
    async fn open(&self) -> Result<()> {
        if self.active.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let opened: Result<Arc<dyn RtpTransport>> = async {
            let transport = Arc::new(
                UdpRtpTransport::new(RtpTransportConfig {
                    remote_addr: Some(self.server),
                    ..RtpTransportConfig::default()
                })
                .await?,
            ) as Arc<dyn RtpTransport>;

            let mut local = transport.local_addr()?;
            // The server replies to the request's source port, the
            // advertised port stays zero
            local.set_port(0);
            let data = fcc_request_data(&self.live_address, &local)?;
            let request = self.builder.build_app_packet(FCC_REQUEST_NAME, &data);
            transport.send_rtcp(&request).await?;
            Ok(transport)
        }
        .await;

        let transport = match opened {
            Ok(transport) => transport,
            Err(e) => {
                self.active.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        *self.transport.lock() = Some(transport.clone());

        let buffer = self.buffer.clone();
        let condition = self.condition.clone();
        let events = self.events.clone();
        let builder = self.builder.clone();
        let active = self.active.clone();
        let cancel = self.cancel.clone();
        let audio_disabled = self.audio_disabled.clone();
        let video_disabled = self.video_disabled.clone();

        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; DEFAULT_MAX_PACKET_SIZE];
            let mut reported_sync = false;
            let mut reported_ready = false;

            loop {
                if !active.load(Ordering::SeqCst) {
                    break;
                }

                let outcome = tokio::select! {
                    _ = cancel.notified() => break,
                    outcome = tokio::time::timeout(
                        Duration::from_millis(FCC_RECV_TIMEOUT_MS),
                        transport.recv(&mut buf),
                    ) => outcome,
                };

                let size = match outcome {
                    // The burst pauses between stream segments, keep waiting
                    Err(_) => continue,
                    Ok(Ok(size)) => size,
                    Ok(Err(e)) => {
                        warn!("Burst receive failed: {}", e);
                        let _ = events.send(SourceEvent::Error(e)).await;
                        break;
                    }
                };

                let packet = match RtpPacket::decode(&buf[..size]) {
                    Ok(packet) => packet,
                    Err(e) => {
                        debug!("Dropping undecodable burst packet: {}", e);
                        continue;
                    }
                };

                if !reported_sync {
                    reported_sync = true;
                    let _ = events.send(SourceEvent::SyncSource { ssrc: packet.ssrc }).await;
                }
                if packet.is_switch_ready() && !reported_ready {
                    reported_ready = true;
                    let _ = events.send(SourceEvent::SwitchReady).await;
                }

                let stream_type = packet.stream_type();
                let now = clock_millis();
                let _ = events
                    .send(SourceEvent::StreamInfo {
                        stream_type,
                        sequence: packet.sequence_number,
                        timestamp: now,
                    })
                    .await;

                let disabled = match stream_type {
                    StreamType::Audio => audio_disabled.load(Ordering::SeqCst),
                    StreamType::Video => video_disabled.load(Ordering::SeqCst),
                };
                if disabled {
                    trace!("Skipping caught-up {:?} burst sequence {}", stream_type, packet.sequence_number);
                    continue;
                }

                let deposited = buffer
                    .lock()
                    .put_at(packet.sequence_number, now, &packet.payload);
                match deposited {
                    Ok(_) => condition.open(),
                    Err(e) => {
                        trace!("Burst buffer full, dropping sequence {}: {}", packet.sequence_number, e);
                    }
                }
            }

            let goodbye = builder.build_bye_packet();
            let _ = transport.send_rtcp(&goodbye).await;
            let _ = transport.close().await;
            condition.open();
        });
        *self.task.lock() = Some(task);

        info!("Requested fast channel change burst from {}", self.server);
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
        info!("Closed fast channel change source for {}", self.live_address);
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
    use crate::packet::rtcp::{FCC_PROTOCOL_MARKER, RtcpPacketType};
    use crate::packet::MpegPayloadType;
    use bytes::Bytes;
    use tokio::net::UdpSocket;

    fn ts_packet(sequence: u16, extension: Bytes, payload: &[u8]) -> Vec<u8> {
        RtpPacket::new(
            MpegPayloadType::Mpeg2Ts,
            sequence,
            1000,
            0xA5A5A5A5,
            extension,
            Bytes::copy_from_slice(payload),
        )
        .encode()
        .unwrap()
        .to_vec()
    }

    /// Offset of the APP payload inside a request compound, or None
    fn find_app_data(compound: &[u8]) -> Option<usize> {
        compound
            .windows(4)
            .position(|w| w == FCC_REQUEST_NAME)
            .map(|name_at| name_at + 4)
    }

    #[tokio::test]
    async fn test_open_sends_burst_request() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(100);
        let source = FastChangeSource::new(
            server.local_addr().unwrap(),
            "239.1.2.3:5000".parse().unwrap(),
            tx,
        );
        source.open().await.unwrap();

        let mut buf = [0u8; 256];
        let (n, _peer) = tokio::time::timeout(Duration::from_millis(500), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let compound = &buf[..n];

        // Receiver report leads the compound
        assert_eq!(compound[0], 0x80);
        assert_eq!(compound[1], RtcpPacketType::ReceiverReport as u8);

        let data_at = find_app_data(compound).unwrap();
        let data = &compound[data_at..data_at + 16];
        assert_eq!(&data[0..2], &FCC_PROTOCOL_MARKER.to_be_bytes());
        assert_eq!(&data[2..4], &5000u16.to_be_bytes());
        assert_eq!(&data[4..8], &[239, 1, 2, 3]);
        // The advertised local port is zero
        assert_eq!(&data[10..12], &[0, 0]);

        source.close().await;
    }

    #[tokio::test]
    async fn test_burst_is_buffered_and_type_disable_drops() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::channel(100);
        let source = FastChangeSource::new(
            server.local_addr().unwrap(),
            "239.1.2.3:5000".parse().unwrap(),
            tx,
        );
        source.open().await.unwrap();

        let mut buf = [0u8; 256];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();

        server
            .send_to(&ts_packet(100, Bytes::new(), b"burst"), peer)
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::SyncSource { ssrc } => assert_eq!(ssrc, 0xA5A5A5A5),
            other => panic!("expected SyncSource, got {:?}", other),
        }
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::StreamInfo { stream_type, sequence, .. } => {
                assert_eq!(stream_type, StreamType::Video);
                assert_eq!(sequence, 100);
            }
            other => panic!("expected StreamInfo, got {:?}", other),
        }

        source.condition().wait().await;
        let mut out = [0u8; 32];
        let n = source.read(&mut out);
        assert_eq!(&out[..n], b"burst");

        // Disabled video still reports its sequence but is not deposited
        source.disable_video();
        server
            .send_to(&ts_packet(101, Bytes::new(), b"late"), peer)
            .await
            .unwrap();
        match tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SourceEvent::StreamInfo { sequence, .. } => assert_eq!(sequence, 101),
            other => panic!("expected StreamInfo, got {:?}", other),
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!source.has_data_available());

        source.close().await;
    }

    #[tokio::test]
    async fn test_ready_flag_reported_once() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, mut rx) = mpsc::channel(100);
        let source = FastChangeSource::new(
            server.local_addr().unwrap(),
            "239.1.2.3:5000".parse().unwrap(),
            tx,
        );
        source.open().await.unwrap();

        let mut buf = [0u8; 256];
        let (_, peer) = server.recv_from(&mut buf).await.unwrap();

        let ready = RtpPacket::extension_block(0x6767, &[0x00, 0x08, 0x00, 0x00]);
        server
            .send_to(&ts_packet(200, ready.clone(), b"a"), peer)
            .await
            .unwrap();
        server
            .send_to(&ts_packet(201, ready, b"b"), peer)
            .await
            .unwrap();

        let mut ready_events = 0;
        let mut info_events = 0;
        while info_events < 2 {
            match tokio::time::timeout(Duration::from_millis(500), rx.recv())
                .await
                .unwrap()
                .unwrap()
            {
                SourceEvent::SyncSource { .. } => {}
                SourceEvent::SwitchReady => ready_events += 1,
                SourceEvent::StreamInfo { .. } => info_events += 1,
                other => panic!("unexpected event {:?}", other),
            }
        }
        assert_eq!(ready_events, 1);

        source.close().await;
    }

    #[tokio::test]
    async fn test_close_sends_goodbye() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (tx, _rx) = mpsc::channel(100);
        let source = FastChangeSource::new(
            server.local_addr().unwrap(),
            "239.1.2.3:5000".parse().unwrap(),
            tx,
        );
        source.open().await.unwrap();

        let mut buf = [0u8; 256];
        server.recv_from(&mut buf).await.unwrap();

        source.close().await;

        let (n, _) = tokio::time::timeout(Duration::from_millis(500), server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let goodbye = &buf[..n];
        assert!(goodbye
            .windows(2)
            .any(|w| w == [0x81, RtcpPacketType::Goodbye as u8]));

        source.close().await;
    }

    #[tokio::test]
    async fn test_open_with_silent_server_still_connects() {
        let (tx, _rx) = mpsc::channel(100);
        // UDP connect does not require a listener, errors surface later
        // from the receive loop
        let source = FastChangeSource::new(
            "127.0.0.1:9".parse().unwrap(),
            "239.1.2.3:5000".parse().unwrap(),
            tx,
        );
        assert!(source.open().await.is_ok());
        source.close().await;
    }
}
