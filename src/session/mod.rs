//! Channel session orchestration
//!
//! A [`ChannelSession`] drives up to three sources for one channel: the
//! live stream, a fast channel change burst, and a lost packet recovery
//! path. It watches their events to decide when the burst has caught up
//! with the live stream, requests retransmission of detected losses,
//! and arbitrates every read across the three buffers.

pub mod address;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::packet::seq::sequence_precedes;
use crate::packet::StreamType;
use crate::recovery::{LossDecision, RecoveryCoordinator};
use crate::source::{
    ChannelSource, FastChangeSource, LiveSource, RecoverySource, SourceEvent, CLOSE_GRACE_MS,
};
use crate::{Error, Result, RtpSequenceNumber};
use address::ChannelAddress;

/// Bound on how long one read call parks waiting for data, in
/// milliseconds
const READ_WAIT_MS: u64 = 200;

/// Event queue depth between each source and the session
const SOURCE_EVENT_QUEUE: usize = 100;

/// Notifications fanned out to session subscribers
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    /// The burst carries enough data for the live join to start
    SwitchingReady,

    /// Playback moved from the burst to the live stream
    Switched,

    /// The fast channel change path failed, the live stream takes over
    FastChangeError(Error),

    /// The recovery path failed and is disabled for this session
    RecoveryError(Error),
}

/// Counters kept across the life of a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelSessionStats {
    /// Segments drained by the consumer from live and recovery
    pub packets_read: u64,

    /// Sequences skipped past without being recovered
    pub loss_permanent: u64,

    /// Sequences requested from the recovery server
    pub loss_requested: u64,

    /// Sequences recovered and delivered
    pub loss_recovered: u64,

    /// Sequences abandoned by admission control
    pub loss_discarded: u64,
}

/// Session configuration
#[derive(Debug, Clone)]
pub struct ChannelSessionConfig {
    /// Parsed channel address
    pub address: ChannelAddress,
}

impl ChannelSessionConfig {
    pub fn new(address: ChannelAddress) -> Self {
        Self { address }
    }

    /// Parse a channel URI into a configuration
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self { address: uri.parse()? })
    }
}

/// Outcome of one burst packet against the switch state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BurstSync {
    None,
    Synced {
        stream_type: StreamType,
        completed: bool,
    },
}

/// Per-type catch-up between the burst and the live stream.
///
/// A type syncs when a burst packet reaches the first sequence of that
/// type seen on the live join. Whichever type syncs while the other
/// already has completes the switch, with or without an exact boundary
/// hit.
#[derive(Debug, Default)]
struct SwitchTracker {
    first_audio: Option<RtpSequenceNumber>,
    first_video: Option<RtpSequenceNumber>,
    audio_synced: bool,
    video_synced: bool,
    switched: bool,
}

impl SwitchTracker {
    fn is_switched(&self) -> bool {
        self.switched
    }

    fn force_switched(&mut self) {
        self.switched = true;
    }

    /// Record the first live sequence of each type before the switch
    fn on_live_info(&mut self, stream_type: StreamType, sequence: RtpSequenceNumber) {
        if self.switched {
            return;
        }
        match stream_type {
            StreamType::Audio => {
                if self.first_audio.is_none() {
                    self.first_audio = Some(sequence);
                }
            }
            StreamType::Video => {
                if self.first_video.is_none() {
                    self.first_video = Some(sequence);
                }
            }
        }
    }

    fn on_burst_info(&mut self, stream_type: StreamType, sequence: RtpSequenceNumber) -> BurstSync {
        if self.switched {
            return BurstSync::None;
        }

        let (first, synced, other_synced) = match stream_type {
            StreamType::Audio => (self.first_audio, &mut self.audio_synced, self.video_synced),
            StreamType::Video => (self.first_video, &mut self.video_synced, self.audio_synced),
        };

        if first == Some(sequence) {
            *synced = true;
            if other_synced {
                self.switched = true;
            }
            BurstSync::Synced {
                stream_type,
                completed: self.switched,
            }
        } else if other_synced {
            *synced = true;
            self.switched = true;
            BurstSync::Synced {
                stream_type,
                completed: true,
            }
        } else {
            BurstSync::None
        }
    }
}

/// Whether the recovery head should be delivered before the live head.
/// A recovered sequence that precedes the live head wins unless its
/// request stamp is newer; one that does not precede wins only on a
/// strictly older stamp.
fn earlier_loss_recovered(
    recovery_seq: RtpSequenceNumber,
    recovery_ts: u64,
    live_seq: RtpSequenceNumber,
    live_ts: u64,
) -> bool {
    if sequence_precedes(recovery_seq, live_seq) {
        recovery_ts <= live_ts
    } else {
        recovery_ts < live_ts
    }
}

/// State shared between the event task and the read path
#[derive(Debug, Default)]
struct SharedState {
    coordinator: RecoveryCoordinator,
    stats: ChannelSessionStats,
    last_sequence_read: Option<RtpSequenceNumber>,
}

/// Event receivers parked between construction and open
struct SourceQueues {
    live: mpsc::Receiver<SourceEvent>,
    fast_change: mpsc::Receiver<SourceEvent>,
    recovery: mpsc::Receiver<SourceEvent>,
}

/// One playing channel with fast change and loss recovery
pub struct ChannelSession {
    config: ChannelSessionConfig,
    live: Arc<LiveSource>,
    fast_change: Option<Arc<FastChangeSource>>,
    recovery: Option<Arc<RecoverySource>>,
    shared: Arc<Mutex<SharedState>>,

    /// False only while the burst is the delivery path
    switched: Arc<AtomicBool>,

    /// Whether the recovery source is open and usable
    recovery_active: Arc<AtomicBool>,

    opened: AtomicBool,
    events: broadcast::Sender<ChannelEvent>,
    cancel: Arc<Notify>,
    task: Mutex<Option<JoinHandle<()>>>,
    queues: Mutex<Option<SourceQueues>>,
}

impl ChannelSession {
    /// Create a session for the given channel address
    pub fn new(config: ChannelSessionConfig) -> Self {
        let (live_tx, live_rx) = mpsc::channel(SOURCE_EVENT_QUEUE);
        let (fcc_tx, fcc_rx) = mpsc::channel(SOURCE_EVENT_QUEUE);
        let (recovery_tx, recovery_rx) = mpsc::channel(SOURCE_EVENT_QUEUE);
        let (events, _) = broadcast::channel(SOURCE_EVENT_QUEUE);

        let live = Arc::new(LiveSource::new(config.address.live, live_tx));
        let fast_change = config
            .address
            .fast_channel_server
            .map(|server| Arc::new(FastChangeSource::new(server, config.address.live, fcc_tx)));
        let recovery = config
            .address
            .recovery_server
            .map(|server| Arc::new(RecoverySource::new(server, recovery_tx)));

        Self {
            config,
            live,
            fast_change,
            recovery,
            shared: Arc::new(Mutex::new(SharedState::default())),
            switched: Arc::new(AtomicBool::new(true)),
            recovery_active: Arc::new(AtomicBool::new(false)),
            opened: AtomicBool::new(false),
            events,
            cancel: Arc::new(Notify::new()),
            task: Mutex::new(None),
            queues: Mutex::new(Some(SourceQueues {
                live: live_rx,
                fast_change: fcc_rx,
                recovery: recovery_rx,
            })),
        }
    }

    /// Parse `uri` and create a session for it
    pub fn from_uri(uri: &str) -> Result<Self> {
        Ok(Self::new(ChannelSessionConfig::from_uri(uri)?))
    }

    /// Open the channel.
    ///
    /// The burst is requested first when an FCC server is configured;
    /// if that fails the live stream is joined immediately instead.
    /// Recovery is attempted independently and only disables itself on
    /// failure. A live join failure is the only fatal outcome.
    pub async fn open(&self) -> Result<()> {
        if self.opened.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        info!("Opening channel session for {}", self.config.address);

        if let Some(fast_change) = &self.fast_change {
            match fast_change.open().await {
                Ok(()) => {
                    self.switched.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    warn!("Fast channel change unavailable, joining live directly: {}", e);
                }
            }
        }

        if self.switched.load(Ordering::SeqCst) {
            if let Err(e) = self.live.open().await {
                if let Some(fast_change) = &self.fast_change {
                    fast_change.close().await;
                }
                self.opened.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        if let Some(recovery) = &self.recovery {
            match recovery.open().await {
                Ok(()) => self.recovery_active.store(true, Ordering::SeqCst),
                Err(e) => {
                    warn!("Lost packet recovery unavailable: {}", e);
                }
            }
        }

        self.spawn_event_loop();
        Ok(())
    }

    fn spawn_event_loop(&self) {
        let queues = match self.queues.lock().take() {
            Some(queues) => queues,
            None => return,
        };

        let event_loop = EventLoop {
            live: self.live.clone(),
            fast_change: self.fast_change.clone(),
            recovery: self.recovery.clone(),
            shared: self.shared.clone(),
            switched: self.switched.clone(),
            recovery_active: self.recovery_active.clone(),
            events: self.events.clone(),
            tracker: SwitchTracker::default(),
        };
        let cancel = self.cancel.clone();

        *self.task.lock() = Some(tokio::spawn(event_loop.run(queues, cancel)));
    }

    /// Drain the next buffered segment into `out`.
    ///
    /// While the burst plays, reads come from the burst buffer. After
    /// the switch, leftover burst data drains first, then reads go to
    /// the live buffer unless an outstanding loss has been recovered
    /// and its segment sorts before the live head. Returns `Ok(0)` when
    /// nothing is ready within the wait bound, and also while a
    /// detected loss is still awaiting retransmission.
    pub async fn read(&self, out: &mut [u8]) -> Result<usize> {
        if !self.opened.load(Ordering::SeqCst) {
            return Err(Error::SessionError("channel session is not open".to_string()));
        }
        if out.is_empty() {
            return Ok(0);
        }

        let size = self.read_available(out);
        if size > 0 {
            return Ok(size);
        }

        {
            let condition = if self.switched.load(Ordering::SeqCst) {
                self.live.condition()
            } else {
                match &self.fast_change {
                    Some(fast_change) => fast_change.condition(),
                    None => self.live.condition(),
                }
            };
            let _ = tokio::time::timeout(
                Duration::from_millis(READ_WAIT_MS),
                condition.wait(),
            )
            .await;
        }

        Ok(self.read_available(out))
    }

    fn read_available(&self, out: &mut [u8]) -> usize {
        if !self.switched.load(Ordering::SeqCst) {
            return match &self.fast_change {
                Some(fast_change) => fast_change.read(out),
                None => 0,
            };
        }

        // Leftover burst data drains first after the switch
        if let Some(fast_change) = &self.fast_change {
            if fast_change.has_data_available() {
                return fast_change.read(out);
            }
        }

        if self.recovery_active.load(Ordering::SeqCst) && self.loss_pending() > 0 {
            if let Some(recovery) = &self.recovery {
                if recovery.has_data_available() {
                    if self.earlier_on_recovery(recovery) {
                        return self.read_recovery(recovery, out);
                    }
                    return self.read_live(out);
                }
            }
            // The gap is still awaiting its grant, hold position rather
            // than reading past it
            return 0;
        }

        self.read_live(out)
    }

    fn loss_pending(&self) -> u32 {
        self.shared.lock().coordinator.loss_pending()
    }

    fn earlier_on_recovery(&self, recovery: &RecoverySource) -> bool {
        let recovery_head = (recovery.current_sequence(), recovery.current_timestamp());
        let live_head = (self.live.current_sequence(), self.live.current_timestamp());

        match (recovery_head, live_head) {
            ((Some(recovery_seq), Some(recovery_ts)), (Some(live_seq), Some(live_ts))) => {
                earlier_loss_recovered(recovery_seq, recovery_ts, live_seq, live_ts)
            }
            // Only the recovery buffer holds data
            ((Some(_), Some(_)), _) => true,
            _ => false,
        }
    }

    fn read_live(&self, out: &mut [u8]) -> usize {
        let head = match self.live.current_sequence() {
            Some(head) => head,
            None => return 0,
        };

        let size = self.live.read(out);

        if self.live.current_sequence() != Some(head) {
            self.account_read(head, false);
        }
        size
    }

    fn read_recovery(&self, recovery: &RecoverySource, out: &mut [u8]) -> usize {
        let head = match recovery.current_sequence() {
            Some(head) => head,
            None => return 0,
        };

        let size = recovery.read(out);

        if recovery.current_sequence() != Some(head) {
            self.account_read(head, true);
        }
        size
    }

    /// Continuity bookkeeping after a fully drained segment
    fn account_read(&self, sequence: RtpSequenceNumber, recovered: bool) {
        let mut shared = self.shared.lock();

        if recovered {
            shared.coordinator.note_recovered();
            shared.stats.loss_recovered += 1;
        }

        if let Some(last) = shared.last_sequence_read {
            let expected = last.wrapping_add(1);
            if sequence != expected {
                let skipped = if expected < sequence {
                    (sequence - expected) as u64
                } else {
                    (65535 - expected) as u64 + sequence as u64
                };
                shared.stats.loss_permanent += skipped;
                debug!("Lost {} sequence(s) permanently before {}", skipped, sequence);
            }
        }
        shared.last_sequence_read = Some(sequence);
        shared.stats.packets_read += 1;
    }

    /// Close all sources and stop the event task. Safe to call again.
    pub async fn close(&self) {
        if !self.opened.swap(false, Ordering::SeqCst) {
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

        if let Some(fast_change) = &self.fast_change {
            fast_change.close().await;
        }
        if let Some(recovery) = &self.recovery {
            recovery.close().await;
        }
        self.live.close().await;
        self.recovery_active.store(false, Ordering::SeqCst);

        let stats = self.shared.lock().stats;
        info!(
            "Channel session closed: packets_read={} loss_permanent={} loss_requested={} loss_recovered={} loss_discarded={}",
            stats.packets_read,
            stats.loss_permanent,
            stats.loss_requested,
            stats.loss_recovered,
            stats.loss_discarded,
        );
    }

    /// Receive session notifications
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> ChannelSessionStats {
        self.shared.lock().stats
    }

    /// Whether reads are served by the live stream rather than a burst
    pub fn is_switched(&self) -> bool {
        self.switched.load(Ordering::SeqCst)
    }

    pub fn is_opened(&self) -> bool {
        self.opened.load(Ordering::SeqCst)
    }

    /// Address the live receiver is bound to, once the live join ran
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.live.local_addr()
    }

    pub fn address(&self) -> &ChannelAddress {
        &self.config.address
    }
}

/// Reacts to source events on a background task
struct EventLoop {
    live: Arc<LiveSource>,
    fast_change: Option<Arc<FastChangeSource>>,
    recovery: Option<Arc<RecoverySource>>,
    shared: Arc<Mutex<SharedState>>,
    switched: Arc<AtomicBool>,
    recovery_active: Arc<AtomicBool>,
    events: broadcast::Sender<ChannelEvent>,
    tracker: SwitchTracker,
}

impl EventLoop {
    async fn run(mut self, mut queues: SourceQueues, cancel: Arc<Notify>) {
        loop {
            tokio::select! {
                _ = cancel.notified() => break,
                Some(event) = queues.live.recv() => self.on_live_event(event).await,
                Some(event) = queues.fast_change.recv() => self.on_burst_event(event).await,
                Some(event) = queues.recovery.recv() => self.on_recovery_event(event).await,
            }
        }
    }

    async fn on_live_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::SyncSource { ssrc } => {
                debug!("Live synchronization source {:#010x}", ssrc);
                if let Some(recovery) = &self.recovery {
                    recovery.set_media_ssrc(ssrc);
                }
            }
            SourceEvent::StreamInfo { stream_type, sequence, timestamp } => {
                self.observe_live_sequence(sequence, timestamp).await;
                self.tracker.on_live_info(stream_type, sequence);
            }
            SourceEvent::Error(e) => {
                // The live stream has no fallback, keep serving whatever
                // is still buffered
                warn!("Live source error: {}", e);
            }
            SourceEvent::SwitchReady => {}
        }
    }

    /// Gap detection against the previous live sequence, with a NACK or
    /// a recovery reset depending on the admission decision
    async fn observe_live_sequence(&self, sequence: RtpSequenceNumber, timestamp: u64) {
        let recovering = self.recovery_active.load(Ordering::SeqCst);

        let decision = {
            let mut shared = self.shared.lock();
            if recovering {
                let decision = shared.coordinator.observe_sequence(sequence);
                match decision {
                    LossDecision::Request { num_lost, .. } => {
                        shared.stats.loss_requested += num_lost as u64;
                    }
                    LossDecision::Overflow { discarded } => {
                        shared.stats.loss_discarded += discarded as u64;
                    }
                    LossDecision::InOrder => {}
                }
                decision
            } else {
                shared.coordinator.track_sequence(sequence);
                LossDecision::InOrder
            }
        };

        match decision {
            LossDecision::InOrder => {}
            LossDecision::Request { last_received, num_lost } => {
                if let Some(recovery) = &self.recovery {
                    if let Err(e) = recovery
                        .request_retransmission(last_received, num_lost, timestamp)
                        .await
                    {
                        warn!("Retransmission request failed: {}", e);
                    }
                }
            }
            LossDecision::Overflow { discarded } => {
                debug!("Abandoning {} unrecoverable sequence(s), resetting recovery", discarded);
                if let Some(recovery) = &self.recovery {
                    recovery.reset_recovery();
                }
            }
        }
    }

    async fn on_burst_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::SyncSource { ssrc } => {
                debug!("Burst synchronization source {:#010x}", ssrc);
                if let Some(recovery) = &self.recovery {
                    recovery.set_media_ssrc(ssrc);
                }
            }
            SourceEvent::StreamInfo { stream_type, sequence, .. } => {
                match self.tracker.on_burst_info(stream_type, sequence) {
                    BurstSync::None => {}
                    BurstSync::Synced { stream_type, completed } => {
                        if let Some(fast_change) = &self.fast_change {
                            match stream_type {
                                StreamType::Audio => fast_change.disable_audio(),
                                StreamType::Video => fast_change.disable_video(),
                            }
                        }
                        debug!("{:?} burst caught up with live at sequence {}", stream_type, sequence);
                        if completed {
                            self.complete_switch().await;
                        }
                    }
                }
            }
            SourceEvent::SwitchReady => {
                if !self.live.is_opened() {
                    info!("Burst ready, joining the live stream");
                    let _ = self.events.send(ChannelEvent::SwitchingReady);
                    if let Err(e) = self.live.open().await {
                        warn!("Deferred live join failed: {}", e);
                    }
                }
            }
            SourceEvent::Error(e) => {
                warn!("Fast channel change failed, falling back to live: {}", e);
                self.tracker.force_switched();
                self.switched.store(true, Ordering::SeqCst);
                if let Some(fast_change) = &self.fast_change {
                    fast_change.close().await;
                }
                if !self.live.is_opened() {
                    if let Err(open_err) = self.live.open().await {
                        warn!("Live join after burst failure failed: {}", open_err);
                    }
                }
                let _ = self.events.send(ChannelEvent::FastChangeError(e));
            }
        }
    }

    async fn complete_switch(&mut self) {
        self.switched.store(true, Ordering::SeqCst);
        if let Some(fast_change) = &self.fast_change {
            fast_change.close().await;
        }
        info!("Channel change switched to the live stream");
        let _ = self.events.send(ChannelEvent::Switched);
    }

    async fn on_recovery_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Error(e) => {
                warn!("Recovery source failed, disabling recovery: {}", e);
                self.recovery_active.store(false, Ordering::SeqCst);
                if let Some(recovery) = &self.recovery {
                    recovery.close().await;
                }
                let _ = self.events.send(ChannelEvent::RecoveryError(e));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{MpegPayloadType, RtpPacket};
    use bytes::Bytes;
    use tokio::net::UdpSocket;
    use tokio::time::timeout;

    fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    const AUDIO_FLAG: [u8; 4] = [0x00, 0x10, 0x00, 0x00];
    const VIDEO_READY_FLAG: [u8; 4] = [0x00, 0x08, 0x00, 0x00];

    fn media_packet(sequence: u16, extension: Bytes, payload: &[u8]) -> Vec<u8> {
        RtpPacket::new(
            MpegPayloadType::Mpeg2Ts,
            sequence,
            90_000,
            0x51515151,
            extension,
            Bytes::copy_from_slice(payload),
        )
        .encode()
        .unwrap()
        .to_vec()
    }

    fn video_packet(sequence: u16, payload: &[u8]) -> Vec<u8> {
        media_packet(sequence, Bytes::new(), payload)
    }

    fn audio_packet(sequence: u16, payload: &[u8]) -> Vec<u8> {
        media_packet(sequence, RtpPacket::extension_block(0, &AUDIO_FLAG), payload)
    }

    async fn read_some(session: &ChannelSession, out: &mut [u8]) -> usize {
        for _ in 0..25 {
            let size = session.read(out).await.unwrap();
            if size > 0 {
                return size;
            }
        }
        panic!("no data arrived within the read deadline");
    }

    async fn wait_for_live_bind(session: &ChannelSession) -> SocketAddr {
        for _ in 0..100 {
            if let Some(addr) = session.local_addr() {
                return addr;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("live source never bound");
    }

    #[test]
    fn test_switch_tracker_exact_sync_both_types() {
        let mut tracker = SwitchTracker::default();
        tracker.on_live_info(StreamType::Audio, 100);
        tracker.on_live_info(StreamType::Video, 200);
        // Later live packets do not move the recorded firsts
        tracker.on_live_info(StreamType::Audio, 101);
        assert_eq!(tracker.first_audio, Some(100));

        assert_eq!(tracker.on_burst_info(StreamType::Audio, 99), BurstSync::None);
        assert_eq!(
            tracker.on_burst_info(StreamType::Audio, 100),
            BurstSync::Synced { stream_type: StreamType::Audio, completed: false }
        );
        assert!(!tracker.is_switched());
        assert_eq!(
            tracker.on_burst_info(StreamType::Video, 200),
            BurstSync::Synced { stream_type: StreamType::Video, completed: true }
        );
        assert!(tracker.is_switched());

        // Once switched the machine stays put
        assert_eq!(tracker.on_burst_info(StreamType::Audio, 100), BurstSync::None);
    }

    #[test]
    fn test_switch_tracker_forced_sync_is_symmetric() {
        // Audio missed its boundary, video already synced
        let mut tracker = SwitchTracker::default();
        tracker.on_live_info(StreamType::Audio, 100);
        tracker.on_live_info(StreamType::Video, 200);
        tracker.on_burst_info(StreamType::Video, 200);
        assert_eq!(
            tracker.on_burst_info(StreamType::Audio, 101),
            BurstSync::Synced { stream_type: StreamType::Audio, completed: true }
        );
        assert!(tracker.is_switched());

        // Video missed its boundary, audio already synced
        let mut tracker = SwitchTracker::default();
        tracker.on_live_info(StreamType::Audio, 100);
        tracker.on_live_info(StreamType::Video, 200);
        tracker.on_burst_info(StreamType::Audio, 100);
        assert_eq!(
            tracker.on_burst_info(StreamType::Video, 201),
            BurstSync::Synced { stream_type: StreamType::Video, completed: true }
        );
        assert!(tracker.is_switched());
    }

    #[test]
    fn test_switch_tracker_needs_live_reference() {
        let mut tracker = SwitchTracker::default();
        // Nothing recorded from live yet, burst packets cannot sync
        assert_eq!(tracker.on_burst_info(StreamType::Audio, 100), BurstSync::None);
        assert_eq!(tracker.on_burst_info(StreamType::Video, 200), BurstSync::None);
        assert!(!tracker.is_switched());
    }

    #[test]
    fn test_earlier_loss_recovered_ordering() {
        // Recovery precedes live and its stamp is not newer
        assert!(earlier_loss_recovered(50, 1000, 55, 1005));
        assert!(earlier_loss_recovered(50, 1005, 55, 1005));
        // Recovery follows live, timestamps agree with that
        assert!(!earlier_loss_recovered(60, 1010, 55, 1005));
        // Recovery follows live but its stamp is older, stamp wins
        assert!(earlier_loss_recovered(60, 1000, 55, 1005));
        // Precedence across the wraparound boundary
        assert!(earlier_loss_recovered(65530, 1000, 5, 1005));
        // Equal stamps without precedence stay on live
        assert!(!earlier_loss_recovered(60, 1005, 55, 1005));
    }

    #[tokio::test]
    async fn test_live_only_session_reads_and_counts_loss() {
        init_test_logging();

        let session = ChannelSession::from_uri("iptv://127.0.0.1:0?vendor=nokia").unwrap();
        session.open().await.unwrap();
        assert!(session.is_switched());

        let live_addr = wait_for_live_bind(&session).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut out = [0u8; 64];

        sender.send_to(&video_packet(10, b"p10"), live_addr).await.unwrap();
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p10");

        sender.send_to(&video_packet(11, b"p11"), live_addr).await.unwrap();
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p11");

        // A gap with no recovery configured is permanent once read past
        sender.send_to(&video_packet(15, b"p15"), live_addr).await.unwrap();
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p15");

        let stats = session.stats();
        assert_eq!(stats.packets_read, 3);
        assert_eq!(stats.loss_permanent, 3);
        assert_eq!(stats.loss_requested, 0);

        session.close().await;
        assert!(!session.is_opened());
        assert!(session.read(&mut out).await.is_err());
    }

    #[tokio::test]
    async fn test_channel_switch_end_to_end() {
        init_test_logging();

        let fcc_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = ChannelSession::from_uri(&format!(
            "iptv://127.0.0.1:0?vendor=nokia&fcc_server_addr={}",
            fcc_server.local_addr().unwrap()
        ))
        .unwrap();
        let mut events = session.subscribe();

        session.open().await.unwrap();
        assert!(!session.is_switched());
        assert!(session.local_addr().is_none());

        // The server observes the burst request
        let mut buf = [0u8; 2048];
        let (_, peer) = timeout(Duration::from_millis(500), fcc_server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();

        // A burst packet with the ready flag triggers the live join
        fcc_server
            .send_to(
                &media_packet(198, RtpPacket::extension_block(0, &VIDEO_READY_FLAG), b"v198"),
                peer,
            )
            .await
            .unwrap();
        match timeout(Duration::from_millis(500), events.recv()).await.unwrap().unwrap() {
            ChannelEvent::SwitchingReady => {}
            other => panic!("expected SwitchingReady, got {:?}", other),
        }
        let live_addr = wait_for_live_bind(&session).await;

        // First live sequences become the sync boundaries
        let live_sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        live_sender.send_to(&audio_packet(100, b"a100"), live_addr).await.unwrap();
        live_sender.send_to(&video_packet(200, b"v200"), live_addr).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The burst reaches both boundaries
        fcc_server.send_to(&audio_packet(100, b"a100"), peer).await.unwrap();
        fcc_server.send_to(&video_packet(200, b"v200"), peer).await.unwrap();

        match timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap() {
            ChannelEvent::Switched => {}
            other => panic!("expected Switched, got {:?}", other),
        }
        assert!(session.is_switched());

        // Teardown of the burst session reaches the server as a goodbye
        let (size, _) = timeout(Duration::from_millis(500), fcc_server.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(buf[..size].windows(2).any(|w| w == [0x81, 203]));

        // Reads drain leftover burst data, then continue on live
        let mut out = [0u8; 64];
        let mut delivered = Vec::new();
        for _ in 0..10 {
            let size = session.read(&mut out).await.unwrap();
            if size > 0 {
                delivered.push(out[..size].to_vec());
            }
            if delivered.iter().any(|p| p == b"v200") {
                break;
            }
        }
        assert!(delivered.iter().any(|p| p == b"v198"));

        session.close().await;
    }

    #[tokio::test]
    async fn test_recovered_gap_is_delivered_in_order() {
        init_test_logging();

        let recovery_server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = ChannelSession::from_uri(&format!(
            "iptv://127.0.0.1:0?vendor=nokia&lpr_server_addr={}",
            recovery_server.local_addr().unwrap()
        ))
        .unwrap();
        session.open().await.unwrap();

        let live_addr = wait_for_live_bind(&session).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut out = [0u8; 64];

        sender.send_to(&video_packet(20, b"p20"), live_addr).await.unwrap();
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p20");

        // A 2-packet gap turns into a retransmission request
        sender.send_to(&video_packet(23, b"p23"), live_addr).await.unwrap();
        let mut buf = [0u8; 256];
        let (size, peer) =
            timeout(Duration::from_millis(500), recovery_server.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
        let nack_at = buf[..size]
            .windows(2)
            .position(|w| w == [0x81, 205])
            .unwrap();
        assert_eq!(&buf[nack_at + 12..nack_at + 14], &21u16.to_be_bytes());
        assert_eq!(&buf[nack_at + 14..nack_at + 16], &0x0001u16.to_be_bytes());

        // The gap holds reads at zero until the grant arrives
        assert_eq!(session.read(&mut out).await.unwrap(), 0);
        assert_eq!(session.stats().loss_requested, 2);

        recovery_server.send_to(&video_packet(21, b"p21"), peer).await.unwrap();
        recovery_server.send_to(&video_packet(22, b"p22"), peer).await.unwrap();

        // Recovered data comes out ahead of the newer live packet
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p21");
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p22");
        let size = read_some(&session, &mut out).await;
        assert_eq!(&out[..size], b"p23");

        let stats = session.stats();
        assert_eq!(stats.packets_read, 4);
        assert_eq!(stats.loss_recovered, 2);
        assert_eq!(stats.loss_permanent, 0);

        session.close().await;
    }

    #[tokio::test]
    async fn test_open_is_idempotent_and_close_without_open_is_safe() {
        let session = ChannelSession::from_uri("iptv://127.0.0.1:0?vendor=nokia").unwrap();
        session.close().await;

        session.open().await.unwrap();
        session.open().await.unwrap();
        session.close().await;
        session.close().await;
    }
}
