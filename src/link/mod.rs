//! # Link Engine
//!
//! Owns one CRSF link session: the transport, the shared channel set and the
//! two tasks that drive the wire.
//!
//! This module handles:
//! - The `Closed -> Open -> Running -> ShuttingDown -> Closed` lifecycle
//! - A fixed-rate transmitter that always sends the latest channel snapshot
//! - A timeout-bounded receiver that parses inbound frames and notifies observers
//! - The failsafe frame sent before the transport is released
//!
//! # Examples
//!
//! ```no_run
//! use crsf_link::config::Config;
//! use crsf_link::link::LinkEngine;
//!
//! # async fn run() -> crsf_link::error::Result<()> {
//! let config = Config::default();
//! let engine = LinkEngine::new(config.crsf.clone(), config.link.clone());
//!
//! engine.start_link(&config.serial).await?;
//! engine.arm()?;
//! engine.set_channels(&[1024, 1024, 300, 1024, 0, 1024, 1024, 1024,
//!                       1024, 1024, 1024, 1024, 1024, 1024, 1024, 1024])?;
//! engine.stop_link().await?;
//! # Ok(())
//! # }
//! ```

pub mod safety;
pub mod state;

pub use safety::SafetyPolicy;
pub use state::{safe_default_channels, ChannelState};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::{CrsfConfig, LinkConfig, SerialConfig};
use crate::crsf::decoder::{FrameParser, ParseEvent};
use crate::crsf::encoder::encode_rc_channels_frame;
use crate::crsf::protocol::{channels, CrsfFrame, RcChannels};
use crate::error::{CrsfLinkError, Result};
use crate::serial::{SerialOpener, SerialReader, SerialWriter, TransportOpener};

/// Number of packets between status log messages
const LOG_INTERVAL_PACKETS: u64 = 1000;

/// Receive buffer size for a single transport read
const READ_BUFFER_SIZE: usize = 256;

/// Lifecycle of a link session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// No transport held
    Closed,
    /// Transport acquired, tasks not yet started
    Open,
    /// Transmitter and receiver active
    Running,
    /// Stop requested, failsafe frame pending
    ShuttingDown,
}

/// Point-in-time view of the link for collaborators
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub armed: bool,
    pub connected: bool,
    pub channels: RcChannels,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Frame counters for the current session
#[derive(Debug, Default)]
pub struct LinkCounters {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    checksum_mismatches: AtomicU64,
}

impl LinkCounters {
    pub fn frames_sent(&self) -> u64 {
        self.frames_sent.load(Ordering::Relaxed)
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    /// Bytes dropped by the parser to resynchronise
    pub fn checksum_mismatches(&self) -> u64 {
        self.checksum_mismatches.load(Ordering::Relaxed)
    }

    fn reset(&self) {
        self.frames_sent.store(0, Ordering::Relaxed);
        self.frames_received.store(0, Ordering::Relaxed);
        self.checksum_mismatches.store(0, Ordering::Relaxed);
    }
}

/// Consumer of decoded inbound frames (telemetry loggers, UIs)
///
/// Called from the receiver task for every checksum-valid frame. Implementations
/// must return quickly; the receiver does not read while an observer runs.
#[cfg_attr(test, mockall::automock)]
pub trait FrameObserver: Send + Sync {
    fn on_frame(&self, frame: &CrsfFrame);
}

type Observers = Arc<RwLock<Vec<Arc<dyn FrameObserver>>>>;

/// State shared by the engine and its session tasks
#[derive(Clone)]
struct SessionContext {
    channels: Arc<ChannelState>,
    safety: SafetyPolicy,
    counters: Arc<LinkCounters>,
    observers: Observers,
    state_tx: Arc<watch::Sender<LinkState>>,
    stop_tx: Arc<watch::Sender<bool>>,
    destination: u8,
}

impl SessionContext {
    /// Record a fatal transport failure: failsafe values, `Closed`, stop both tasks
    fn fault(&self, message: String) -> CrsfLinkError {
        error!("{}", message);
        self.safety.shutdown_sequence();
        self.state_tx.send_replace(LinkState::Closed);
        self.stop_tx.send_replace(true);
        CrsfLinkError::Transport(message)
    }

    fn notify_observers(&self, frame: &CrsfFrame) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner);
        for observer in observers.iter() {
            observer.on_frame(frame);
        }
    }
}

struct Session {
    stop_tx: Arc<watch::Sender<bool>>,
    transmitter: JoinHandle<Result<()>>,
    receiver: JoinHandle<Result<()>>,
}

impl Drop for Session {
    fn drop(&mut self) {
        // Dropping a live session still winds the tasks down through the failsafe path
        self.stop_tx.send_replace(true);
    }
}

/// CRSF link engine
pub struct LinkEngine {
    opener: Arc<dyn TransportOpener>,
    crsf: CrsfConfig,
    link: LinkConfig,
    channels: Arc<ChannelState>,
    safety: SafetyPolicy,
    counters: Arc<LinkCounters>,
    observers: Observers,
    state_tx: Arc<watch::Sender<LinkState>>,
    session: Mutex<Option<Session>>,
}

impl LinkEngine {
    /// Create an engine that opens real serial ports
    pub fn new(crsf: CrsfConfig, link: LinkConfig) -> Self {
        Self::with_opener(Arc::new(SerialOpener), crsf, link)
    }

    /// Create an engine over any transport
    ///
    /// # Arguments
    ///
    /// * `opener` - Acquires the transport on each `start_link`
    /// * `crsf` - Packet rate and destination address
    /// * `link` - Session timing (receiver join timeout)
    pub fn with_opener(opener: Arc<dyn TransportOpener>, crsf: CrsfConfig, link: LinkConfig) -> Self {
        let channels = Arc::new(ChannelState::new());
        let safety = SafetyPolicy::new(Arc::clone(&channels));
        let (state_tx, _) = watch::channel(LinkState::Closed);

        Self {
            opener,
            crsf,
            link,
            channels,
            safety,
            counters: Arc::new(LinkCounters::default()),
            observers: Arc::new(RwLock::new(Vec::new())),
            state_tx: Arc::new(state_tx),
            session: Mutex::new(None),
        }
    }

    /// Open the transport and start the transmitter and receiver
    ///
    /// The channel set is reset to the safe defaults (throttle 0, everything
    /// else centered, disarmed) before the first frame goes out.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A session is already active (`AlreadyRunning`)
    /// - The transport cannot be opened (`Transport`); the engine stays `Closed`
    pub async fn start_link(&self, serial: &SerialConfig) -> Result<()> {
        let mut session = self.session.lock().await;

        if self.state() != LinkState::Closed {
            return Err(CrsfLinkError::AlreadyRunning);
        }

        // Reap a session that faulted without a stop_link
        if let Some(stale) = session.take() {
            if let Err(e) = Self::join_session(stale, self.link.join_timeout()).await {
                debug!("Discarding previous session error: {}", e);
            }
        }

        self.channels.reset_to_defaults();
        self.counters.reset();

        let (reader, writer) = match self.opener.open(serial).await {
            Ok(halves) => halves,
            Err(e) => {
                error!("Failed to open transport {}: {}", serial.port, e);
                self.state_tx.send_replace(LinkState::Closed);
                return Err(e);
            }
        };
        self.state_tx.send_replace(LinkState::Open);

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let ctx = SessionContext {
            channels: Arc::clone(&self.channels),
            safety: self.safety.clone(),
            counters: Arc::clone(&self.counters),
            observers: Arc::clone(&self.observers),
            state_tx: Arc::clone(&self.state_tx),
            stop_tx: Arc::clone(&stop_tx),
            destination: self.crsf.destination,
        };

        self.channels.activate();
        self.state_tx.send_replace(LinkState::Running);

        let transmitter = tokio::spawn(run_transmitter(
            writer,
            ctx.clone(),
            stop_rx.clone(),
            self.crsf.packet_interval(),
        ));
        let receiver = tokio::spawn(run_receiver(reader, ctx, stop_rx, serial.read_timeout()));

        *session = Some(Session {
            stop_tx,
            transmitter,
            receiver,
        });

        info!(
            "Link started on {} at {} baud, {}Hz to 0x{:02X}",
            serial.port, serial.baud_rate, self.crsf.packet_rate_hz, self.crsf.destination
        );
        Ok(())
    }

    /// Send the failsafe frame, stop both tasks and release the transport
    ///
    /// The final frame carries throttle 0 and the arm channel at 1024. It is
    /// written before the engine reports `Closed`.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - No session exists (`NotConnected`)
    /// - The session faulted, or the final write failed (`Transport`)
    pub async fn stop_link(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        let Some(active) = session.take() else {
            return Err(CrsfLinkError::NotConnected);
        };

        if self.state() == LinkState::Running {
            self.state_tx.send_replace(LinkState::ShuttingDown);
            info!("Stopping link");
        }

        let result = Self::join_session(active, self.link.join_timeout()).await;
        if self.channels.is_active() {
            // Transmitter ended without running the failsafe
            self.safety.shutdown_sequence();
        }
        self.state_tx.send_replace(LinkState::Closed);

        info!(
            "Link closed ({} frames sent, {} received, {} checksum mismatches)",
            self.counters.frames_sent(),
            self.counters.frames_received(),
            self.counters.checksum_mismatches()
        );
        result
    }

    /// Signal stop, wait for the transmitter, then join the receiver within `join_timeout`
    async fn join_session(mut session: Session, join_timeout: Duration) -> Result<()> {
        session.stop_tx.send_replace(true);

        let transmitted = match (&mut session.transmitter).await {
            Ok(result) => result,
            Err(e) => Err(CrsfLinkError::Transport(format!("Transmitter task failed: {}", e))),
        };

        let received = match tokio::time::timeout(join_timeout, &mut session.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(CrsfLinkError::Transport(format!("Receiver task failed: {}", e))),
            Err(_) => {
                warn!("Receiver did not stop within {:?}, aborting it", join_timeout);
                session.receiver.abort();
                Ok(())
            }
        };

        transmitted.and(received)
    }

    /// Current status snapshot
    pub fn get_status(&self) -> LinkStatus {
        let (channels, armed) = self.channels.status();
        LinkStatus {
            armed,
            connected: self.state() == LinkState::Running,
            channels,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Replace all 16 channels (the arm channel keeps its value)
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - The link is not running (`NotConnected`)
    /// - `channels` does not hold exactly 16 values (`InvalidChannelCount`); nothing is applied
    pub fn set_channels(&self, channels: &[u16]) -> Result<()> {
        self.ensure_running()?;
        self.channels.replace(channels)
    }

    /// Set one channel other than the arm channel
    ///
    /// # Errors
    ///
    /// Returns `NotConnected`, `InvalidChannelIndex` or `ReservedChannel`
    pub fn set_channel(&self, index: usize, value: u16) -> Result<()> {
        self.ensure_running()?;
        self.channels.set(index, value)
    }

    pub fn arm(&self) -> Result<()> {
        self.ensure_running()?;
        self.safety.arm()
    }

    pub fn disarm(&self) -> Result<()> {
        self.ensure_running()?;
        self.safety.disarm()
    }

    pub fn reset_controls(&self) -> Result<()> {
        self.ensure_running()?;
        self.safety.reset_controls()
    }

    /// Register an observer for inbound frames
    pub fn add_observer(&self, observer: Arc<dyn FrameObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    pub fn state(&self) -> LinkState {
        *self.state_tx.borrow()
    }

    /// Watch lifecycle transitions
    pub fn subscribe_state(&self) -> watch::Receiver<LinkState> {
        self.state_tx.subscribe()
    }

    /// Resolve once the engine reaches `Closed` (stop or transport fault)
    pub async fn wait_closed(&self) {
        let mut state_rx = self.subscribe_state();
        // The sender lives as long as `self`, so this cannot fail while borrowed
        let _ = state_rx.wait_for(|state| *state == LinkState::Closed).await;
    }

    fn ensure_running(&self) -> Result<()> {
        if self.state() == LinkState::Running {
            Ok(())
        } else {
            Err(CrsfLinkError::NotConnected)
        }
    }
}

/// Fixed-rate transmit loop
///
/// Each tick encodes one snapshot taken under a single lock acquisition. Late
/// ticks are skipped, never queued. On stop, the failsafe set is sent once and
/// the writer is closed.
async fn run_transmitter(
    mut writer: Box<dyn SerialWriter>,
    ctx: SessionContext,
    mut stop_rx: watch::Receiver<bool>,
    period: Duration,
) -> Result<()> {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut last_log_count: u64 = 0;

    loop {
        tokio::select! {
            biased;

            _ = stop_rx.changed() => break,

            _ = ticker.tick() => {
                let frame = encode_rc_channels_frame(ctx.destination, &ctx.channels.snapshot());

                if let Err(e) = writer.write_frame(&frame).await {
                    let _ = writer.close().await;
                    return Err(ctx.fault(format!("Serial write failed: {}", e)));
                }

                let sent = ctx.counters.frames_sent.fetch_add(1, Ordering::Relaxed) + 1;

                // Log status every LOG_INTERVAL_PACKETS
                if sent - last_log_count >= LOG_INTERVAL_PACKETS {
                    let (snapshot, armed) = ctx.channels.status();
                    info!(
                        "Sent {} packets (armed: {}, throttle: {})",
                        sent, armed, snapshot[channels::THROTTLE]
                    );
                    last_log_count = sent;
                }
            }
        }
    }

    let failsafe = ctx.safety.shutdown_sequence();
    let frame = encode_rc_channels_frame(ctx.destination, &failsafe);

    if let Err(e) = writer.write_frame(&frame).await {
        let _ = writer.close().await;
        return Err(ctx.fault(format!("Failsafe frame write failed: {}", e)));
    }
    ctx.counters.frames_sent.fetch_add(1, Ordering::Relaxed);
    debug!("Failsafe frame sent");

    if let Err(e) = writer.close().await {
        warn!("Failed to close transport cleanly: {}", e);
    }

    Ok(())
}

fn stop_requested(stop_rx: &watch::Receiver<bool>) -> bool {
    *stop_rx.borrow()
}

/// Timeout-bounded receive loop
///
/// Checks the stop signal between reads; each read blocks for at most
/// `read_timeout`.
async fn run_receiver(
    mut reader: Box<dyn SerialReader>,
    ctx: SessionContext,
    stop_rx: watch::Receiver<bool>,
    read_timeout: Duration,
) -> Result<()> {
    let mut parser = FrameParser::new();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    while !stop_requested(&stop_rx) {
        let n = match reader.read_timeout(&mut buf, read_timeout).await {
            Ok(n) => n,
            Err(e) => return Err(ctx.fault(format!("Serial read failed: {}", e))),
        };

        if n == 0 {
            continue;
        }

        parser.push(&buf[..n]);

        while let Some(event) = parser.next_event() {
            match event {
                ParseEvent::Frame(frame) => {
                    ctx.counters.frames_received.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        "Received frame type 0x{:02X} from 0x{:02X} ({} bytes)",
                        frame.frame_type,
                        frame.address,
                        frame.payload.len()
                    );
                    ctx.notify_observers(&frame);
                }
                ParseEvent::ChecksumMismatch { dropped } => {
                    ctx.counters.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
                    warn!("CRC mismatch, dropped byte 0x{:02X} to resync", dropped);
                }
            }
        }
    }

    debug!("Receiver stopped ({} bytes pending)", parser.buffered());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crsf::decoder::{decode_rc_channels, parse_stream, ParseOutcome};
    use crate::crsf::encoder::build_frame;
    use crate::crsf::protocol::{
        CRSF_ADDRESS_FLIGHT_CONTROLLER, CRSF_FRAMETYPE_BATTERY_SENSOR, CRSF_FRAMETYPE_LINK_STATISTICS,
    };
    use crate::serial::port_trait::mocks::{MockHandle, MockOpener};
    use std::sync::atomic::AtomicBool;
    use tokio::time::{sleep, timeout};

    fn engine_with(opener: MockOpener) -> LinkEngine {
        LinkEngine::with_opener(Arc::new(opener), CrsfConfig::default(), LinkConfig::default())
    }

    fn connected_engine() -> (LinkEngine, MockHandle) {
        let (opener, handle) = MockOpener::connected();
        (engine_with(opener), handle)
    }

    fn decode_written(frame: &[u8]) -> RcChannels {
        match parse_stream(frame) {
            ParseOutcome::Frame { frame, consumed } => {
                assert_eq!(consumed, 26);
                decode_rc_channels(&frame.payload).unwrap()
            }
            other => panic!("Written bytes are not a valid frame: {:?}", other),
        }
    }

    async fn wait_for_frames(handle: &MockHandle, count: usize) {
        timeout(Duration::from_secs(2), async {
            while handle.get_written_frames().len() < count {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("transmitter did not send enough frames");
    }

    #[tokio::test]
    async fn test_start_link_sends_safe_defaults() {
        let (engine, handle) = connected_engine();

        engine.start_link(&SerialConfig::default()).await.unwrap();
        assert_eq!(engine.state(), LinkState::Running);
        wait_for_frames(&handle, 1).await;

        let first = &handle.get_written_frames()[0];
        assert_eq!(*first, encode_rc_channels_frame(0xC8, &safe_default_channels()));

        let status = engine.get_status();
        assert!(status.connected);
        assert!(!status.armed);
        assert_eq!(status.channels[channels::THROTTLE], 0);

        engine.stop_link().await.unwrap();
    }

    #[tokio::test]
    async fn test_arm_is_reflected_in_transmitted_frames() {
        let (engine, handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();

        engine.arm().unwrap();
        engine.set_channel(channels::THROTTLE, 1200).unwrap();
        let already_sent = handle.get_written_frames().len();
        wait_for_frames(&handle, already_sent + 2).await;

        let frames = handle.get_written_frames();
        let latest = decode_written(frames.last().unwrap());
        assert_eq!(latest[channels::ARM], 2047);
        assert_eq!(latest[channels::THROTTLE], 1200);
        assert!(engine.get_status().armed);

        engine.stop_link().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_link_sends_failsafe_frame_and_closes() {
        let (engine, handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();

        engine.arm().unwrap();
        let mut values = [1024u16; 16];
        values[channels::ROLL] = 1500;
        values[channels::PITCH] = 1500;
        values[channels::THROTTLE] = 1800;
        values[channels::ARM] = 0;
        engine.set_channels(&values).unwrap();
        wait_for_frames(&handle, 2).await;

        engine.stop_link().await.unwrap();

        let frames = handle.get_written_frames();
        let last = decode_written(frames.last().unwrap());
        assert_eq!(last[channels::THROTTLE], 0);
        assert_eq!(last[channels::ARM], 1024);
        assert_eq!(last[channels::ROLL], 1500);

        assert!(handle.is_closed());
        assert_eq!(engine.state(), LinkState::Closed);
        assert_eq!(engine.counters().frames_sent(), frames.len() as u64);

        let status = engine.get_status();
        assert!(!status.connected);
        assert!(!status.armed);
    }

    #[tokio::test]
    async fn test_commands_while_closed_are_rejected() {
        let (engine, _handle) = connected_engine();

        assert!(matches!(engine.arm(), Err(CrsfLinkError::NotConnected)));
        assert!(matches!(engine.disarm(), Err(CrsfLinkError::NotConnected)));
        assert!(matches!(engine.reset_controls(), Err(CrsfLinkError::NotConnected)));
        assert!(matches!(engine.set_channels(&[1024; 16]), Err(CrsfLinkError::NotConnected)));
        assert!(matches!(engine.set_channel(0, 1024), Err(CrsfLinkError::NotConnected)));
        assert!(matches!(engine.stop_link().await, Err(CrsfLinkError::NotConnected)));
        assert!(!engine.get_status().armed);
    }

    #[tokio::test]
    async fn test_set_channels_wrong_count_applies_nothing() {
        let (engine, _handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();
        let before = engine.get_status().channels;

        let result = engine.set_channels(&[2000; 8]);

        assert!(matches!(result, Err(CrsfLinkError::InvalidChannelCount(8))));
        assert_eq!(engine.get_status().channels, before);

        engine.stop_link().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_link_twice_is_rejected() {
        let (engine, _handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();

        let result = engine.start_link(&SerialConfig::default()).await;
        assert!(matches!(result, Err(CrsfLinkError::AlreadyRunning)));

        engine.stop_link().await.unwrap();
    }

    #[tokio::test]
    async fn test_open_failure_leaves_engine_closed() {
        let engine = engine_with(MockOpener::failing("no such device"));

        let result = engine.start_link(&SerialConfig::default()).await;

        match result {
            Err(CrsfLinkError::Transport(msg)) => assert!(msg.contains("no such device")),
            other => panic!("Expected Transport error, got: {:?}", other),
        }
        assert_eq!(engine.state(), LinkState::Closed);
        assert!(matches!(engine.arm(), Err(CrsfLinkError::NotConnected)));
    }

    #[tokio::test]
    async fn test_write_failure_closes_link() {
        let (engine, handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();
        engine.arm().unwrap();
        wait_for_frames(&handle, 1).await;

        handle.set_write_error();
        timeout(Duration::from_secs(2), engine.wait_closed())
            .await
            .expect("link did not close after write failure");

        assert_eq!(engine.state(), LinkState::Closed);
        assert!(!engine.get_status().armed);
        assert!(handle.is_closed());
        assert!(matches!(engine.set_channels(&[1024; 16]), Err(CrsfLinkError::NotConnected)));

        let result = engine.stop_link().await;
        assert!(matches!(result, Err(CrsfLinkError::Transport(_))));
    }

    #[tokio::test]
    async fn test_read_failure_sends_failsafe_and_closes() {
        let (engine, handle) = connected_engine();
        engine.start_link(&SerialConfig::default()).await.unwrap();
        engine.arm().unwrap();
        engine.set_channel(channels::THROTTLE, 1600).unwrap();
        wait_for_frames(&handle, 2).await;

        handle.set_read_error();
        timeout(Duration::from_secs(2), engine.wait_closed())
            .await
            .expect("link did not close after read failure");
        assert!(matches!(engine.arm(), Err(CrsfLinkError::NotConnected)));

        match engine.stop_link().await {
            Err(CrsfLinkError::Transport(msg)) => assert!(msg.contains("read")),
            other => panic!("Expected Transport error, got: {:?}", other),
        }

        let frames = handle.get_written_frames();
        let last = decode_written(frames.last().unwrap());
        assert_eq!(last[channels::THROTTLE], 0);
        assert_eq!(last[channels::ARM], 1024);
        assert!(handle.is_closed());
        assert_eq!(engine.state(), LinkState::Closed);
        assert!(!engine.get_status().armed);
    }

    #[tokio::test]
    async fn test_stop_link_aborts_stalled_receiver() {
        let (opener, handle) = MockOpener::connected();
        let engine = LinkEngine::with_opener(
            Arc::new(opener),
            CrsfConfig::default(),
            LinkConfig { join_timeout_ms: 50 },
        );
        handle.stall_reads();
        engine.start_link(&SerialConfig::default()).await.unwrap();
        wait_for_frames(&handle, 1).await;

        timeout(Duration::from_secs(2), engine.stop_link())
            .await
            .expect("stop_link hung on a stalled receiver")
            .unwrap();

        assert_eq!(engine.state(), LinkState::Closed);
        let frames = handle.get_written_frames();
        let last = decode_written(frames.last().unwrap());
        assert_eq!(last[channels::THROTTLE], 0);
        assert_eq!(last[channels::ARM], 1024);
        assert!(handle.is_closed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_arm_racing_stop_never_leaves_link_armed() {
        let mut armed_after_close = 0;

        for _ in 0..100 {
            let (engine, _handle) = connected_engine();
            let engine = Arc::new(engine);
            let done = Arc::new(AtomicBool::new(false));

            let commands = {
                let engine = Arc::clone(&engine);
                let done = Arc::clone(&done);
                std::thread::spawn(move || {
                    while !done.load(Ordering::SeqCst) {
                        let _ = engine.arm();
                        let _ = engine.set_channel(channels::THROTTLE, 1800);
                    }
                })
            };

            engine.start_link(&SerialConfig::default()).await.unwrap();
            engine.stop_link().await.unwrap();
            done.store(true, Ordering::SeqCst);
            commands.join().unwrap();

            assert_eq!(engine.state(), LinkState::Closed);
            let status = engine.get_status();
            if status.armed
                || status.channels[channels::ARM] != 1024
                || status.channels[channels::THROTTLE] != 0
            {
                armed_after_close += 1;
            }
        }

        assert_eq!(armed_after_close, 0);
    }

    #[tokio::test]
    async fn test_restart_after_fault_resets_channels() {
        let (opener, handle) = MockOpener::connected();
        let engine = engine_with(opener);
        engine.start_link(&SerialConfig::default()).await.unwrap();
        engine.set_channel(channels::ROLL, 200).unwrap();

        handle.set_write_error();
        timeout(Duration::from_secs(2), engine.wait_closed()).await.unwrap();

        // The mock opener hands out a single transport
        let result = engine.start_link(&SerialConfig::default()).await;
        assert!(matches!(result, Err(CrsfLinkError::Transport(_))));
        assert_eq!(engine.get_status().channels, safe_default_channels());
    }

    #[tokio::test]
    async fn test_receiver_notifies_observers_and_counts_mismatches() {
        let (engine, handle) = connected_engine();

        let link_stats = build_frame(
            CRSF_ADDRESS_FLIGHT_CONTROLLER,
            CRSF_FRAMETYPE_LINK_STATISTICS,
            &[100, 95, 80, 10, 0, 0, 20, 90, 85, 12],
        )
        .unwrap();
        let battery = build_frame(
            CRSF_ADDRESS_FLIGHT_CONTROLLER,
            CRSF_FRAMETYPE_BATTERY_SENSOR,
            &[0x00, 0xA8, 0x00, 0x0F, 0x00, 0x04, 0xB0, 75],
        )
        .unwrap();
        let mut corrupted = link_stats.clone();
        let last = corrupted.len() - 1;
        corrupted[last] ^= 0x01;

        let mut observer = MockFrameObserver::new();
        observer
            .expect_on_frame()
            .withf(|frame| frame.frame_type == CRSF_FRAMETYPE_LINK_STATISTICS)
            .times(21)
            .return_const(());
        observer
            .expect_on_frame()
            .withf(|frame| frame.frame_type == CRSF_FRAMETYPE_BATTERY_SENSOR)
            .times(1)
            .return_const(());
        engine.add_observer(Arc::new(observer));

        engine.start_link(&SerialConfig::default()).await.unwrap();

        let mut inbound = Vec::new();
        inbound.extend_from_slice(&link_stats);
        inbound.extend_from_slice(&battery);
        inbound.extend_from_slice(&corrupted);
        for _ in 0..20 {
            inbound.extend_from_slice(&link_stats);
        }
        handle.feed(&inbound);

        timeout(Duration::from_secs(2), async {
            while engine.counters().frames_received() < 22 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("receiver did not deliver all frames");

        assert_eq!(engine.counters().checksum_mismatches(), 14);
        assert_eq!(engine.state(), LinkState::Running);

        engine.stop_link().await.unwrap();
    }

    #[tokio::test]
    async fn test_state_transitions_are_published() {
        let (engine, _handle) = connected_engine();
        let mut state_rx = engine.subscribe_state();
        assert_eq!(*state_rx.borrow_and_update(), LinkState::Closed);

        engine.start_link(&SerialConfig::default()).await.unwrap();
        assert_eq!(*state_rx.borrow_and_update(), LinkState::Running);

        engine.stop_link().await.unwrap();
        assert_eq!(*state_rx.borrow_and_update(), LinkState::Closed);
    }

    #[test]
    fn test_log_interval_constant() {
        // At 50Hz, 1000 packets = 20 seconds
        assert_eq!(LOG_INTERVAL_PACKETS, 1000);
    }
}
