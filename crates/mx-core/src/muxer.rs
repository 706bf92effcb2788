//! The media muxer: grabs raw chunks from the active source, shapes them
//! on the grab path, queues them through a bounded FIFO and re-encodes
//! them on a dedicated task that fans the packets out to the registered
//! sinks.
//!
//! Locking order is grab lock first, then the source registry. The grab
//! lock is never held while waiting on the encoder queue, so a slow
//! encoder can never stall device control.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::BytesMut;
use mx_codec::{
    EncodedPacket, EncoderFactory, EncoderSession, Frame, StreamDescriptor, StreamParams,
    audio_output_layout, is_planar,
};
use mx_source::{DeviceInfo, MediaKind, MediaSource, SourceError};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adapter::{SampleAdapter, VideoAdapter, is_silence};
use crate::error::{MuxerError, Result};
use crate::fifo::{EncoderFifo, FifoEntry, FifoMessage, INPUT_QUEUE_LIMIT};
use crate::prefs::{PreferenceRequest, StreamPreferences};
use crate::registry::SourceRegistry;
use crate::sinks::{MediaSink, PacketStats, SinkSet};
use crate::throttle::FrameRateThrottle;
use crate::transform;

/// Encoder frame rate bounds; device rates outside this window are
/// clamped before the encoder comes up.
pub const MIN_FRAME_RATE: f32 = 5.0;
pub const MAX_FRAME_RATE: f32 = 29.97;

const DEFAULT_FRAME_RATE: f32 = 25.0;

/// Default peak threshold below which an s16 frame counts as silence.
pub const DEFAULT_SILENCE_THRESHOLD: i16 = 500;

struct Control {
    open: bool,
    relay_active: bool,
    skip_silence: bool,
    silence_threshold: i16,
    marker: Option<(f32, f32)>,
    hflip: bool,
    vflip: bool,
    grabbing_stopped: bool,
    skipped_silence: u64,
    variable_rate: bool,
}

impl Default for Control {
    fn default() -> Self {
        Self {
            open: false,
            relay_active: false,
            skip_silence: false,
            silence_threshold: DEFAULT_SILENCE_THRESHOLD,
            marker: None,
            hflip: false,
            vflip: false,
            grabbing_stopped: false,
            skipped_silence: 0,
            variable_rate: false,
        }
    }
}

/// Everything the encoding task mutates. Also serves as the seek lock:
/// whoever holds it may rewrite timing state.
struct EncoderState {
    session: Option<Box<dyn EncoderSession>>,
    video: Option<VideoAdapter>,
    audio: Option<SampleAdapter>,
    fps: f32,
    out_rate: u32,
    frame_index: u64,
    last_input_ts: u64,
    last_pts: i64,
    /// Wall-clock reference of the first relayed frame, variable-rate
    /// mode only.
    session_start_wall_us: Option<u64>,
}

impl Default for EncoderState {
    fn default() -> Self {
        Self {
            session: None,
            video: None,
            audio: None,
            fps: DEFAULT_FRAME_RATE,
            out_rate: 0,
            frame_index: 0,
            last_input_ts: 0,
            last_pts: -1,
            session_start_wall_us: None,
        }
    }
}

pub struct MediaMuxer {
    kind: MediaKind,
    grab: Mutex<()>,
    sources: Mutex<SourceRegistry>,
    throttle: Mutex<FrameRateThrottle>,
    prefs: RwLock<StreamPreferences>,
    task: Mutex<Option<JoinHandle<()>>>,
    seq: AtomicU64,
    fifo_slot: Arc<Mutex<Option<Arc<EncoderFifo>>>>,
    encoder: Arc<Mutex<EncoderState>>,
    sinks: SinkSet,
    control: Arc<RwLock<Control>>,
}

impl MediaMuxer {
    pub fn new(kind: MediaKind) -> Self {
        let prefs = match kind {
            MediaKind::Video => StreamPreferences::video_defaults(),
            MediaKind::Audio => StreamPreferences::audio_defaults(),
        };
        Self {
            kind,
            grab: Mutex::new(()),
            sources: Mutex::new(SourceRegistry::new()),
            throttle: Mutex::new(FrameRateThrottle::new()),
            prefs: RwLock::new(prefs),
            task: Mutex::new(None),
            seq: AtomicU64::new(0),
            fifo_slot: Arc::new(Mutex::new(None)),
            encoder: Arc::new(Mutex::new(EncoderState::default())),
            sinks: SinkSet::new(),
            control: Arc::new(RwLock::new(Control::default())),
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    // ---- sources -------------------------------------------------------

    pub async fn register_source(&self, source: Box<dyn MediaSource>) -> bool {
        self.sources.lock().await.register(source)
    }

    pub async fn unregister_source(&self, device: &str) -> bool {
        let mut sources = self.sources.lock().await;
        match sources.unregister(device) {
            Some(mut source) => {
                if source.is_open()
                    && let Err(err) = source.close()
                {
                    warn!(%err, "failed to close unregistered source");
                }
                true
            }
            None => false,
        }
    }

    /// Drop file-backed sources that are no longer active.
    pub async fn drop_inactive_file_sources(&self) -> usize {
        self.sources.lock().await.drop_file_sources()
    }

    pub async fn devices(&self) -> Vec<DeviceInfo> {
        self.sources.lock().await.devices(self.kind)
    }

    pub async fn current_device(&self) -> Option<String> {
        self.sources.lock().await.current().map(|s| s.current_device())
    }

    /// Switch to the source serving `device`. Returns whether a switch
    /// happened; when nobody serves the device, or the new source fails
    /// to open, the previous source keeps running.
    pub async fn select_device(&self, device: &str) -> Result<bool> {
        self.stop_grabbing().await;
        let _grab = self.grab.lock().await;
        let was_open = self.control.read().await.open;
        let prefs = self.prefs.read().await.clone();
        let mut sources = self.sources.lock().await;

        let previous = sources.current_index();
        let mut switched = false;

        for target in sources.candidates(device, self.kind) {
            if Some(target) == previous {
                // already serving the device
                break;
            }
            if let Some(prev) = previous
                && let Some(source) = sources.get_mut(prev)
                && source.is_open()
                && let Err(err) = source.close()
            {
                warn!(%err, "failed to close previous grab device");
            }
            let opened = if was_open {
                match sources.get_mut(target) {
                    Some(source) => match open_source(source, self.kind, &prefs, prefs.resolution) {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(device, %err, "candidate grab device failed to open");
                            false
                        }
                    },
                    None => false,
                }
            } else {
                true
            };
            if opened {
                if let Some(prev) = previous {
                    sources.transfer_filters(prev, target);
                }
                sources.set_current(Some(target));
                switched = true;
                break;
            }
        }

        // restore or re-arm whichever source ends up active; the source
        // stop latch only clears on close, so a latched source is cycled
        // even when the muxer itself is closed
        if let Some(source) = sources.current() {
            if source.is_grabbing_stopped()
                && let Err(err) = source.close()
            {
                warn!(%err, "failed to cycle grab device");
            }
            if was_open
                && !source.is_open()
                && let Err(err) = open_source(source, self.kind, &prefs, prefs.resolution)
            {
                return Err(MuxerError::OpenFailed(err.to_string()));
            }
        }
        self.control.write().await.grabbing_stopped = false;
        drop(sources);

        if switched {
            self.reset_encoder_buffers().await;
            info!(device, "switched media source");
        }
        Ok(switched)
    }

    // ---- lifecycle -----------------------------------------------------

    /// Open the active source and bring up the encoder per the current
    /// stream preferences.
    pub async fn open(&self) -> Result<()> {
        if self.control.read().await.open {
            return Err(MuxerError::AlreadyOpen);
        }
        let prefs = self.prefs.read().await.clone();
        // preferences only vet codec support, not the media type
        if (self.kind == MediaKind::Video) != prefs.codec.is_video() {
            return Err(MuxerError::UnsupportedCodec(prefs.codec));
        }
        let _grab = self.grab.lock().await;
        let mut sources = self.sources.lock().await;
        let source = sources.current().ok_or(MuxerError::NoSource)?;

        open_source(source, self.kind, &prefs, prefs.resolution)
            .map_err(|err| MuxerError::OpenFailed(err.to_string()))?;

        let descriptor = match self.kind {
            MediaKind::Video => {
                let native = source.frame_rate();
                let capped = prefs.max_frame_rate.map_or(native, |cap| native.min(cap));
                let fps = capped.clamp(MIN_FRAME_RATE, MAX_FRAME_RATE);
                StreamDescriptor {
                    codec: prefs.codec,
                    quality: prefs.quality,
                    bit_rate: prefs.bit_rate,
                    max_payload: prefs.max_payload,
                    params: StreamParams::Video {
                        width: prefs.resolution.0,
                        height: prefs.resolution.1,
                        fps,
                    },
                    threaded: EncoderFactory::supports_threading(prefs.codec),
                }
            }
            MediaKind::Audio => {
                let (sample_rate, channels) =
                    audio_output_layout(prefs.codec, source.sample_rate(), source.channels());
                StreamDescriptor {
                    codec: prefs.codec,
                    quality: prefs.quality,
                    bit_rate: prefs.bit_rate,
                    max_payload: prefs.max_payload,
                    params: StreamParams::Audio {
                        sample_rate,
                        channels,
                    },
                    threaded: false,
                }
            }
        };

        let session = open_session(&descriptor)?;

        let (video, audio, fps, out_rate) = match descriptor.params {
            StreamParams::Video { width, height, fps } => {
                let (sw, sh) = source.resolution();
                (Some(VideoAdapter::new(sw, sh, width, height)), None, fps, 0)
            }
            StreamParams::Audio {
                sample_rate,
                channels,
            } => {
                let adapter = SampleAdapter::new(
                    source.sample_rate(),
                    source.channels(),
                    sample_rate,
                    channels,
                    session.frame_size(),
                    is_planar(prefs.codec),
                );
                (None, Some(adapter), DEFAULT_FRAME_RATE, sample_rate)
            }
        };

        {
            let mut state = self.encoder.lock().await;
            *state = EncoderState {
                session: Some(session),
                video,
                audio,
                fps,
                out_rate,
                ..EncoderState::default()
            };
        }

        let fifo = Arc::new(EncoderFifo::new(INPUT_QUEUE_LIMIT));
        *self.fifo_slot.lock().await = Some(fifo.clone());

        {
            let mut control = self.control.write().await;
            control.open = true;
            control.grabbing_stopped = false;
            control.skipped_silence = 0;
            control.variable_rate = source.has_variable_frame_rate();
        }
        self.throttle.lock().await.set_limit(prefs.max_frame_rate);

        let task = EncoderTask {
            kind: self.kind,
            fifo,
            fifo_slot: self.fifo_slot.clone(),
            encoder: self.encoder.clone(),
            sinks: self.sinks.clone(),
            control: self.control.clone(),
        };
        *self.task.lock().await = Some(tokio::spawn(task.run()));

        info!(kind = %self.kind, codec = %prefs.codec, "muxer opened");
        Ok(())
    }

    /// Shut down the encoder and close the source. Returns false when the
    /// muxer wasn't open, which keeps close idempotent.
    pub async fn close(&self) -> bool {
        if !self.control.read().await.open {
            debug!(kind = %self.kind, "closing a muxer that wasn't opened");
            return false;
        }
        self.stop_grabbing().await;
        self.control.write().await.open = false;

        let fifo = self.fifo_slot.lock().await.clone();
        if let Some(fifo) = fifo {
            fifo.push(FifoMessage::Shutdown).await;
        }
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }

        // all packet and frame counters start over at the next open
        *self.encoder.lock().await = EncoderState::default();
        self.sinks.reset_stats().await;
        self.control.write().await.skipped_silence = 0;

        let _grab = self.grab.lock().await;
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.current()
            && source.is_open()
            && let Err(err) = source.close()
        {
            warn!(%err, "failed to close grab device");
        }
        info!(kind = %self.kind, "muxer closed");
        true
    }

    pub async fn is_open(&self) -> bool {
        self.control.read().await.open
    }

    /// Close and reopen with the current preferences. Fails on a muxer
    /// that was never opened.
    pub async fn reset(&self) -> Result<()> {
        if !self.close().await {
            return Err(MuxerError::NotOpen);
        }
        self.open().await
    }

    /// Drop everything queued or buffered towards the encoder without
    /// touching the encoder itself.
    pub async fn reset_encoder_buffers(&self) {
        let fifo = self.fifo_slot.lock().await.clone();
        if let Some(fifo) = fifo {
            let dropped = fifo.clear().await;
            if dropped > 0 {
                debug!(dropped, "flushed encoder input queue");
            }
        }
        let mut state = self.encoder.lock().await;
        if let Some(audio) = &mut state.audio {
            audio.clear();
        }
        state.last_input_ts = 0;
    }

    // ---- grab path -----------------------------------------------------

    /// Grab one chunk from the active source, shape it and queue it for
    /// encoding. Returns the grabbed size.
    pub async fn grab(&self) -> Result<usize> {
        self.grab_inner(false).await
    }

    /// Grab and discard one chunk: the device and the throttle reference
    /// advance, but nothing reaches the encoder.
    pub async fn grab_discarding(&self) -> Result<usize> {
        self.grab_inner(true).await
    }

    async fn grab_inner(&self, discard: bool) -> Result<usize> {
        let _grab = self.grab.lock().await;
        let (marker, hflip, vflip, stopped, open, relay) = {
            let c = self.control.read().await;
            (
                c.marker,
                c.hflip,
                c.vflip,
                c.grabbing_stopped,
                c.open,
                c.relay_active,
            )
        };
        if stopped {
            return Err(MuxerError::GrabStopped);
        }

        let mut buf = BytesMut::new();
        let (info, stream_changed, dims) = {
            let mut sources = self.sources.lock().await;
            let source = sources.current().ok_or(MuxerError::NoSource)?;
            let info = source.grab_chunk(&mut buf, discard).map_err(|err| match err {
                SourceError::Stopped => MuxerError::GrabStopped,
                other => MuxerError::Source(other),
            })?;
            (info, source.has_input_stream_changed(), source.resolution())
        };

        if stream_changed {
            debug!("input stream changed, dropping buffered media");
            self.reset_encoder_buffers().await;
        }

        // flips apply to the grabbed picture whether or not it is relayed
        let (w, h) = dims;
        if self.kind == MediaKind::Video {
            if vflip {
                transform::flip_vertical(&mut buf, w, h);
            }
            if hflip {
                transform::flip_horizontal(&mut buf, w, h);
            }
        }
        if !open {
            return Ok(info.size);
        }

        let mut admit = !discard && info.size > 0;
        if self.kind == MediaKind::Video
            && let Some((x, y)) = marker
        {
            transform::draw_marker(&mut buf, w, h, x, y);
        }
        // advances the rate reference even for chunks dropped elsewhere
        if !self.throttle.lock().await.admit() {
            admit = false;
        }
        if admit && (!relay || self.sinks.count().await == 0) {
            admit = false;
        }
        if !admit {
            return Ok(info.size);
        }

        let entry = FifoEntry {
            data: buf.freeze(),
            captured_at_us: info.captured_at_us,
            wall_clock_us: info.wall_clock_us,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        };
        let fifo = self.fifo_slot.lock().await.clone();
        if let Some(fifo) = fifo {
            fifo.push(FifoMessage::Chunk(entry)).await;
        }
        Ok(info.size)
    }

    /// Stop the grab loop; subsequent grabs fail until the muxer is
    /// reopened or the device is reselected.
    pub async fn stop_grabbing(&self) {
        self.control.write().await.grabbing_stopped = true;
        let mut sources = self.sources.lock().await;
        if let Some(source) = sources.current() {
            source.stop_grabbing();
        }
    }

    /// Change the capture resolution without touching the output stream;
    /// the encoder keeps its negotiated resolution and the adapter bridges
    /// the difference.
    pub async fn set_video_grab_resolution(&self, width: u32, height: u32) -> Result<()> {
        if self.kind != MediaKind::Video {
            return Err(MuxerError::Source(SourceError::Unsupported(
                "grab resolution",
            )));
        }
        self.stop_grabbing().await;
        let _grab = self.grab.lock().await;
        let was_open = self.control.read().await.open;
        let prefs = self.prefs.read().await.clone();

        let grab_dims = {
            let mut sources = self.sources.lock().await;
            let source = sources.current().ok_or(MuxerError::NoSource)?;
            // closing also clears the source stop latch
            if (source.is_open() || source.is_grabbing_stopped())
                && let Err(err) = source.close()
            {
                warn!(%err, "failed to close grab device for resize");
            }
            source.set_resolution(width, height);
            if was_open {
                open_source(source, self.kind, &prefs, (width, height))
                    .map_err(|err| MuxerError::OpenFailed(err.to_string()))?;
            }
            source.resolution()
        };
        self.control.write().await.grabbing_stopped = false;

        let mut state = self.encoder.lock().await;
        let stream_dims = state.session.as_ref().and_then(|s| match s.descriptor().params {
            StreamParams::Video { width, height, .. } => Some((width, height)),
            _ => None,
        });
        if let Some((dw, dh)) = stream_dims {
            state.video = Some(VideoAdapter::new(grab_dims.0, grab_dims.1, dw, dh));
        }
        drop(state);

        self.reset_encoder_buffers().await;
        info!(width, height, "changed grab resolution");
        Ok(())
    }

    // ---- stream control ------------------------------------------------

    /// Forward a seek to the source and drop everything buffered since.
    pub async fn seek(&self, seconds: f32) -> Result<()> {
        let _grab = self.grab.lock().await;
        {
            let mut sources = self.sources.lock().await;
            let source = sources.current().ok_or(MuxerError::NoSource)?;
            source.seek(seconds)?;
        }
        self.reset_encoder_buffers().await;
        Ok(())
    }

    pub async fn seek_pos(&self) -> f32 {
        self.sources
            .lock()
            .await
            .current()
            .map_or(0.0, |s| s.seek_pos())
    }

    pub async fn seek_end(&self) -> f32 {
        self.sources
            .lock()
            .await
            .current()
            .map_or(0.0, |s| s.seek_end())
    }

    pub async fn supports_seeking(&self) -> bool {
        self.sources
            .lock()
            .await
            .current()
            .is_some_and(|s| s.supports_seeking())
    }

    pub async fn time_shift(&self, offset_us: i64) -> Result<()> {
        let _grab = self.grab.lock().await;
        {
            let mut sources = self.sources.lock().await;
            let source = sources.current().ok_or(MuxerError::NoSource)?;
            source.time_shift(offset_us)?;
        }
        self.reset_encoder_buffers().await;
        Ok(())
    }

    pub async fn input_streams(&self) -> Vec<String> {
        self.sources
            .lock()
            .await
            .current()
            .map_or_else(Vec::new, |s| s.input_streams())
    }

    pub async fn select_input_stream(&self, index: usize) -> Result<()> {
        let _grab = self.grab.lock().await;
        {
            let mut sources = self.sources.lock().await;
            let source = sources.current().ok_or(MuxerError::NoSource)?;
            source.select_input_stream(index)?;
        }
        self.reset_encoder_buffers().await;
        Ok(())
    }

    // ---- preferences ---------------------------------------------------

    /// Apply new output preferences. With `reset` set and the muxer open,
    /// the encoder is restarted so they take effect immediately.
    pub async fn set_stream_preferences(&self, request: &PreferenceRequest) -> bool {
        let changed = self.prefs.write().await.apply(request);
        if changed {
            self.throttle.lock().await.set_limit(request.max_frame_rate);
            if request.reset && self.is_open().await {
                if let Err(err) = self.reset().await {
                    warn!(%err, "failed to restart encoder with new preferences");
                }
            }
        }
        changed
    }

    pub async fn stream_preferences(&self) -> StreamPreferences {
        self.prefs.read().await.clone()
    }

    // ---- sinks ---------------------------------------------------------

    pub async fn add_sink(&self, sink: Arc<dyn MediaSink>) {
        self.sinks.add(sink).await;
    }

    pub async fn remove_sink(&self, sink: &Arc<dyn MediaSink>) -> bool {
        self.sinks.remove(sink).await
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.count().await
    }

    pub async fn packet_stats(&self) -> PacketStats {
        self.sinks.stats().await
    }

    // ---- knobs and stats -----------------------------------------------

    pub async fn set_relay_active(&self, active: bool) {
        self.control.write().await.relay_active = active;
    }

    pub async fn set_flipping(&self, horizontal: bool, vertical: bool) {
        let mut control = self.control.write().await;
        control.hflip = horizontal;
        control.vflip = vertical;
    }

    /// Show or hide the burned-in pointer marker; position in percent of
    /// the picture dimensions.
    pub async fn set_marker(&self, position: Option<(f32, f32)>) {
        self.control.write().await.marker = position;
    }

    pub async fn set_silence_skip(&self, enabled: bool) {
        self.control.write().await.skip_silence = enabled;
    }

    pub async fn set_silence_threshold(&self, threshold: i16) {
        self.control.write().await.silence_threshold = threshold;
    }

    /// Silent audio frames dropped since the muxer was opened.
    pub async fn skipped_silence_frames(&self) -> u64 {
        self.control.read().await.skipped_silence
    }

    pub async fn fifo_usage(&self) -> (usize, usize) {
        match self.fifo_slot.lock().await.clone() {
            Some(fifo) => (fifo.len().await, fifo.capacity()),
            None => (0, 0),
        }
    }

    /// Audio samples per channel sitting in the channel adapter.
    pub async fn buffered_audio_samples(&self) -> usize {
        self.encoder
            .lock()
            .await
            .audio
            .as_ref()
            .map_or(0, |a| a.buffered_samples())
    }
}

fn open_source(
    source: &mut dyn MediaSource,
    kind: MediaKind,
    prefs: &StreamPreferences,
    grab_resolution: (u32, u32),
) -> mx_source::Result<()> {
    match kind {
        MediaKind::Video => source.open_video(
            grab_resolution.0,
            grab_resolution.1,
            prefs.max_frame_rate.unwrap_or(DEFAULT_FRAME_RATE),
        ),
        MediaKind::Audio => {
            let (rate, channels) =
                audio_output_layout(prefs.codec, source.sample_rate(), source.channels());
            source.open_audio(rate, channels)
        }
    }
}

/// Open an encoder session, falling back to a single-threaded one when
/// the threaded variant refuses to come up.
fn open_session(descriptor: &StreamDescriptor) -> Result<Box<dyn EncoderSession>> {
    match EncoderFactory::open(descriptor) {
        Ok(session) => Ok(session),
        Err(err) if descriptor.threaded => {
            warn!(codec = %descriptor.codec, %err, "threaded encoder failed, retrying single-threaded");
            let retry = StreamDescriptor {
                threaded: false,
                ..descriptor.clone()
            };
            Ok(EncoderFactory::open(&retry)?)
        }
        Err(err) => Err(err.into()),
    }
}

struct EncoderTask {
    kind: MediaKind,
    fifo: Arc<EncoderFifo>,
    fifo_slot: Arc<Mutex<Option<Arc<EncoderFifo>>>>,
    encoder: Arc<Mutex<EncoderState>>,
    sinks: SinkSet,
    control: Arc<RwLock<Control>>,
}

impl EncoderTask {
    async fn run(self) {
        debug!(kind = %self.kind, "encoding task started");
        loop {
            let entry = match self.fifo.pop().await {
                FifoMessage::Shutdown => break,
                FifoMessage::Chunk(entry) => entry,
            };

            {
                let mut state = self.encoder.lock().await;
                if entry.captured_at_us < state.last_input_ts {
                    warn!(
                        ts = entry.captured_at_us,
                        last = state.last_input_ts,
                        "capture timestamp went backwards"
                    );
                }
                state.last_input_ts = entry.captured_at_us;
            }

            // nobody listening: the chunk was grabbed for nothing
            if !self.control.read().await.relay_active || self.sinks.count().await == 0 {
                continue;
            }

            match self.kind {
                MediaKind::Video => self.encode_video(entry).await,
                MediaKind::Audio => self.encode_audio(entry).await,
            }

            if self.fifo.near_capacity().await {
                let dropped = self.fifo.clear().await;
                warn!(dropped, "encoder fell behind, flushed input queue");
            }
        }
        self.finish().await;
    }

    async fn encode_video(&self, entry: FifoEntry) {
        let variable_rate = self.control.read().await.variable_rate;

        let mut state = self.encoder.lock().await;
        let Some(video) = &state.video else { return };
        let Some(data) = video.convert(&entry.data) else {
            return;
        };

        let mut pts = if variable_rate {
            let start = *state.session_start_wall_us.get_or_insert(entry.wall_clock_us);
            (entry.wall_clock_us.saturating_sub(start) / 1000) as i64
        } else {
            (state.frame_index as f64 * 1000.0 / f64::from(state.fps)) as i64
        };
        if pts <= state.last_pts {
            debug!(pts, last = state.last_pts, "non-monotonic pts, nudging forward");
            pts = state.last_pts + 1;
        }
        state.last_pts = pts;
        state.frame_index += 1;

        let Some(session) = &mut state.session else {
            return;
        };
        let packets = match session.encode(&Frame { data, pts }) {
            Ok(packets) => packets,
            Err(err) => {
                warn!(%err, "video encode failed, dropping frame");
                return;
            }
        };
        drop(state);

        self.sinks.relay_sync(entry.captured_at_us, pts).await;
        self.relay(&packets).await;
    }

    async fn encode_audio(&self, entry: FifoEntry) {
        let (skip, threshold) = {
            let c = self.control.read().await;
            (c.skip_silence, c.silence_threshold)
        };

        let mut state = self.encoder.lock().await;
        let out_rate = state.out_rate;
        let Some(audio) = &mut state.audio else { return };
        audio.push(&entry.data);

        let mut frames = Vec::new();
        while let Some(frame) = state.audio.as_mut().and_then(|a| a.pop_frame()) {
            frames.push(frame);
        }

        let mut skipped = 0u64;
        let mut outputs: Vec<(u64, i64, Vec<EncodedPacket>)> = Vec::new();
        for data in frames {
            if skip && is_silence(&data, threshold) {
                skipped += 1;
                continue;
            }
            let frame_samples = state.session.as_ref().map_or(0, |s| s.frame_size()) as u64;
            let pts = (state.frame_index * frame_samples) as i64;
            state.frame_index += 1;
            state.last_pts = pts;

            // the sync point refers to media still sitting in the adapter
            let buffered = state.audio.as_ref().map_or(0, |a| a.buffered_samples()) as u64;
            let shift_us = if out_rate > 0 {
                buffered * 1_000_000 / u64::from(out_rate)
            } else {
                0
            };
            let sync_us = entry.captured_at_us.saturating_sub(shift_us);

            let Some(session) = &mut state.session else {
                return;
            };
            match session.encode(&Frame { data, pts }) {
                Ok(packets) => outputs.push((sync_us, pts, packets)),
                Err(err) => warn!(%err, "audio encode failed, dropping frame"),
            }
        }
        drop(state);

        if skipped > 0 {
            self.control.write().await.skipped_silence += skipped;
        }
        for (sync_us, pts, packets) in outputs {
            self.sinks.relay_sync(sync_us, pts).await;
            self.relay(&packets).await;
        }
    }

    async fn relay(&self, packets: &[EncodedPacket]) {
        for packet in packets {
            self.sinks.relay_packet(packet).await;
        }
    }

    async fn finish(&self) {
        let packets = {
            let mut state = self.encoder.lock().await;
            let packets = state.session.as_mut().map(|s| s.flush()).unwrap_or_default();
            state.session = None;
            state.video = None;
            state.audio = None;
            packets
        };
        if self.control.read().await.relay_active {
            self.relay(&packets).await;
        }
        *self.fifo_slot.lock().await = None;
        debug!(kind = %self.kind, "encoding task finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mx_codec::CodecId;
    use mx_source::PatternSource;
    use std::time::Duration;

    #[derive(Default)]
    struct TestSink {
        packets: std::sync::Mutex<Vec<EncodedPacket>>,
        syncs: std::sync::Mutex<Vec<(u64, i64)>>,
    }

    #[async_trait::async_trait]
    impl MediaSink for TestSink {
        async fn on_packet(&self, packet: &EncodedPacket) {
            self.packets.lock().unwrap().push(packet.clone());
        }

        async fn on_sync_point(&self, captured_at_us: u64, presentation_ts: i64) {
            self.syncs.lock().unwrap().push((captured_at_us, presentation_ts));
        }
    }

    /// Sink that holds every packet delivery until a permit is released,
    /// wedging the encoding task on demand.
    struct GatedSink {
        gate: tokio::sync::Semaphore,
        packets: std::sync::Mutex<Vec<EncodedPacket>>,
    }

    #[async_trait::async_trait]
    impl MediaSink for GatedSink {
        async fn on_packet(&self, packet: &EncodedPacket) {
            match self.gate.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return,
            }
            self.packets.lock().unwrap().push(packet.clone());
        }
    }

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn video_muxer() -> (MediaMuxer, Arc<TestSink>) {
        init_tracing();
        let muxer = MediaMuxer::new(MediaKind::Video);
        muxer
            .register_source(Box::new(PatternSource::video()))
            .await;
        let sink = Arc::new(TestSink::default());
        muxer.add_sink(sink.clone()).await;
        muxer.set_relay_active(true).await;
        (muxer, sink)
    }

    #[tokio::test]
    async fn close_reports_whether_it_was_open() {
        let (muxer, _sink) = video_muxer().await;
        assert!(!muxer.close().await);
        muxer.open().await.unwrap();
        assert!(muxer.is_open().await);
        assert!(muxer.close().await);
        assert!(!muxer.close().await);
        assert!(!muxer.is_open().await);
    }

    #[tokio::test]
    async fn opening_twice_fails() {
        let (muxer, _sink) = video_muxer().await;
        muxer.open().await.unwrap();
        assert!(matches!(muxer.open().await, Err(MuxerError::AlreadyOpen)));
        muxer.close().await;
    }

    #[tokio::test]
    async fn video_pipeline_relays_monotonic_packets() {
        let (muxer, sink) = video_muxer().await;
        muxer.open().await.unwrap();
        for _ in 0..5 {
            muxer.grab().await.unwrap();
        }
        wait_for(|| sink.packets.lock().unwrap().len() >= 5).await;

        let packets = sink.packets.lock().unwrap();
        assert!(packets[0].is_keyframe);
        assert!(packets.windows(2).all(|w| w[1].pts > w[0].pts));
        drop(packets);

        let syncs = sink.syncs.lock().unwrap();
        assert!(!syncs.is_empty());
        drop(syncs);
        muxer.close().await;
    }

    /// Wait until the encoder queue has drained.
    async fn drained(muxer: &MediaMuxer) {
        for _ in 0..400 {
            if muxer.fifo_usage().await.0 == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("encoder queue never drained");
    }

    #[tokio::test]
    async fn inactive_relay_discards_chunks() {
        let (muxer, sink) = video_muxer().await;
        muxer.set_relay_active(false).await;
        muxer.open().await.unwrap();
        for _ in 0..3 {
            muxer.grab().await.unwrap();
        }
        drained(&muxer).await;
        muxer.close().await;
        assert_eq!(muxer.packet_stats().await.packets, 0);
        assert!(sink.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stopped_grabbing_is_an_error() {
        let (muxer, _sink) = video_muxer().await;
        muxer.open().await.unwrap();
        muxer.stop_grabbing().await;
        assert!(matches!(muxer.grab().await, Err(MuxerError::GrabStopped)));
        muxer.close().await;
    }

    #[tokio::test]
    async fn silent_audio_frames_are_skipped() {
        let muxer = MediaMuxer::new(MediaKind::Audio);
        muxer
            .register_source(Box::new(
                PatternSource::audio()
                    .with_silence(true)
                    .with_samples_per_chunk(1024),
            ))
            .await;
        let sink = Arc::new(TestSink::default());
        muxer.add_sink(sink.clone()).await;
        muxer.set_relay_active(true).await;
        muxer.set_silence_skip(true).await;

        muxer.open().await.unwrap();
        for _ in 0..5 {
            muxer.grab().await.unwrap();
        }
        drained(&muxer).await;
        let mut skipped = 0;
        for _ in 0..400 {
            skipped = muxer.skipped_silence_frames().await;
            if skipped >= 5 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        muxer.close().await;

        assert!(skipped >= 5, "skipped {skipped}");
        assert!(sink.packets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn threaded_codecs_fall_back_to_single_threaded() {
        let (muxer, _sink) = video_muxer().await;
        let request = PreferenceRequest {
            codec: CodecId::Mpeg4,
            quality: 20,
            bit_rate: None,
            max_packet_size: 500,
            resolution: (352, 288),
            max_frame_rate: None,
            reset: false,
        };
        assert!(muxer.set_stream_preferences(&request).await);
        // the factory claims MPEG-4 threading but the session refuses it;
        // open must succeed through the single-threaded retry
        muxer.open().await.unwrap();
        assert!(muxer.is_open().await);
        muxer.close().await;
    }

    #[tokio::test]
    async fn rejected_preferences_change_nothing() {
        let (muxer, _sink) = video_muxer().await;
        let before = muxer.stream_preferences().await;
        let request = PreferenceRequest {
            codec: CodecId::Aac,
            quality: 90,
            bit_rate: Some(1),
            max_packet_size: 100,
            resolution: (16, 16),
            max_frame_rate: Some(1.0),
            reset: true,
        };
        assert!(!muxer.set_stream_preferences(&request).await);
        assert_eq!(muxer.stream_preferences().await.codec, before.codec);
    }

    #[tokio::test]
    async fn unknown_device_keeps_the_current_source() {
        let muxer = MediaMuxer::new(MediaKind::Video);
        muxer
            .register_source(Box::new(PatternSource::video().with_device_name("camA")))
            .await;
        muxer.open().await.unwrap();

        assert!(!muxer.select_device("camX").await.unwrap());
        assert_eq!(muxer.current_device().await.as_deref(), Some("camA"));
        // the previous source keeps grabbing
        assert!(muxer.grab().await.is_ok());
        muxer.close().await;
    }

    #[tokio::test]
    async fn switches_between_registered_sources() {
        let muxer = MediaMuxer::new(MediaKind::Video);
        muxer
            .register_source(Box::new(PatternSource::video().with_device_name("camA")))
            .await;
        muxer
            .register_source(Box::new(PatternSource::video().with_device_name("camB")))
            .await;
        muxer.open().await.unwrap();

        assert!(muxer.select_device("camB").await.unwrap());
        assert_eq!(muxer.current_device().await.as_deref(), Some("camB"));
        assert!(muxer.grab().await.is_ok());
        muxer.close().await;
    }

    #[tokio::test]
    async fn grab_resolution_changes_rebuild_the_adapter() {
        let (muxer, sink) = video_muxer().await;
        muxer.open().await.unwrap();
        muxer.set_video_grab_resolution(176, 144).await.unwrap();

        muxer.grab().await.unwrap();
        wait_for(|| !sink.packets.lock().unwrap().is_empty()).await;
        muxer.close().await;
    }

    #[tokio::test]
    async fn benign_device_selection_leaves_grabbing_armed() {
        let (muxer, _sink) = video_muxer().await;
        // no switch, and the muxer is not even open yet
        assert!(!muxer.select_device("does-not-exist").await.unwrap());

        muxer.open().await.unwrap();
        assert!(muxer.grab().await.is_ok());
        muxer.close().await;
    }

    #[tokio::test]
    async fn audio_grabs_respect_the_frame_rate_cap() {
        init_tracing();
        let muxer = MediaMuxer::new(MediaKind::Audio);
        muxer
            .register_source(Box::new(PatternSource::audio().with_samples_per_chunk(1024)))
            .await;
        let sink = Arc::new(TestSink::default());
        muxer.add_sink(sink.clone()).await;
        muxer.set_relay_active(true).await;

        let request = PreferenceRequest {
            codec: CodecId::PcmMulaw,
            quality: 20,
            bit_rate: None,
            max_packet_size: 500,
            resolution: (0, 0),
            max_frame_rate: Some(1.0),
            reset: false,
        };
        assert!(muxer.set_stream_preferences(&request).await);
        muxer.open().await.unwrap();

        // well inside the one-second interval, only the first chunk passes
        for _ in 0..3 {
            muxer.grab().await.unwrap();
        }
        drained(&muxer).await;
        muxer.close().await;

        // one 1024-sample chunk at 160 samples per frame
        assert_eq!(sink.packets.lock().unwrap().len(), 1024 / 160);
    }

    #[tokio::test]
    async fn closing_resets_the_packet_counters() {
        let (muxer, sink) = video_muxer().await;
        muxer.open().await.unwrap();
        muxer.grab().await.unwrap();
        wait_for(|| !sink.packets.lock().unwrap().is_empty()).await;
        assert!(muxer.packet_stats().await.packets > 0);

        muxer.close().await;
        assert_eq!(muxer.packet_stats().await.packets, 0);
        assert_eq!(muxer.skipped_silence_frames().await, 0);
    }

    #[tokio::test]
    async fn backlog_is_flushed_when_the_encoder_falls_behind() {
        init_tracing();
        let muxer = MediaMuxer::new(MediaKind::Video);
        muxer
            .register_source(Box::new(PatternSource::video()))
            .await;
        let sink = Arc::new(GatedSink {
            gate: tokio::sync::Semaphore::new(0),
            packets: std::sync::Mutex::new(Vec::new()),
        });
        muxer.add_sink(sink.clone()).await;
        muxer.set_relay_active(true).await;
        muxer.open().await.unwrap();

        // the first chunk wedges the encoding task inside the sink
        muxer.grab().await.unwrap();
        drained(&muxer).await;
        // pile up a backlog past the flush margin
        for _ in 0..13 {
            muxer.grab().await.unwrap();
        }
        assert_eq!(muxer.fifo_usage().await.0, 13);

        sink.gate.add_permits(1000);
        drained(&muxer).await;
        muxer.close().await;

        // everything queued behind the stalled frame was dropped unencoded
        assert_eq!(sink.packets.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn variable_rate_sources_take_pts_from_the_wall_clock() {
        init_tracing();
        let muxer = MediaMuxer::new(MediaKind::Video);
        muxer
            .register_source(Box::new(
                PatternSource::video().with_variable_frame_rate(true),
            ))
            .await;
        let sink = Arc::new(TestSink::default());
        muxer.add_sink(sink.clone()).await;
        muxer.set_relay_active(true).await;
        muxer.open().await.unwrap();

        for i in 0..5 {
            muxer.grab().await.unwrap();
            if i == 2 {
                tokio::time::sleep(Duration::from_millis(40)).await;
            }
        }
        wait_for(|| sink.packets.lock().unwrap().len() >= 5).await;
        muxer.close().await;

        let packets = sink.packets.lock().unwrap();
        // the timeline starts at the first relayed frame
        assert_eq!(packets[0].pts, 0);
        assert!(packets.windows(2).all(|w| w[1].pts > w[0].pts));
        // the pause between grabs shows up in the timeline
        assert!(packets[4].pts >= 30, "pts {}", packets[4].pts);
    }

    #[tokio::test]
    async fn reset_requires_an_open_muxer() {
        let (muxer, _sink) = video_muxer().await;
        assert!(matches!(muxer.reset().await, Err(MuxerError::NotOpen)));
    }

    #[tokio::test]
    async fn audio_codec_on_a_video_muxer_is_rejected() {
        let (muxer, _sink) = video_muxer().await;
        let request = PreferenceRequest {
            codec: CodecId::Gsm,
            quality: 20,
            bit_rate: None,
            max_packet_size: 500,
            resolution: (0, 0),
            max_frame_rate: None,
            reset: false,
        };
        assert!(muxer.set_stream_preferences(&request).await);
        assert!(matches!(
            muxer.open().await,
            Err(MuxerError::UnsupportedCodec(CodecId::Gsm))
        ));
    }
}
