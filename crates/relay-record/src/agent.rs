//! The recorder agent.
//!
//! An Agent subscribes to every track of a stream through its own
//! AsyncWriter and feeds units into a segmenter. Segments rotate on
//! duration (at video random-access points) and whenever a track's codec
//! parameters change; `on_segment_create` / `on_segment_complete` fire
//! around every segment. A failed instance is restarted after a short
//! pause, like any other reader would reconnect.

use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use relay_core::dts::DtsExtractor;
use relay_core::{AsyncWriter, Format, MediaKind, Payload, Stream, Unit};
use relay_rtp::{h264, h265};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::muxer::{LengthDelimitedMuxer, SampleMuxer};
use crate::path_template;

/// Output container of the recorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordFormat {
    Fmp4,
    MpegTs,
}

impl RecordFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            RecordFormat::Fmp4 => "mp4",
            RecordFormat::MpegTs => "ts",
        }
    }
}

/// Hook invoked with the path of a segment file.
pub type SegmentHook = Arc<dyn Fn(&std::path::Path) + Send + Sync>;

/// Clock source; injectable for tests.
pub type NowFn = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct AgentConfig {
    pub write_queue_size: usize,
    /// Path template without extension (`%path`, `%Y`...`%f`).
    pub record_path: String,
    pub format: RecordFormat,
    pub segment_duration: Duration,
    /// Flush interval within a segment; fMP4 only.
    pub part_duration: Duration,
    pub path_name: String,
    pub on_segment_create: Option<SegmentHook>,
    pub on_segment_complete: Option<SegmentHook>,
    pub now_fn: NowFn,
    pub restart_pause: Duration,
}

impl AgentConfig {
    pub fn new(record_path: String, format: RecordFormat, path_name: String) -> Self {
        Self {
            write_queue_size: 512,
            record_path,
            format,
            segment_duration: Duration::from_secs(3600),
            part_duration: Duration::from_secs(1),
            path_name,
            on_segment_create: None,
            on_segment_complete: None,
            now_fn: Arc::new(Utc::now),
            restart_pause: Duration::from_secs(2),
        }
    }
}

struct TrackInfo {
    format: Format,
    media: usize,
    is_video: bool,
}

struct OpenSegment {
    path: PathBuf,
    start: DateTime<Utc>,
    last_part_flush: DateTime<Utc>,
    writer: BufWriter<File>,
}

struct Segmenter {
    record_path: String,
    path_name: String,
    extension: &'static str,
    segment_duration: Duration,
    part_duration: Option<Duration>,
    on_segment_create: Option<SegmentHook>,
    on_segment_complete: Option<SegmentHook>,
    now_fn: NowFn,
    muxer: Box<dyn SampleMuxer>,
    tracks: Vec<TrackInfo>,
    has_video: bool,
    fingerprints: Vec<u64>,
    dts: Vec<DtsExtractor>,
    current: Option<OpenSegment>,
}

fn params_fingerprint(format: &Format) -> u64 {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let mut hasher = DefaultHasher::new();
    match format {
        Format::H264(f) => {
            let p = f.params();
            p.sps.hash(&mut hasher);
            p.pps.hash(&mut hasher);
        }
        Format::H265(f) => {
            let p = f.params();
            p.vps.hash(&mut hasher);
            p.sps.hash(&mut hasher);
            p.pps.hash(&mut hasher);
        }
        Format::Mpeg4Video(f) => f.config().hash(&mut hasher),
        Format::Mpeg4Audio(f) => f.config().hash(&mut hasher),
        _ => {}
    }
    hasher.finish()
}

fn random_access(unit: &Unit) -> bool {
    match &unit.payload {
        Payload::H264 { au } => au
            .iter()
            .any(|n| !n.is_empty() && h264::nalu_type(n[0]) == h264::NaluType::Idr as u8),
        Payload::H265 { au } => au
            .iter()
            .any(|n| !n.is_empty() && h265::is_key_nalu(h265::nalu_type(n[0]))),
        _ => true,
    }
}

fn payload_bytes(unit: &Unit) -> Option<Vec<u8>> {
    fn delimited(parts: &[bytes::Bytes]) -> Vec<u8> {
        let mut out = Vec::with_capacity(parts.iter().map(|p| 4 + p.len()).sum());
        for part in parts {
            out.extend((part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    match &unit.payload {
        Payload::None => None,
        Payload::H264 { au } => Some(delimited(au)),
        Payload::H265 { au } => Some(delimited(au)),
        Payload::Av1 { tu } => Some(delimited(tu)),
        Payload::Mpeg4Audio { aus } => Some(delimited(aus)),
        Payload::Opus { packets } => Some(delimited(packets)),
        Payload::Mpeg1Audio { frames } | Payload::Ac3 { frames } => Some(delimited(frames)),
        Payload::Vp9 { frame }
        | Payload::Mpeg4Video { frame }
        | Payload::Mpeg1Video { frame }
        | Payload::Mjpeg { frame } => Some(frame.to_vec()),
        Payload::Lpcm { samples } => Some(samples.to_vec()),
    }
}

impl Segmenter {
    fn write_unit(&mut self, track: usize, unit: &Unit) -> std::io::Result<()> {
        let Some(payload) = payload_bytes(unit) else {
            return Ok(());
        };
        if payload.is_empty() {
            return Ok(());
        }

        let now = (self.now_fn)();
        let ra = random_access(unit);
        let switch_point = if self.has_video {
            self.tracks[track].is_video && ra
        } else {
            true
        };

        // Parameter change: close the segment so the next one re-declares
        // the track configuration.
        let fp = params_fingerprint(&self.tracks[track].format);
        if fp != self.fingerprints[track] {
            self.fingerprints[track] = fp;
            if self.current.is_some() {
                debug!("track parameters changed, rotating segment");
                self.close_current()?;
            }
        }

        match &self.current {
            None => {
                // Segments begin at a switch point.
                if !switch_point {
                    return Ok(());
                }
                self.open_segment(now)?;
            }
            Some(segment) => {
                let elapsed = (now - segment.start)
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                if switch_point && elapsed >= self.segment_duration {
                    self.close_current()?;
                    self.open_segment(now)?;
                }
            }
        }

        let dts = self.dts[track].extract(unit.pts);
        let muxer = &mut self.muxer;
        let Some(segment) = self.current.as_mut() else {
            return Ok(());
        };
        muxer.write_sample(&mut segment.writer, track as u32, dts, ra, &payload)?;

        if let Some(part_duration) = self.part_duration {
            let since_flush = (now - segment.last_part_flush)
                .to_std()
                .unwrap_or(Duration::ZERO);
            if since_flush >= part_duration {
                segment.writer.flush()?;
                segment.last_part_flush = now;
            }
        }

        Ok(())
    }

    fn open_segment(&mut self, now: DateTime<Utc>) -> std::io::Result<()> {
        let mut path = path_template::render(&self.record_path, &self.path_name, now);
        path.push('.');
        path.push_str(self.extension);
        let path = PathBuf::from(path);

        if let Some(parent) = path.parent() {
            create_dir_all(parent)?;
        }
        let mut writer = BufWriter::new(File::create(&path)?);
        self.muxer.write_header(&mut writer, self.tracks.len())?;

        info!("creating segment {}", path.display());
        if let Some(hook) = &self.on_segment_create {
            hook(&path);
        }

        self.current = Some(OpenSegment {
            path,
            start: now,
            last_part_flush: now,
            writer,
        });
        Ok(())
    }

    fn close_current(&mut self) -> std::io::Result<()> {
        if let Some(mut segment) = self.current.take() {
            self.muxer.write_trailer(&mut segment.writer)?;
            segment.writer.flush()?;

            info!("closing segment {}", segment.path.display());
            if let Some(hook) = &self.on_segment_complete {
                hook(&segment.path);
            }
        }
        Ok(())
    }
}

struct AgentInstance {
    writer: Arc<AsyncWriter>,
    segmenter: Arc<Mutex<Segmenter>>,
    stream: Arc<Stream>,
}

impl AgentInstance {
    fn start(config: &AgentConfig, stream: &Arc<Stream>) -> Self {
        let mut tracks = Vec::new();
        for (media_index, media) in stream.desc().medias.iter().enumerate() {
            for format in &media.formats {
                tracks.push(TrackInfo {
                    format: format.clone(),
                    media: media_index,
                    is_video: media.kind == MediaKind::Video,
                });
            }
        }

        let has_video = tracks.iter().any(|t| t.is_video);
        let fingerprints = tracks.iter().map(|t| params_fingerprint(&t.format)).collect();
        let dts = tracks.iter().map(|_| DtsExtractor::new()).collect();

        let segmenter = Arc::new(Mutex::new(Segmenter {
            record_path: config.record_path.clone(),
            path_name: config.path_name.clone(),
            extension: config.format.extension(),
            segment_duration: config.segment_duration,
            part_duration: match config.format {
                RecordFormat::Fmp4 => Some(config.part_duration),
                RecordFormat::MpegTs => None,
            },
            on_segment_create: config.on_segment_create.clone(),
            on_segment_complete: config.on_segment_complete.clone(),
            now_fn: config.now_fn.clone(),
            muxer: Box::new(LengthDelimitedMuxer::default()),
            tracks,
            has_video,
            fingerprints,
            dts,
            current: None,
        }));

        let writer = AsyncWriter::new(config.write_queue_size);
        writer.start();

        {
            let seg = segmenter.lock().unwrap();
            for (track, info) in seg.tracks.iter().enumerate() {
                let segmenter = segmenter.clone();
                let payload_type = info.format.payload_type();
                // a reader registration can only fail for unknown tracks,
                // which were enumerated from the same description
                let _ = stream.add_reader(
                    &writer,
                    info.media,
                    payload_type,
                    true,
                    Arc::new(move |unit: Arc<Unit>| {
                        segmenter
                            .lock()
                            .unwrap()
                            .write_unit(track, &unit)
                            .map_err(|e| e.into())
                    }),
                );
            }
        }

        Self {
            writer,
            segmenter,
            stream: stream.clone(),
        }
    }

    async fn stop(self) {
        self.stream.remove_reader(self.writer.id());
        self.writer.stop().await;
        if let Err(err) = self.segmenter.lock().unwrap().close_current() {
            warn!("error while closing segment: {err}");
        }
    }
}

/// Long-lived recorder attached to one stream.
pub struct Agent {
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Agent {
    /// Start recording. The first instance is created synchronously so
    /// no unit published after this call is missed.
    pub fn new(config: AgentConfig, stream: Arc<Stream>) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        info!("recording to {}", config.record_path);
        let first = AgentInstance::start(&config, &stream);

        let handle = tokio::spawn(async move {
            let mut instance = first;
            loop {
                let mut error_rx = instance.writer.error();
                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        instance.stop().await;
                        info!("recording stopped");
                        return;
                    }
                    _ = error_rx.changed() => {
                        let err = error_rx.borrow().clone();
                        if let Some(err) = err {
                            warn!("recording error: {err}");
                        }
                        instance.stop().await;
                    }
                }

                tokio::select! {
                    _ = task_cancel.cancelled() => {
                        info!("recording stopped");
                        return;
                    }
                    _ = tokio::time::sleep(config.restart_pause) => {}
                }

                instance = AgentInstance::start(&config, &stream);
            }
        });

        Self {
            cancel,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stop recording and close the current segment.
    pub async fn close(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::TimeZone;
    use relay_core::format::H264Format;
    use relay_core::{Media, SessionDescription, TracingLogger};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    fn h264_stream() -> (Arc<Stream>, Arc<H264Format>) {
        let format = Arc::new(H264Format::new(
            96,
            1,
            Some(Bytes::from_static(&[0x67, 1, 2])),
            Some(Bytes::from_static(&[0x68, 3])),
        ));
        let stream = Arc::new(Stream::new(
            1472,
            SessionDescription::new(vec![Media {
                kind: MediaKind::Video,
                formats: vec![Format::H264(format.clone())],
            }]),
            true,
            Arc::new(AtomicU64::new(0)),
            Arc::new(TracingLogger),
        ));
        (stream, format)
    }

    fn key_frame_unit(pts: i64) -> Unit {
        Unit {
            ntp: Utc::now(),
            pts,
            rtp_packets: Vec::new(),
            payload: Payload::H264 {
                au: vec![Bytes::from_static(&[0x65, 0xAA])],
            },
        }
    }

    fn fixed_clock(base: DateTime<Utc>, step: Duration) -> NowFn {
        let calls = AtomicUsize::new(0);
        Arc::new(move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) as i32;
            base + chrono::Duration::from_std(step).unwrap() * n
        })
    }

    #[tokio::test]
    async fn segments_rotate_on_duration_and_fire_hooks() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());

        let (stream, _format) = h264_stream();
        let base = Utc.with_ymd_and_hms(2009, 5, 20, 22, 15, 25).unwrap();

        let created = Arc::new(Mutex::new(Vec::new()));
        let completed = Arc::new(AtomicUsize::new(0));

        let mut config = AgentConfig::new(template, RecordFormat::Fmp4, "mypath".to_string());
        config.segment_duration = Duration::from_secs(1);
        config.part_duration = Duration::from_millis(100);
        config.now_fn = fixed_clock(base, Duration::from_secs(2));
        let created_hook = created.clone();
        config.on_segment_create = Some(Arc::new(move |p| {
            created_hook.lock().unwrap().push(p.to_path_buf());
        }));
        let completed_hook = completed.clone();
        config.on_segment_complete = Some(Arc::new(move |_| {
            completed_hook.fetch_add(1, Ordering::SeqCst);
        }));

        let agent = Agent::new(config, stream.clone());

        for i in 0..3 {
            stream
                .write_unit(0, 96, key_frame_unit(i * 1_000_000_000))
                .unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        agent.close().await;

        // Every unit opened its own segment: the clock advances two
        // seconds per call and the segment duration is one second.
        let created = created.lock().unwrap().clone();
        assert_eq!(created.len(), 3);
        assert_eq!(completed.load(Ordering::SeqCst), 3);

        for (i, path) in created.iter().enumerate() {
            let ts = base + chrono::Duration::seconds(2 * i as i64);
            let expected = format!(
                "{}/mypath/{}.mp4",
                dir.path().display(),
                crate::path_template::render("%Y-%m-%d_%H-%M-%S-%f", "mypath", ts)
            );
            assert_eq!(path, &PathBuf::from(expected));
            assert!(path.exists());
        }
    }

    #[tokio::test]
    async fn parameter_change_rotates_the_segment() {
        let dir = tempfile::tempdir().unwrap();
        let template = format!("{}/%path/%Y-%m-%d_%H-%M-%S-%f", dir.path().display());

        let (stream, format) = h264_stream();
        let base = Utc.with_ymd_and_hms(2009, 5, 20, 22, 15, 25).unwrap();

        let created = Arc::new(AtomicUsize::new(0));

        let mut config = AgentConfig::new(template, RecordFormat::Fmp4, "mypath".to_string());
        config.segment_duration = Duration::from_secs(3600);
        config.now_fn = fixed_clock(base, Duration::from_millis(10));
        let created_hook = created.clone();
        config.on_segment_create = Some(Arc::new(move |_| {
            created_hook.fetch_add(1, Ordering::SeqCst);
        }));

        let agent = Agent::new(config, stream.clone());

        stream.write_unit(0, 96, key_frame_unit(0)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        // New sequence parameters mid-stream force a new segment.
        format.set_params(
            Some(Bytes::from_static(&[0x67, 9, 9])),
            Some(Bytes::from_static(&[0x68, 9])),
        );
        stream.write_unit(0, 96, key_frame_unit(1_000_000_000)).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        agent.close().await;

        assert_eq!(created.load(Ordering::SeqCst), 2);
    }
}
