//! Two-thread decoder state machine.
//!
//! A dedicated *feeder* thread pushes coded samples into the codec adapter
//! while the caller's thread (the *retriever*, inside
//! [`DecoderAutomata::get_frames`]) pulls decoded frames out, keeping the
//! ones listed in each segment's `valid_frames` and discarding the rest.
//! The feeder parks on a condition variable between requests; the
//! retriever wakes it when it needs more frames decoded and waits for it
//! to park again before touching segment state.
//!
//! Invariant: segment metadata only changes while the feeder is parked.

use std::sync::atomic::{fence, AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use super::{new_decoder, DecodeError, DecoderKind, EncodedData, FrameInfo, VideoDecoder};

/// Feeder throttles once this many decoded frames are waiting.
const MAX_BUFFERED_FRAMES: usize = 8;

struct Shared {
    decoder: Mutex<Box<dyn VideoDecoder>>,
    /// Swapped wholesale by `initialize` while the feeder is parked; the
    /// feeder clones the `Arc` once per wake.
    segments: Mutex<Arc<Vec<EncodedData>>>,

    park: Mutex<()>,
    wake: Condvar,
    feeder_waiting: AtomicBool,
    not_done: AtomicBool,
    /// Set when the codec was flushed at a segment end; the retriever
    /// drains stale frames before restarting the feeder.
    seeking: AtomicBool,

    frames_to_get: AtomicUsize,
    frames_retrieved: AtomicUsize,

    feeder_data_idx: AtomicUsize,
    feeder_valid_idx: AtomicUsize,
    feeder_current_frame: AtomicI64,
    feeder_next_frame: AtomicI64,
    feeder_next_keyframe: AtomicI64,
    feeder_next_keyframe_idx: AtomicUsize,

    error_set: AtomicBool,
    feeder_error: Mutex<Option<DecodeError>>,
}

impl Shared {
    /// Point the feeder at segment `idx`. Caller must hold the feeder
    /// parked (or be the feeder itself).
    fn set_feeder_idx(&self, idx: usize, segments: &[EncodedData]) {
        self.feeder_data_idx.store(idx, Ordering::Release);
        self.feeder_valid_idx.store(0, Ordering::Release);
        if let Some(segment) = segments.get(idx) {
            self.feeder_current_frame
                .store(segment.keyframes[0] as i64, Ordering::Release);
            self.feeder_next_frame
                .store(segment.valid_frames[0] as i64, Ordering::Release);
            self.feeder_next_keyframe_idx.store(0, Ordering::Release);
            self.feeder_next_keyframe
                .store(segment.keyframes[0] as i64, Ordering::Release);
        }
    }

    fn record_feeder_error(&self, error: DecodeError) {
        *self.feeder_error.lock() = Some(error);
        self.error_set.store(true, Ordering::Release);
    }
}

/// Random-access frame extractor around one codec adapter.
///
/// Built once per decode surface; [`initialize`] arms it with a list of
/// decode segments, then any number of [`get_frames`] calls pull the
/// segments' `valid_frames` in order into caller buffers.
///
/// [`initialize`]: DecoderAutomata::initialize
/// [`get_frames`]: DecoderAutomata::get_frames
pub struct DecoderAutomata {
    shared: Arc<Shared>,
    feeder: Option<thread::JoinHandle<()>>,

    // Retriever-side position; only touched by the caller's thread.
    frame_size: usize,
    current_frame: i64,
    next_frame: i64,
    retriever_data_idx: usize,
    retriever_valid_idx: usize,
}

impl DecoderAutomata {
    /// Create an automaton with a freshly constructed adapter.
    pub fn new(kind: DecoderKind, device: u32, num_devices: u32) -> Result<Self, DecodeError> {
        let decoder = new_decoder(kind, device, num_devices)?;
        Ok(Self::with_decoder(decoder))
    }

    /// Create an automaton around an existing adapter. The feeder thread
    /// starts parked.
    pub fn with_decoder(decoder: Box<dyn VideoDecoder>) -> Self {
        let shared = Arc::new(Shared {
            decoder: Mutex::new(decoder),
            segments: Mutex::new(Arc::new(Vec::new())),
            park: Mutex::new(()),
            wake: Condvar::new(),
            feeder_waiting: AtomicBool::new(false),
            not_done: AtomicBool::new(true),
            seeking: AtomicBool::new(false),
            frames_to_get: AtomicUsize::new(0),
            frames_retrieved: AtomicUsize::new(0),
            feeder_data_idx: AtomicUsize::new(0),
            feeder_valid_idx: AtomicUsize::new(0),
            feeder_current_frame: AtomicI64::new(0),
            feeder_next_frame: AtomicI64::new(-1),
            feeder_next_keyframe: AtomicI64::new(-1),
            feeder_next_keyframe_idx: AtomicUsize::new(0),
            error_set: AtomicBool::new(false),
            feeder_error: Mutex::new(None),
        });
        let feeder = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("strider-feeder".into())
                .spawn(move || feeder_loop(shared))
                .expect("failed to spawn feeder thread")
        };
        Self {
            shared,
            feeder: Some(feeder),
            frame_size: 0,
            current_frame: 0,
            next_frame: -1,
            retriever_data_idx: 0,
            retriever_valid_idx: 0,
        }
    }

    /// Arm the automaton with a new list of segments and the stream's
    /// codec extradata. Resets all positions to the first segment.
    pub fn initialize(
        &mut self,
        segments: Vec<EncodedData>,
        extradata: &[u8],
    ) -> Result<(), DecodeError> {
        assert!(!segments.is_empty(), "initialize with no segments");
        for segment in &segments {
            assert!(
                !segment.valid_frames.is_empty(),
                "segment with empty valid_frames"
            );
            assert!(
                !segment.keyframes.is_empty(),
                "segment without its keyframe sentinel"
            );
        }

        {
            let mut decoder = self.shared.decoder.lock();
            while decoder.decoded_frames_buffered() > 0 {
                decoder.discard_frame()?;
            }
        }

        self.wait_feeder_parked();
        self.shared.error_set.store(false, Ordering::Release);
        *self.shared.feeder_error.lock() = None;

        let first = &segments[0];
        let info = FrameInfo {
            width: first.width,
            height: first.height,
            format: first.format,
        };
        self.frame_size = info.frame_size();
        self.current_frame = first.start_keyframe as i64;
        self.next_frame = first.valid_frames[0] as i64;
        self.retriever_data_idx = 0;
        self.retriever_valid_idx = 0;

        {
            let mut decoder = self.shared.decoder.lock();
            decoder.configure(&info, extradata)?;
            if self.shared.frames_retrieved.load(Ordering::Acquire) > 0 {
                decoder.flush()?;
                while decoder.decoded_frames_buffered() > 0 {
                    decoder.discard_frame()?;
                }
            }
        }

        let segments = Arc::new(segments);
        *self.shared.segments.lock() = Arc::clone(&segments);
        self.shared.set_feeder_idx(0, &segments);
        fence(Ordering::Release);
        self.shared.seeking.store(false, Ordering::Release);
        debug!(segments = segments.len(), "initialized decoder automata");
        Ok(())
    }

    /// Decode the next `num_frames` requested frames into `buffer`, packed
    /// RGB24, in `valid_frames` order across segments.
    ///
    /// `buffer` must hold at least `num_frames * width * height * 3` bytes
    /// and `num_frames` must not exceed the requested frames remaining.
    pub fn get_frames(&mut self, buffer: &mut [u8], num_frames: usize) -> Result<(), DecodeError> {
        let segments = self.shared.segments.lock().clone();
        assert!(
            buffer.len() >= num_frames * self.frame_size,
            "output buffer holds {} bytes but {} frames need {}",
            buffer.len(),
            num_frames,
            num_frames * self.frame_size
        );
        let remaining: usize = segments
            .iter()
            .skip(self.retriever_data_idx)
            .map(|s| s.valid_frames.len())
            .sum::<usize>()
            - self.retriever_valid_idx;
        assert!(
            num_frames <= remaining,
            "{num_frames} frames requested but only {remaining} remain"
        );

        self.wait_feeder_parked();

        self.shared
            .frames_retrieved
            .store(0, Ordering::Release);
        self.shared
            .frames_to_get
            .store(num_frames, Ordering::Release);

        // Only restart the feeder when this call begins a segment or the
        // feeder is still on the retriever's segment; otherwise the feeder
        // already ran ahead and its frames are waiting.
        if self.retriever_data_idx < segments.len() {
            let valid_frames = &segments[self.retriever_data_idx].valid_frames;
            let feeder_idx = self.shared.feeder_data_idx.load(Ordering::Acquire);
            if self.retriever_valid_idx == valid_frames.len()
                || self.retriever_data_idx == feeder_idx
            {
                if feeder_idx < segments.len()
                    && self.shared.seeking.load(Ordering::Acquire)
                {
                    self.drain_decoded()?;
                    self.shared.seeking.store(false, Ordering::Release);
                }
                self.unpark_feeder();
            }
        }

        while self.shared.frames_retrieved.load(Ordering::Acquire) < num_frames {
            if self.shared.error_set.load(Ordering::Acquire) {
                return Err(self.take_feeder_error());
            }
            let buffered = self.shared.decoder.lock().decoded_frames_buffered();
            if buffered == 0 {
                thread::yield_now();
                continue;
            }

            let mut more_frames = true;
            while more_frames
                && self.shared.frames_retrieved.load(Ordering::Acquire) < num_frames
            {
                assert!(
                    self.retriever_data_idx < segments.len(),
                    "more frames requested than remain in the segment list"
                );
                let segment = &segments[self.retriever_data_idx];
                let valid_frames = &segment.valid_frames;
                debug_assert!(self.current_frame <= valid_frames[self.retriever_valid_idx] as i64);

                if self.current_frame == valid_frames[self.retriever_valid_idx] as i64 {
                    let retrieved = self.shared.frames_retrieved.load(Ordering::Acquire);
                    let start = retrieved * self.frame_size;
                    {
                        let mut decoder = self.shared.decoder.lock();
                        decoder.get_frame(&mut buffer[start..start + self.frame_size])?;
                        more_frames = decoder.decoded_frames_buffered() > 0;
                    }
                    self.retriever_valid_idx += 1;
                    if self.retriever_valid_idx == valid_frames.len() {
                        // Segment finished; hand the feeder the next one.
                        self.retriever_data_idx += 1;
                        self.retriever_valid_idx = 0;
                        if self.retriever_data_idx < segments.len() {
                            self.wait_feeder_parked_draining()?;
                            if self.shared.seeking.load(Ordering::Acquire) {
                                self.drain_decoded()?;
                                self.shared.seeking.store(false, Ordering::Release);
                            }
                            let next = &segments[self.retriever_data_idx];
                            // One below the keyframe: the shared increment
                            // at the bottom of the loop lands on it.
                            self.current_frame = next.keyframes[0] as i64 - 1;
                            self.unpark_feeder();
                            debug!(
                                segment = self.retriever_data_idx,
                                "retriever advanced to next segment"
                            );
                            more_frames = false;
                        }
                    }
                    if self.retriever_data_idx < segments.len() {
                        self.next_frame = segments[self.retriever_data_idx].valid_frames
                            [self.retriever_valid_idx] as i64;
                    }
                    self.shared
                        .frames_retrieved
                        .store(retrieved + 1, Ordering::Release);
                } else {
                    let mut decoder = self.shared.decoder.lock();
                    decoder.discard_frame()?;
                    more_frames = decoder.decoded_frames_buffered() > 0;
                }
                self.current_frame += 1;
            }
        }

        self.shared.decoder.lock().wait_until_frames_copied()?;
        debug!(
            frames = num_frames,
            next_frame = self.next_frame,
            "get_frames complete"
        );
        Ok(())
    }

    /// Block until the feeder announces it is parked.
    fn wait_feeder_parked(&self) {
        let mut guard = self.shared.park.lock();
        while !self.shared.feeder_waiting.load(Ordering::Acquire) {
            self.shared.wake.wait(&mut guard);
        }
    }

    /// Like [`wait_feeder_parked`], but keeps the decoded-frame queue empty
    /// while waiting. The feeder's backpressure loop wakes us each spin, so
    /// it can never stall waiting for queue space we are not freeing.
    ///
    /// [`wait_feeder_parked`]: DecoderAutomata::wait_feeder_parked
    fn wait_feeder_parked_draining(&self) -> Result<(), DecodeError> {
        let mut guard = self.shared.park.lock();
        loop {
            if self.shared.feeder_waiting.load(Ordering::Acquire) {
                return Ok(());
            }
            {
                let mut decoder = self.shared.decoder.lock();
                while decoder.decoded_frames_buffered() > 0 {
                    decoder.discard_frame()?;
                }
            }
            self.shared.wake.wait(&mut guard);
        }
    }

    fn unpark_feeder(&self) {
        {
            let _guard = self.shared.park.lock();
            self.shared.feeder_waiting.store(false, Ordering::Release);
        }
        self.shared.wake.notify_all();
    }

    fn drain_decoded(&self) -> Result<(), DecodeError> {
        let mut decoder = self.shared.decoder.lock();
        while decoder.decoded_frames_buffered() > 0 {
            decoder.discard_frame()?;
        }
        Ok(())
    }

    fn take_feeder_error(&self) -> DecodeError {
        self.shared.error_set.store(false, Ordering::Release);
        self.shared
            .feeder_error
            .lock()
            .take()
            .unwrap_or_else(|| DecodeError::Feeder("unknown feeder failure".into()))
    }
}

impl Drop for DecoderAutomata {
    fn drop(&mut self) {
        self.shared.frames_to_get.store(0, Ordering::Release);
        self.shared.frames_retrieved.store(0, Ordering::Release);
        let _ = self.drain_decoded();
        self.wait_feeder_parked();
        {
            let _guard = self.shared.park.lock();
            self.shared.not_done.store(false, Ordering::Release);
            self.shared.feeder_waiting.store(false, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if let Some(feeder) = self.feeder.take() {
            let _ = feeder.join();
        }
    }
}

/// Body of the feeder thread.
fn feeder_loop(shared: Arc<Shared>) {
    loop {
        // Park and wait to be handed work.
        {
            let mut guard = shared.park.lock();
            shared.feeder_waiting.store(true, Ordering::Release);
            shared.wake.notify_all();
            while shared.feeder_waiting.load(Ordering::Acquire) {
                shared.wake.wait(&mut guard);
            }
        }
        fence(Ordering::Acquire);
        if !shared.not_done.load(Ordering::Acquire) {
            break;
        }

        let segments = shared.segments.lock().clone();
        if shared.feeder_data_idx.load(Ordering::Acquire) >= segments.len() {
            // All data fed; nothing to do until re-initialized.
            continue;
        }

        'feed: while shared.frames_retrieved.load(Ordering::Acquire)
            < shared.frames_to_get.load(Ordering::Acquire)
        {
            // Backpressure: cap decoded-but-unconsumed frames. Notify on
            // every spin so a retriever waiting in
            // wait_feeder_parked_draining keeps draining.
            loop {
                if shared.frames_retrieved.load(Ordering::Acquire)
                    >= shared.frames_to_get.load(Ordering::Acquire)
                {
                    break 'feed;
                }
                if !shared.not_done.load(Ordering::Acquire) {
                    break 'feed;
                }
                if shared.decoder.lock().decoded_frames_buffered() <= MAX_BUFFERED_FRAMES {
                    break;
                }
                shared.wake.notify_all();
                thread::yield_now();
            }

            let data_idx = shared.feeder_data_idx.load(Ordering::Acquire);
            let segment = &segments[data_idx];
            let current = shared.feeder_current_frame.load(Ordering::Acquire);

            if current >= segment.end_keyframe as i64 {
                // Segment exhausted: empty packet is end-of-stream, then
                // flush the codec's delay queue and park for the next
                // segment.
                let result = {
                    let mut decoder = shared.decoder.lock();
                    decoder.feed(&[], false, false).and_then(|()| decoder.flush())
                };
                if let Err(error) = result {
                    shared.record_feeder_error(error);
                    break 'feed;
                }
                shared.seeking.store(true, Ordering::Release);
                shared.set_feeder_idx(data_idx + 1, &segments);
                debug!(segment = data_idx, "feeder finished segment");
                break 'feed;
            }

            let relative = (current as u64 - segment.start_keyframe) as usize;
            let offset = segment.sample_offsets[relative];
            let size = segment.sample_sizes[relative];

            let mut is_keyframe = false;
            if current == shared.feeder_next_keyframe.load(Ordering::Acquire) {
                let next_idx = shared.feeder_next_keyframe_idx.load(Ordering::Acquire) + 1;
                shared
                    .feeder_next_keyframe_idx
                    .store(next_idx, Ordering::Release);
                if let Some(&next) = segment.keyframes.get(next_idx) {
                    shared
                        .feeder_next_keyframe
                        .store(next as i64, Ordering::Release);
                }
                is_keyframe = true;
            }

            let start = offset as usize;
            let end = start + size as usize;
            let result = match segment.encoded_video.get(start..end) {
                Some(packet) => shared.decoder.lock().feed(packet, is_keyframe, false),
                None => Err(DecodeError::SampleOutOfRange {
                    offset,
                    size,
                    buffer_len: segment.encoded_video.len(),
                }),
            };
            if let Err(error) = result {
                shared.record_feeder_error(error);
                break 'feed;
            }

            if current == shared.feeder_next_frame.load(Ordering::Acquire) {
                let next_idx = shared.feeder_valid_idx.load(Ordering::Acquire) + 1;
                shared.feeder_valid_idx.store(next_idx, Ordering::Release);
                let next = segment
                    .valid_frames
                    .get(next_idx)
                    .map_or(-1, |&f| f as i64);
                shared.feeder_next_frame.store(next, Ordering::Release);
            }
            shared
                .feeder_current_frame
                .store(current + 1, Ordering::Release);
            thread::yield_now();
        }
    }
    debug!("feeder thread exiting");
}
