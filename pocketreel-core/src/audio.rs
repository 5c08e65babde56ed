// AUDIO - output sinks and the audio thread
//
// AudioQueue ──► AudioPipeline thread ──► AudioDecoder ──► AudioSink
//                                                  └──► AudioClock (samples written)
//
// The thread blocks on the queue, decodes, writes to the sink with a
// bounded timeout, and counts every sample the sink accepted. That count
// is the master clock for A/V sync.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use crate::audio_decode::{apply_volume, AudioDecoder};
use crate::audio_queue::{AudioQueue, QueuePop};
use crate::config::PlayerConfig;
use crate::sync::AudioClock;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Audio write timed out")]
    Timeout,
    #[error("Audio output closed")]
    Closed,
    #[error("Audio device error: {0}")]
    Device(String),
}

// ============================================================================
// Sinks
// ============================================================================

/// An audio output. Samples are interleaved i16.
pub trait AudioSink: Send {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError>;

    /// Write as much of `pcm` as fits before `timeout`. Returns the number
    /// of samples accepted, or `Timeout` if none were.
    fn write(&mut self, pcm: &[i16], timeout: Duration) -> Result<usize, SinkError>;

    /// Push a short block of silence so the device does not replay stale data
    fn silence(&mut self);
}

/// How far a paced `NullSink` may run ahead of real time
const NULL_SINK_LEAD: Duration = Duration::from_millis(100);

/// Discards samples. Paced to real time by default so it can still
/// drive the playback clock.
pub struct NullSink {
    sample_rate: u32,
    channels: u16,
    frames_written: u64,
    started: Option<Instant>,
    paced: bool,
}

impl NullSink {
    pub fn new() -> Self {
        Self {
            sample_rate: 0,
            channels: 1,
            frames_written: 0,
            started: None,
            paced: true,
        }
    }

    /// Accepts everything immediately
    pub fn unpaced() -> Self {
        Self {
            paced: false,
            ..Self::new()
        }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioSink for NullSink {
    fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
        self.sample_rate = sample_rate;
        self.channels = channels.max(1);
        self.frames_written = 0;
        self.started = None;
        Ok(())
    }

    fn write(&mut self, pcm: &[i16], timeout: Duration) -> Result<usize, SinkError> {
        if self.paced && self.sample_rate > 0 {
            let started = *self.started.get_or_insert_with(Instant::now);
            let queued = Duration::from_micros(self.frames_written * 1_000_000 / self.sample_rate as u64);
            let ahead = queued.saturating_sub(started.elapsed());
            if ahead > NULL_SINK_LEAD {
                let wait = ahead - NULL_SINK_LEAD;
                if wait > timeout {
                    thread::sleep(timeout);
                    return Err(SinkError::Timeout);
                }
                thread::sleep(wait);
            }
        }
        self.frames_written += (pcm.len() / self.channels as usize) as u64;
        Ok(pcm.len())
    }

    fn silence(&mut self) {}
}

#[cfg(feature = "audio")]
pub use self::cpal_sink::CpalSink;

#[cfg(feature = "audio")]
mod cpal_sink {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{BufferSize, SampleFormat, SampleRate, StreamConfig};
    use ringbuf::traits::{Consumer, Observer, Producer, Split};
    use ringbuf::{HeapCons, HeapProd, HeapRb};

    use super::{AudioSink, SinkError};

    const SILENCE_BLOCK: usize = 256;

    /// Default output device. The cpal stream is not `Send`, so it lives
    /// on its own thread and is fed through a lock-free ring.
    pub struct CpalSink {
        producer: Option<HeapProd<i16>>,
        stream_thread: Option<JoinHandle<()>>,
        shutdown: Arc<AtomicBool>,
    }

    impl CpalSink {
        pub fn new() -> Self {
            Self {
                producer: None,
                stream_thread: None,
                shutdown: Arc::new(AtomicBool::new(false)),
            }
        }

        fn close(&mut self) {
            self.shutdown.store(true, Ordering::SeqCst);
            self.producer = None;
            if let Some(handle) = self.stream_thread.take() {
                let _ = handle.join();
            }
        }
    }

    impl Default for CpalSink {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Drop for CpalSink {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn run_stream(
        sample_rate: u32,
        channels: u16,
        mut consumer: HeapCons<i16>,
        shutdown: Arc<AtomicBool>,
        ready: mpsc::Sender<Result<(), String>>,
    ) {
        let host = cpal::default_host();
        let Some(device) = host.default_output_device() else {
            let _ = ready.send(Err("No output device".into()));
            return;
        };
        let format = match device.default_output_config() {
            Ok(config) => config.sample_format(),
            Err(e) => {
                let _ = ready.send(Err(format!("Failed to get output config: {}", e)));
                return;
            }
        };
        let config = StreamConfig {
            channels,
            sample_rate: SampleRate(sample_rate),
            buffer_size: BufferSize::Default,
        };
        let err_fn = |err| tracing::warn!("Audio stream error: {}", err);

        let stream = match format {
            SampleFormat::I16 => device.build_output_stream(
                &config,
                move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                    let n = consumer.pop_slice(data);
                    data[n..].fill(0);
                },
                err_fn,
                None,
            ),
            SampleFormat::F32 => device.build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().map_or(0.0, |s| s as f32 / 32768.0);
                    }
                },
                err_fn,
                None,
            ),
            SampleFormat::U16 => device.build_output_stream(
                &config,
                move |data: &mut [u16], _: &cpal::OutputCallbackInfo| {
                    for sample in data.iter_mut() {
                        *sample = consumer.try_pop().map_or(0x8000, |s| (s as i32 + 0x8000) as u16);
                    }
                },
                err_fn,
                None,
            ),
            other => {
                let _ = ready.send(Err(format!("Unsupported sample format {:?}", other)));
                return;
            }
        };

        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                let _ = ready.send(Err(format!("Failed to build stream: {}", e)));
                return;
            }
        };
        if let Err(e) = stream.play() {
            let _ = ready.send(Err(format!("Failed to start stream: {}", e)));
            return;
        }
        let _ = ready.send(Ok(()));

        while !shutdown.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
        }
    }

    impl AudioSink for CpalSink {
        fn configure(&mut self, sample_rate: u32, channels: u16) -> Result<(), SinkError> {
            self.close();
            self.shutdown = Arc::new(AtomicBool::new(false));

            // Half a second of device buffering
            let capacity = (sample_rate as usize * channels.max(1) as usize / 2).max(1024);
            let (producer, consumer) = HeapRb::<i16>::new(capacity).split();

            let (ready_tx, ready_rx) = mpsc::channel();
            let shutdown = self.shutdown.clone();
            let handle = thread::Builder::new()
                .name("pocketreel-cpal".into())
                .spawn(move || run_stream(sample_rate, channels, consumer, shutdown, ready_tx))
                .map_err(|e| SinkError::Device(e.to_string()))?;
            self.stream_thread = Some(handle);

            match ready_rx.recv_timeout(Duration::from_secs(2)) {
                Ok(Ok(())) => {
                    self.producer = Some(producer);
                    tracing::info!("Audio output: {}Hz, {} channels", sample_rate, channels);
                    Ok(())
                }
                Ok(Err(msg)) => {
                    self.close();
                    Err(SinkError::Device(msg))
                }
                Err(_) => {
                    self.close();
                    Err(SinkError::Device("Output stream did not start".into()))
                }
            }
        }

        fn write(&mut self, pcm: &[i16], timeout: Duration) -> Result<usize, SinkError> {
            let producer = self.producer.as_mut().ok_or(SinkError::Closed)?;
            let deadline = Instant::now() + timeout;
            let mut written = 0;
            loop {
                written += producer.push_slice(&pcm[written..]);
                if written == pcm.len() {
                    return Ok(written);
                }
                if Instant::now() >= deadline {
                    return if written > 0 {
                        Ok(written)
                    } else {
                        Err(SinkError::Timeout)
                    };
                }
                thread::sleep(Duration::from_millis(1));
            }
        }

        fn silence(&mut self) {
            if let Some(producer) = self.producer.as_mut() {
                let n = producer.vacant_len().min(SILENCE_BLOCK);
                producer.push_slice(&[0i16; SILENCE_BLOCK][..n]);
            }
        }
    }
}

// ============================================================================
// Audio Pipeline
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AudioStats {
    pub chunks_decoded: u64,
    pub decode_errors: u64,
    pub sink_timeouts: u64,
    pub samples_written: u64,
}

#[derive(Default)]
struct SharedStats {
    chunks_decoded: AtomicU64,
    decode_errors: AtomicU64,
    sink_timeouts: AtomicU64,
    samples_written: AtomicU64,
}

impl SharedStats {
    fn snapshot(&self) -> AudioStats {
        AudioStats {
            chunks_decoded: self.chunks_decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            sink_timeouts: self.sink_timeouts.load(Ordering::Relaxed),
            samples_written: self.samples_written.load(Ordering::Relaxed),
        }
    }
}

struct Worker {
    queue: Arc<AudioQueue>,
    decoder: Box<dyn AudioDecoder>,
    sink: Box<dyn AudioSink>,
    clock: Arc<AudioClock>,
    stop: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    volume: u8,
    write_timeout: Duration,
}

const POP_TIMEOUT: Duration = Duration::from_millis(50);

impl Worker {
    fn run(mut self) {
        let mut format = (self.decoder.sample_rate(), self.decoder.channels());
        let mut channels = format.1.max(1) as u64;
        let mut pcm: Vec<i16> = Vec::with_capacity(8192);
        let mut interleaved_total: u64 = 0;

        'outer: while !self.stop.load(Ordering::SeqCst) {
            let chunk = match self.queue.pop_timeout(POP_TIMEOUT) {
                QueuePop::Chunk(chunk) => chunk,
                QueuePop::Empty => continue,
                QueuePop::Finished => {
                    tracing::debug!("Audio input finished");
                    break;
                }
                QueuePop::Closed => break,
            };

            let decoded = match self.decoder.decode(chunk.data()) {
                Ok(samples) => {
                    apply_volume(samples, self.volume, &mut pcm);
                    true
                }
                Err(e) => {
                    let errors = self.stats.decode_errors.fetch_add(1, Ordering::Relaxed) + 1;
                    if errors <= 3 || errors % 100 == 0 {
                        tracing::warn!("Audio decode error #{}: {}", errors, e);
                    }
                    false
                }
            };
            self.queue.recycle(chunk);
            if !decoded {
                continue;
            }
            self.stats.chunks_decoded.fetch_add(1, Ordering::Relaxed);

            // The stream header can disagree with what the decoder finds
            let decoded_format = (self.decoder.sample_rate(), self.decoder.channels());
            if decoded_format != format && decoded_format.0 > 0 && decoded_format.1 > 0 {
                tracing::info!(
                    "Audio format changed: {}Hz/{}ch -> {}Hz/{}ch",
                    format.0,
                    format.1,
                    decoded_format.0,
                    decoded_format.1
                );
                if let Err(e) = self.sink.configure(decoded_format.0, decoded_format.1) {
                    tracing::error!("Audio output failed: {}", e);
                    break;
                }
                self.clock.set_sample_rate(decoded_format.0);
                format = decoded_format;
                channels = format.1 as u64;
                interleaved_total = 0;
            }

            let mut offset = 0;
            while offset < pcm.len() {
                if self.stop.load(Ordering::SeqCst) {
                    break 'outer;
                }
                match self.sink.write(&pcm[offset..], self.write_timeout) {
                    Ok(n) => {
                        offset += n;
                        let before = interleaved_total / channels;
                        interleaved_total += n as u64;
                        self.clock.add_samples(interleaved_total / channels - before);
                        self.stats.samples_written.fetch_add(n as u64, Ordering::Relaxed);
                    }
                    Err(SinkError::Timeout) => {
                        self.stats.sink_timeouts.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::error!("Audio output failed: {}", e);
                        break 'outer;
                    }
                }
            }
        }

        for _ in 0..4 {
            self.sink.silence();
        }
        self.clock.set_finished();
    }
}

pub struct AudioPipeline {
    queue: Arc<AudioQueue>,
    clock: Arc<AudioClock>,
    stop: Arc<AtomicBool>,
    stats: Arc<SharedStats>,
    worker: Option<Worker>,
    handle: Option<JoinHandle<()>>,
    stop_timeout: Duration,
}

impl AudioPipeline {
    /// Configure the sink for the decoder's format. The thread does not
    /// run until `start`.
    pub fn new(
        queue: Arc<AudioQueue>,
        decoder: Box<dyn AudioDecoder>,
        mut sink: Box<dyn AudioSink>,
        config: &PlayerConfig,
    ) -> Result<Self, SinkError> {
        sink.configure(decoder.sample_rate(), decoder.channels())?;
        let clock = Arc::new(AudioClock::new(decoder.sample_rate()));
        let stop = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(SharedStats::default());

        tracing::info!(
            "Audio pipeline: {} {}Hz/{}ch, queue {}x{} bytes, volume {}%",
            decoder.name(),
            decoder.sample_rate(),
            decoder.channels(),
            queue.capacity(),
            queue.chunk_size(),
            config.volume
        );

        let worker = Worker {
            queue: queue.clone(),
            decoder,
            sink,
            clock: clock.clone(),
            stop: stop.clone(),
            stats: stats.clone(),
            volume: config.volume,
            write_timeout: config.audio_write_timeout(),
        };

        Ok(Self {
            queue,
            clock,
            stop,
            stats,
            worker: Some(worker),
            handle: None,
            stop_timeout: config.audio_stop_timeout(),
        })
    }

    pub fn start(&mut self) -> std::io::Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        let handle = thread::Builder::new()
            .name("pocketreel-audio".into())
            .spawn(move || worker.run())?;
        self.handle = Some(handle);
        Ok(())
    }

    pub fn clock(&self) -> Arc<AudioClock> {
        self.clock.clone()
    }

    /// The thread has written everything it will write
    pub fn is_finished(&self) -> bool {
        self.clock.is_finished()
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Close the queue and wait for the thread. False if it had to be
    /// left behind after the stop timeout.
    pub fn stop(&mut self) -> bool {
        self.stop.store(true, Ordering::SeqCst);
        self.queue.close();
        self.worker = None;

        let Some(handle) = self.handle.take() else {
            return true;
        };
        let deadline = Instant::now() + self.stop_timeout;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        if !handle.is_finished() {
            tracing::warn!(
                "Audio thread did not stop within {:?}, detaching",
                self.stop_timeout
            );
            return false;
        }
        if handle.join().is_err() {
            tracing::error!("Audio thread panicked");
        }
        true
    }

    pub fn stats(&self) -> AudioStats {
        self.stats.snapshot()
    }
}

impl Drop for AudioPipeline {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio_decode::PcmDecoder;
    use crate::testutil::RecordingSink;

    fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    fn pipeline(queue: &Arc<AudioQueue>, sink: RecordingSink, volume: u8) -> AudioPipeline {
        let config = PlayerConfig {
            volume,
            ..PlayerConfig::default()
        };
        let decoder = Box::new(PcmDecoder::new(16, 2, 1000).unwrap());
        AudioPipeline::new(queue.clone(), decoder, Box::new(sink), &config).unwrap()
    }

    #[test]
    fn test_plays_queue_to_end() {
        let queue = Arc::new(AudioQueue::new(8, 64));
        let sink = RecordingSink::new();
        let recorded = sink.samples();
        let mut audio = pipeline(&queue, sink, 100);
        let clock = audio.clock();

        for i in 0..5 {
            assert!(queue.try_push(&pcm_bytes(&[i, -i, i, -i])));
        }
        queue.finish();
        audio.start().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while !clock.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(clock.is_finished());
        assert_eq!(clock.samples_written(), 10);
        assert_eq!(recorded.lock().len(), 20);
        assert_eq!(audio.stats().chunks_decoded, 5);
        assert!(audio.stop());
    }

    #[test]
    fn test_volume_applied() {
        let queue = Arc::new(AudioQueue::new(4, 64));
        let sink = RecordingSink::new();
        let recorded = sink.samples();
        let mut audio = pipeline(&queue, sink, 50);
        let clock = audio.clock();

        queue.try_push(&pcm_bytes(&[1000, -1000]));
        queue.finish();
        audio.start().unwrap();
        while !clock.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&recorded.lock()[..], &[500, -500]);
    }

    #[test]
    fn test_stop_joins_idle_thread() {
        let queue = Arc::new(AudioQueue::new(4, 64));
        let mut audio = pipeline(&queue, RecordingSink::new(), 50);
        audio.start().unwrap();
        assert!(audio.is_running());

        assert!(audio.stop());
        assert!(!audio.is_running());
        assert!(audio.clock().is_finished());
        // Idempotent
        assert!(audio.stop());
    }

    #[test]
    fn test_sink_timeouts_are_retried() {
        let queue = Arc::new(AudioQueue::new(4, 64));
        let sink = RecordingSink::new().with_timeouts(3);
        let recorded = sink.samples();
        let mut audio = pipeline(&queue, sink, 100);
        let clock = audio.clock();

        queue.try_push(&pcm_bytes(&[1, 2, 3, 4]));
        queue.finish();
        audio.start().unwrap();
        while !clock.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(&recorded.lock()[..], &[1, 2, 3, 4]);
        assert_eq!(audio.stats().sink_timeouts, 3);
    }

    /// PCM that reports a different rate once it has seen a frame
    struct RateSwitchDecoder {
        inner: PcmDecoder,
        rate: u32,
    }

    impl AudioDecoder for RateSwitchDecoder {
        fn decode(&mut self, unit: &[u8]) -> Result<&[i16], crate::decode::DecodeError> {
            self.rate = 2000;
            self.inner.decode(unit)
        }

        fn sample_rate(&self) -> u32 {
            self.rate
        }

        fn channels(&self) -> u16 {
            1
        }

        fn name(&self) -> &'static str {
            "rate switch"
        }
    }

    #[test]
    fn test_decoded_rate_drives_clock() {
        let queue = Arc::new(AudioQueue::new(4, 4096));
        let decoder = Box::new(RateSwitchDecoder {
            inner: PcmDecoder::new(16, 1, 1000).unwrap(),
            rate: 1000,
        });
        let config = PlayerConfig {
            volume: 100,
            ..PlayerConfig::default()
        };
        let mut audio =
            AudioPipeline::new(queue.clone(), decoder, Box::new(RecordingSink::new()), &config)
                .unwrap();
        let clock = audio.clock();

        queue.try_push(&pcm_bytes(&[0; 1000]));
        queue.finish();
        audio.start().unwrap();
        while !clock.is_finished() {
            thread::sleep(Duration::from_millis(1));
        }
        // Declared 1000Hz, decoded 2000Hz
        assert_eq!(clock.sample_rate(), 2000);
        assert_eq!(clock.position_ms(), 500);
        assert!(audio.stop());
    }

    #[test]
    fn test_null_sink_unpaced_accepts_everything() {
        let mut sink = NullSink::unpaced();
        sink.configure(8000, 1).unwrap();
        assert_eq!(sink.write(&[0; 80_000], Duration::ZERO).unwrap(), 80_000);
    }
}
