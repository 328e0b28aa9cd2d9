//! Real-time paced synthetic audio for running the pipeline without devices.

use std::f64::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use anc_engine::{AudioInput, AudioIoError, AudioOutput, CapturedFrame};
use clap::ValueEnum;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Samples of acoustic delay between the reference and error microphones.
const PATH_DELAY: usize = 8;
const PATH_GAIN: f64 = 0.8;
const ALARM_BURST: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum NoiseKind {
    /// Broadband white noise.
    Noise,
    /// Mains-style hum with a little hiss.
    Tone,
    /// White noise with periodic two-tone siren bursts.
    Alarm,
}

struct Synth {
    rng: StdRng,
    sample_rate: u32,
    chunk_size: usize,
    /// Absolute sample index of the next generated sample.
    clock: u64,
    produced: u64,
    next_due: Option<Instant>,
    /// Last `PATH_DELAY` reference samples, oldest first.
    tail: Vec<f64>,
}

pub struct SyntheticInput {
    kind: NoiseKind,
    alarm_every: Duration,
    limit: Option<u64>,
    open: AtomicBool,
    synth: Mutex<Synth>,
}

impl SyntheticInput {
    pub fn new(kind: NoiseKind, seed: u64) -> Self {
        Self {
            kind,
            alarm_every: Duration::from_secs(5),
            limit: None,
            open: AtomicBool::new(false),
            synth: Mutex::new(Synth {
                rng: StdRng::seed_from_u64(seed),
                sample_rate: 48_000,
                chunk_size: 1_024,
                clock: 0,
                produced: 0,
                next_due: None,
                tail: vec![0.0; PATH_DELAY],
            }),
        }
    }

    pub fn with_alarm_every(mut self, every: Duration) -> Self {
        self.alarm_every = every;
        self
    }

    /// End the stream after `chunks` reads.
    pub fn with_limit(mut self, chunks: Option<u64>) -> Self {
        self.limit = chunks;
        self
    }

    fn alarm_active(&self, t: f64) -> bool {
        let every = self.alarm_every.as_secs_f64();
        every > 0.0 && t % every < ALARM_BURST.as_secs_f64()
    }

    fn sample(&self, s: &mut Synth, n: u64) -> f64 {
        let t = n as f64 / s.sample_rate as f64;
        let hiss: f64 = s.rng.gen_range(-1.0..1.0);
        match self.kind {
            NoiseKind::Noise => 0.3 * hiss,
            NoiseKind::Tone => 0.3 * (TAU * 120.0 * t).sin() + 0.02 * hiss,
            NoiseKind::Alarm => {
                if self.alarm_active(t) {
                    // two-tone siren alternating every 250 ms
                    let f = if (t * 4.0) as u64 % 2 == 0 { 960.0 } else { 770.0 };
                    0.6 * (TAU * f * t).sin() + 0.1 * hiss
                } else {
                    0.3 * hiss
                }
            }
        }
    }
}

impl AudioInput for SyntheticInput {
    fn open(&self, sample_rate: u32, chunk_size: usize) -> Result<(), AudioIoError> {
        let mut s = self.synth.lock();
        s.sample_rate = sample_rate.max(1);
        s.chunk_size = chunk_size;
        s.next_due = None;
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn read_chunk(&self) -> Result<CapturedFrame, AudioIoError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(AudioIoError::Closed);
        }
        let mut s = self.synth.lock();
        if self.limit.is_some_and(|limit| s.produced >= limit) {
            return Err(AudioIoError::EndOfStream);
        }

        let period = Duration::from_secs_f64(s.chunk_size as f64 / s.sample_rate as f64);
        let due = *s.next_due.get_or_insert_with(Instant::now);
        let now = Instant::now();
        if due > now {
            std::thread::sleep(due - now);
        }
        s.next_due = Some(due.max(now) + period);

        let start = s.clock;
        let reference: Vec<f64> = (0..s.chunk_size as u64)
            .map(|i| self.sample(&mut s, start + i))
            .collect();

        let mut observed = Vec::with_capacity(reference.len());
        for &x in &reference {
            let delayed = s.tail.remove(0);
            s.tail.push(x);
            observed.push(PATH_GAIN * delayed);
        }

        s.clock += s.chunk_size as u64;
        s.produced += 1;
        Ok(CapturedFrame {
            reference,
            observed: Some(observed),
        })
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// Discards audio, counting what it was given.
#[derive(Default)]
pub struct NullOutput {
    open: AtomicBool,
    chunks: AtomicU64,
    samples: AtomicU64,
}

impl NullOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl AudioOutput for NullOutput {
    fn open(&self, _sample_rate: u32, _chunk_size: usize) -> Result<(), AudioIoError> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn write_chunk(&self, samples: &[f64]) -> Result<(), AudioIoError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(AudioIoError::Closed);
        }
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(samples.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel) {
            debug!(chunks = self.chunks(), samples = self.samples(), "null output closed");
        }
    }
}
