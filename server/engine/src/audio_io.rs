//! Blocking audio I/O boundary plus in-memory implementations.

use std::collections::VecDeque;

use parking_lot::Mutex;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioIoError {
    #[error("device: {0}")]
    Device(String),

    #[error("end of stream")]
    EndOfStream,

    #[error("stream closed")]
    Closed,
}

/// One blocking read: reference microphone plus optional error microphone.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CapturedFrame {
    pub reference: Vec<f64>,
    pub observed: Option<Vec<f64>>,
}

impl CapturedFrame {
    pub fn reference_only(reference: Vec<f64>) -> Self {
        Self {
            reference,
            observed: None,
        }
    }
}

pub trait AudioInput: Send + Sync {
    fn open(&self, sample_rate: u32, chunk_size: usize) -> Result<(), AudioIoError>;
    /// Blocks until one chunk of `chunk_size` samples is available.
    fn read_chunk(&self) -> Result<CapturedFrame, AudioIoError>;
    fn close(&self);
}

pub trait AudioOutput: Send + Sync {
    fn open(&self, sample_rate: u32, chunk_size: usize) -> Result<(), AudioIoError>;
    fn write_chunk(&self, samples: &[f64]) -> Result<(), AudioIoError>;
    fn close(&self);
}

/// Plays back a fixed script of reads, then reports end of stream.
pub struct ScriptedInput {
    script: Mutex<VecDeque<Result<CapturedFrame, AudioIoError>>>,
    open_error: Option<AudioIoError>,
    opened: Mutex<bool>,
}

impl ScriptedInput {
    pub fn new(script: impl IntoIterator<Item = Result<CapturedFrame, AudioIoError>>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            open_error: None,
            opened: Mutex::new(false),
        }
    }

    pub fn failing_open(err: AudioIoError) -> Self {
        Self {
            open_error: Some(err),
            ..Self::new([])
        }
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }
}

impl AudioInput for ScriptedInput {
    fn open(&self, _sample_rate: u32, _chunk_size: usize) -> Result<(), AudioIoError> {
        if let Some(e) = &self.open_error {
            return Err(e.clone());
        }
        *self.opened.lock() = true;
        Ok(())
    }

    fn read_chunk(&self) -> Result<CapturedFrame, AudioIoError> {
        if !*self.opened.lock() {
            return Err(AudioIoError::Closed);
        }
        self.script.lock().pop_front().unwrap_or(Err(AudioIoError::EndOfStream))
    }

    fn close(&self) {
        *self.opened.lock() = false;
    }
}

/// Collects every written chunk; can be told to fail writes.
#[derive(Default)]
pub struct MemoryOutput {
    written: Mutex<Vec<Vec<f64>>>,
    fail_writes: Mutex<bool>,
    opened: Mutex<bool>,
}

impl MemoryOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        *self.fail_writes.lock() = failing;
    }

    pub fn written(&self) -> Vec<Vec<f64>> {
        self.written.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        *self.opened.lock()
    }
}

impl AudioOutput for MemoryOutput {
    fn open(&self, _sample_rate: u32, _chunk_size: usize) -> Result<(), AudioIoError> {
        *self.opened.lock() = true;
        Ok(())
    }

    fn write_chunk(&self, samples: &[f64]) -> Result<(), AudioIoError> {
        if *self.fail_writes.lock() {
            return Err(AudioIoError::Device("write rejected".into()));
        }
        self.written.lock().push(samples.to_vec());
        Ok(())
    }

    fn close(&self) {
        *self.opened.lock() = false;
    }
}
