use std::time::{Duration, Instant};

use anc_engine::{AudioInput, AudioIoError, CapturedFrame};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Observer, Producer, Split},
    HeapCons, HeapRb,
};
use tracing::warn;

/// Chunk periods to wait for the device before reporting an underrun.
const UNDERRUN_PERIODS: u32 = 4;

struct Live {
    _stream: cpal::Stream,
    cons: HeapCons<f32>,
    chunk_size: usize,
    period: Duration,
}

/// Default input device as the reference microphone.
pub struct DeviceInput {
    live: Mutex<Option<Live>>,
}

// Safety: cpal::Stream is not Send on some platforms due to internal raw
// pointers. The stream is only created, held and dropped behind the Mutex and
// is never touched otherwise.
unsafe impl Send for DeviceInput {}
unsafe impl Sync for DeviceInput {}

impl DeviceInput {
    pub fn new() -> Self {
        Self { live: Mutex::new(None) }
    }
}

fn device_err(e: impl std::fmt::Display) -> AudioIoError {
    AudioIoError::Device(e.to_string())
}

impl AudioInput for DeviceInput {
    fn open(&self, sample_rate: u32, chunk_size: usize) -> Result<(), AudioIoError> {
        let host = cpal::default_host();
        let dev = host
            .default_input_device()
            .ok_or_else(|| device_err("no input device"))?;
        let cfg = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let rb = HeapRb::<f32>::new(sample_rate as usize); // ~1s
        let (mut prod, cons) = rb.split();

        let stream = dev
            .build_input_stream(
                &cfg,
                move |data: &[f32], _| {
                    // overrun drops the newest samples
                    prod.push_slice(data);
                },
                move |err| {
                    warn!(error = %err, "capture stream error");
                },
                None,
            )
            .map_err(device_err)?;
        stream.play().map_err(device_err)?;

        *self.live.lock() = Some(Live {
            _stream: stream,
            cons,
            chunk_size,
            period: Duration::from_secs_f64(chunk_size as f64 / sample_rate.max(1) as f64),
        });
        Ok(())
    }

    fn read_chunk(&self) -> Result<CapturedFrame, AudioIoError> {
        let deadline = {
            let guard = self.live.lock();
            let live = guard.as_ref().ok_or(AudioIoError::Closed)?;
            Instant::now() + live.period * UNDERRUN_PERIODS
        };
        loop {
            {
                let mut guard = self.live.lock();
                let live = guard.as_mut().ok_or(AudioIoError::Closed)?;
                if live.cons.occupied_len() >= live.chunk_size {
                    let mut buf = vec![0f32; live.chunk_size];
                    live.cons.pop_slice(&mut buf);
                    return Ok(CapturedFrame::reference_only(
                        buf.into_iter().map(f64::from).collect(),
                    ));
                }
            }
            if Instant::now() >= deadline {
                return Err(device_err("capture underrun"));
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn close(&self) {
        self.live.lock().take();
    }
}
