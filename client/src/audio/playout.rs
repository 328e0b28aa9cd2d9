use anc_engine::{AudioIoError, AudioOutput};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use parking_lot::Mutex;
use ringbuf::{
    traits::{Consumer, Producer, Split},
    HeapProd, HeapRb,
};
use tracing::warn;

struct Live {
    _stream: cpal::Stream,
    prod: HeapProd<f32>,
}

/// Default output device (the anti-noise speaker).
pub struct DeviceOutput {
    live: Mutex<Option<Live>>,
}

// Safety: cpal::Stream is not Send on some platforms due to internal raw
// pointers. The stream is only created, held and dropped behind the Mutex and
// is never touched otherwise.
unsafe impl Send for DeviceOutput {}
unsafe impl Sync for DeviceOutput {}

impl DeviceOutput {
    pub fn new() -> Self {
        Self { live: Mutex::new(None) }
    }
}

impl AudioOutput for DeviceOutput {
    fn open(&self, sample_rate: u32, _chunk_size: usize) -> Result<(), AudioIoError> {
        let host = cpal::default_host();
        let dev = host
            .default_output_device()
            .ok_or_else(|| AudioIoError::Device("no output device".into()))?;
        let cfg = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        let rb = HeapRb::<f32>::new(sample_rate as usize); // ~1s
        let (prod, mut cons) = rb.split();

        let stream = dev
            .build_output_stream(
                &cfg,
                move |out: &mut [f32], _| {
                    for o in out.iter_mut() {
                        *o = cons.try_pop().unwrap_or(0.0);
                    }
                },
                move |err| {
                    warn!(error = %err, "playout stream error");
                },
                None,
            )
            .map_err(|e| AudioIoError::Device(e.to_string()))?;
        stream.play().map_err(|e| AudioIoError::Device(e.to_string()))?;

        *self.live.lock() = Some(Live { _stream: stream, prod });
        Ok(())
    }

    fn write_chunk(&self, samples: &[f64]) -> Result<(), AudioIoError> {
        let mut guard = self.live.lock();
        let live = guard.as_mut().ok_or(AudioIoError::Closed)?;
        for &s in samples {
            // a full buffer drops the tail of the chunk
            if live.prod.try_push(s.clamp(-1.0, 1.0) as f32).is_err() {
                break;
            }
        }
        Ok(())
    }

    fn close(&self) {
        self.live.lock().take();
    }
}
