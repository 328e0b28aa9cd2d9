use anc_dsp::DspError;
use thiserror::Error;

use crate::audio_io::AudioIoError;
use crate::cache::CacheError;
use crate::classifier::ClassifierError;
use crate::pipeline::PipelineState;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("dsp: {0}")]
    Dsp(#[from] DspError),

    #[error("state cache: {0}")]
    Cache(#[from] CacheError),

    #[error("classifier: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("audio io: {0}")]
    Io(#[from] AudioIoError),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidState {
        from: PipelineState,
        to: PipelineState,
    },

    #[error("invalid config: {0}")]
    Config(String),

    #[error("thread spawn: {0}")]
    Spawn(#[from] std::io::Error),
}
