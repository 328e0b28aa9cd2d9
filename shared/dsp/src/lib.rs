//! Adaptive noise-cancellation DSP core.
//!
//! Pure numerics: no I/O, no threads. One [`AdaptiveFilter`] per session,
//! checkpointable through [`codec`].

pub mod algorithm;
pub mod anti_noise;
pub mod codec;
pub mod delay_line;
pub mod error;
pub mod filter;
pub mod rls;

pub use algorithm::{AlgorithmKind, AlgorithmParams, FilterConfig, NlmsParams, RlsParams};
pub use anti_noise::{
    rms, verify_cancellation, AntiNoiseGenerator, CancellationReport, MAX_REDUCTION_DB,
};
pub use codec::{decode_state, encode_state};
pub use delay_line::DelayLine;
pub use error::{CodecError, DspError, DspResult};
pub use filter::{AdaptiveFilter, AlgorithmState, FilterOutput, FilterState, HybridState};
pub use rls::{RlsState, SquareMatrix};
