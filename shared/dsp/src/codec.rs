//! Binary checkpoint record for [`FilterState`].
//!
//! Layout (little endian):
//!   0:  [u8; 4] magic "ANCF"
//!   4:  u8      version (currently 1)
//!   5:  u8      algorithm tag
//!   6:  u32     order
//!   10: u64     iteration count
//!   18: u32     delay line write index
//!   22: u32 len + f64 * len   weights
//!   ..: u32 len + f64 * len   reference buffer (slot order)
//!   ..: algorithm parameters (fixed per tag)
//!   ..: RLS:    u32 len + f64 * len  inverse correlation (order * order)
//!       Hybrid: nlms weights, rls weights, inverse correlation (same framing)
//!
//! Stored length fields are never trusted: every vector must match `order`
//! (or `order * order`) or the record is rejected.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::algorithm::{AlgorithmKind, NlmsParams, RlsParams};
use crate::delay_line::DelayLine;
use crate::error::{CodecError, DspError, DspResult};
use crate::filter::{AlgorithmState, FilterState, HybridState};
use crate::rls::{RlsState, SquareMatrix};

pub const MAGIC: &[u8; 4] = b"ANCF";
pub const VERSION: u8 = 1;

pub fn encode_state(state: &FilterState) -> Bytes {
    let order = state.order();
    let mut buf = BytesMut::with_capacity(encoded_len_hint(state));
    buf.put_slice(MAGIC);
    buf.put_u8(VERSION);
    buf.put_u8(state.kind().tag());
    buf.put_u32_le(order as u32);
    buf.put_u64_le(state.iteration_count);
    buf.put_u32_le(state.reference.write_index() as u32);
    put_vec(&mut buf, &state.weights);
    put_vec(&mut buf, state.reference.raw());

    match &state.algorithm {
        AlgorithmState::Lms { step_size } => buf.put_f64_le(*step_size),
        AlgorithmState::Nlms(p) => put_nlms(&mut buf, p),
        AlgorithmState::Rls(r) => {
            put_rls(&mut buf, &r.params);
            put_vec(&mut buf, r.inverse_correlation.as_slice());
        }
        AlgorithmState::Hybrid(h) => {
            buf.put_f64_le(h.nlms_weight);
            buf.put_f64_le(h.rls_weight);
            put_nlms(&mut buf, &h.nlms);
            put_rls(&mut buf, &h.rls.params);
            put_vec(&mut buf, &h.nlms_weights);
            put_vec(&mut buf, &h.rls_weights);
            put_vec(&mut buf, h.rls.inverse_correlation.as_slice());
        }
    }
    buf.freeze()
}

pub fn decode_state(mut buf: &[u8]) -> DspResult<FilterState> {
    need(buf, 4)?;
    if &buf[..4] != MAGIC {
        return Err(CodecError::BadMagic.into());
    }
    buf.advance(4);

    need(buf, 2 + 4 + 8 + 4)?;
    let version = buf.get_u8();
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version).into());
    }
    let tag = buf.get_u8();
    let kind = AlgorithmKind::from_tag(tag).ok_or(CodecError::UnknownKind(tag))?;
    let order = buf.get_u32_le() as usize;
    if order == 0 {
        return Err(CodecError::InvalidValue("order").into());
    }
    let iteration_count = buf.get_u64_le();
    let write_index = buf.get_u32_le() as usize;

    let weights = get_vec(&mut buf, "weights", order)?;
    let raw_reference = get_vec(&mut buf, "reference", order)?;
    let reference = DelayLine::from_parts(raw_reference, write_index)
        .map_err(|_| CodecError::InvalidValue("write index"))?;

    let algorithm = match kind {
        AlgorithmKind::Lms => AlgorithmState::Lms {
            step_size: get_f64(&mut buf)?,
        },
        AlgorithmKind::Nlms => AlgorithmState::Nlms(get_nlms(&mut buf)?),
        AlgorithmKind::Rls => {
            let params = get_rls(&mut buf)?;
            let p = get_matrix(&mut buf, order)?;
            AlgorithmState::Rls(RlsState {
                params,
                inverse_correlation: p,
            })
        }
        AlgorithmKind::Hybrid => {
            let nlms_weight = get_f64(&mut buf)?;
            let rls_weight = get_f64(&mut buf)?;
            let nlms = get_nlms(&mut buf)?;
            let rls_params = get_rls(&mut buf)?;
            let nlms_weights = get_vec(&mut buf, "nlms weights", order)?;
            let rls_weights = get_vec(&mut buf, "rls weights", order)?;
            let p = get_matrix(&mut buf, order)?;
            AlgorithmState::Hybrid(HybridState {
                nlms_weight,
                rls_weight,
                nlms,
                nlms_weights,
                rls_weights,
                rls: RlsState {
                    params: rls_params,
                    inverse_correlation: p,
                },
            })
        }
    };

    if buf.has_remaining() {
        return Err(CodecError::Trailing(buf.remaining()).into());
    }

    let state = FilterState {
        weights,
        reference,
        algorithm,
        iteration_count,
    };
    state
        .validate()
        .map_err(|_| DspError::from(CodecError::InvalidValue("parameters")))?;
    Ok(state)
}

fn encoded_len_hint(state: &FilterState) -> usize {
    let order = state.order();
    let matrices = match state.kind() {
        AlgorithmKind::Rls => order * order,
        AlgorithmKind::Hybrid => order * order + 2 * order,
        _ => 0,
    };
    64 + 8 * (2 * order + matrices)
}

fn put_vec(buf: &mut BytesMut, xs: &[f64]) {
    buf.put_u32_le(xs.len() as u32);
    for x in xs {
        buf.put_f64_le(*x);
    }
}

fn put_nlms(buf: &mut BytesMut, p: &NlmsParams) {
    buf.put_f64_le(p.step_size);
    buf.put_f64_le(p.epsilon);
}

fn put_rls(buf: &mut BytesMut, p: &RlsParams) {
    buf.put_f64_le(p.forgetting_factor);
    buf.put_f64_le(p.init_scale);
    buf.put_u64_le(p.health_check_interval);
    buf.put_f64_le(p.max_condition);
}

fn need(buf: &[u8], n: usize) -> Result<(), CodecError> {
    if buf.remaining() < n {
        Err(CodecError::Truncated)
    } else {
        Ok(())
    }
}

fn get_f64(buf: &mut &[u8]) -> Result<f64, CodecError> {
    need(buf, 8)?;
    Ok(buf.get_f64_le())
}

fn get_vec(buf: &mut &[u8], field: &'static str, expected: usize) -> Result<Vec<f64>, CodecError> {
    need(buf, 4)?;
    let len = buf.get_u32_le() as usize;
    if len != expected {
        return Err(CodecError::LengthField {
            field,
            order: expected,
            actual: len,
        });
    }
    need(buf, len.checked_mul(8).ok_or(CodecError::Truncated)?)?;
    let out: Vec<f64> = (0..len).map(|_| buf.get_f64_le()).collect();
    if out.iter().any(|v| !v.is_finite()) {
        return Err(CodecError::InvalidValue(field));
    }
    Ok(out)
}

fn get_matrix(buf: &mut &[u8], order: usize) -> Result<SquareMatrix, CodecError> {
    let n2 = order.checked_mul(order).ok_or(CodecError::InvalidValue("order"))?;
    let data = get_vec(buf, "inverse correlation", n2)?;
    SquareMatrix::from_vec(order, data).map_err(|_| CodecError::InvalidValue("inverse correlation"))
}

fn get_nlms(buf: &mut &[u8]) -> Result<NlmsParams, CodecError> {
    Ok(NlmsParams {
        step_size: get_f64(buf)?,
        epsilon: get_f64(buf)?,
    })
}

fn get_rls(buf: &mut &[u8]) -> Result<RlsParams, CodecError> {
    need(buf, 32)?;
    Ok(RlsParams {
        forgetting_factor: buf.get_f64_le(),
        init_scale: buf.get_f64_le(),
        health_check_interval: buf.get_u64_le(),
        max_condition: buf.get_f64_le(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::FilterConfig;
    use crate::filter::AdaptiveFilter;

    fn trained(kind: AlgorithmKind) -> FilterState {
        let mut f = AdaptiveFilter::new(&FilterConfig::with_kind(6, kind).unwrap());
        let x: Vec<f64> = (0..37).map(|i| ((i * 7919) % 13) as f64 / 13.0 - 0.5).collect();
        f.process(&x, &x).unwrap();
        f.snapshot()
    }

    #[test]
    fn restores_every_algorithm() {
        for kind in [
            AlgorithmKind::Lms,
            AlgorithmKind::Nlms,
            AlgorithmKind::Rls,
            AlgorithmKind::Hybrid,
        ] {
            let st = trained(kind);
            let back = decode_state(&encode_state(&st)).unwrap();
            assert_eq!(back, st, "{kind}");
        }
    }

    #[test]
    fn rejects_weights_longer_than_order() {
        let st = trained(AlgorithmKind::Nlms);
        let mut bytes = encode_state(&st).to_vec();
        // claim a smaller order than the stored vectors
        bytes[6..10].copy_from_slice(&5u32.to_le_bytes());
        let err = decode_state(&bytes).unwrap_err();
        assert!(matches!(
            err,
            DspError::Codec(CodecError::LengthField { field: "weights", .. })
        ));
    }

    #[test]
    fn rejects_truncation_and_garbage() {
        let bytes = encode_state(&trained(AlgorithmKind::Rls));
        for cut in [0, 3, 10, 30, bytes.len() - 1] {
            assert!(decode_state(&bytes[..cut]).is_err(), "cut at {cut}");
        }
        let mut bad = bytes.to_vec();
        bad[0] = b'X';
        assert_eq!(decode_state(&bad).unwrap_err(), DspError::from(CodecError::BadMagic));

        let mut bad = bytes.to_vec();
        bad[4] = 9;
        assert_eq!(
            decode_state(&bad).unwrap_err(),
            DspError::from(CodecError::UnsupportedVersion(9))
        );

        let mut long = bytes.to_vec();
        long.push(0);
        assert_eq!(decode_state(&long).unwrap_err(), DspError::from(CodecError::Trailing(1)));
    }

    #[test]
    fn rejects_non_finite_payload() {
        let st = trained(AlgorithmKind::Lms);
        let mut bytes = encode_state(&st).to_vec();
        // first weight sits right after the weights length field
        let off = 22 + 4;
        bytes[off..off + 8].copy_from_slice(&f64::NAN.to_le_bytes());
        assert!(decode_state(&bytes).is_err());
    }
}
