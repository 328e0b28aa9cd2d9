use anc_dsp::{AdaptiveFilter, FilterConfig, RlsParams};
use rand::{rngs::StdRng, Rng, SeedableRng};

const SAMPLE_RATE: usize = 48_000;
const CHUNK: usize = 1024;

fn white(seed: u64, n: usize) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn power(x: &[f64]) -> f64 {
    x.iter().map(|v| v * v).sum::<f64>() / x.len() as f64
}

#[test]
fn nlms_reaches_20db_on_delayed_reference() {
    // 0.4 ms at 48 kHz
    let delay = (0.0004 * SAMPLE_RATE as f64).round() as usize;
    let n = 2 * SAMPLE_RATE;
    let reference = white(42, n);
    let desired: Vec<f64> = (0..n)
        .map(|i| if i >= delay { reference[i - delay] } else { 0.0 })
        .collect();

    let mut filter = AdaptiveFilter::new(&FilterConfig::nlms(64, 0.5, 1e-6).unwrap());
    let mut errors = Vec::with_capacity(n);
    for (r, d) in reference.chunks(CHUNK).zip(desired.chunks(CHUNK)) {
        let out = filter.process(r, d).unwrap();
        errors.extend(out.error);
    }

    let window = SAMPLE_RATE / 10;
    let residual = power(&errors[n - window..]);
    let input = power(&reference[n - window..]);
    let reduction_db = 10.0 * (input / residual).log10();
    assert!(reduction_db >= 20.0, "reduction {reduction_db:.1} dB");
}

#[test]
fn rls_stays_finite_over_random_input() {
    let params = RlsParams {
        forgetting_factor: 0.99,
        ..RlsParams::default()
    };
    let mut filter = AdaptiveFilter::new(&FilterConfig::rls(16, params).unwrap());
    let x = white(7, 10_000);
    let d = white(8, 10_000);
    for (xc, dc) in x.chunks(500).zip(d.chunks(500)) {
        let out = filter.process(xc, dc).unwrap();
        assert!(out.output.iter().chain(&out.error).all(|v| v.is_finite()));
        assert!(filter.weights().iter().all(|w| w.is_finite()));
    }
    assert_eq!(filter.iteration_count(), 10_000);
}

#[test]
fn rls_recovers_from_long_silence() {
    // silence with lambda < 1 inflates P geometrically until the health
    // check at iteration 1000 resets it
    let params = RlsParams {
        forgetting_factor: 0.5,
        ..RlsParams::default()
    };
    let mut filter = AdaptiveFilter::new(&FilterConfig::rls(4, params).unwrap());
    let silence = vec![0.0; 1_000];
    filter.process(&silence, &silence).unwrap();
    assert_eq!(filter.rls_resets(), 1);

    let x = white(9, 2_000);
    let out = filter.process(&x, &x).unwrap();
    assert!(out.output.iter().all(|v| v.is_finite()));
    assert!(filter.weights().iter().all(|w| w.is_finite()));
}
