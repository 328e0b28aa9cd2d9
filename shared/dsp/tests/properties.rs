use anc_dsp::{
    rms, verify_cancellation, AdaptiveFilter, AlgorithmKind, AntiNoiseGenerator, FilterConfig,
};
use proptest::prelude::*;

fn samples() -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec(-1.0f64..1.0, 0..1024)
}

fn kind() -> impl Strategy<Value = AlgorithmKind> {
    prop_oneof![
        Just(AlgorithmKind::Lms),
        Just(AlgorithmKind::Nlms),
        Just(AlgorithmKind::Rls),
        Just(AlgorithmKind::Hybrid),
    ]
}

proptest! {
    #[test]
    fn unit_inversion_cancels_exactly(x in samples()) {
        let anti = AntiNoiseGenerator::phase_inversion().generate_anti_noise(&x, 1.0).unwrap();
        prop_assert_eq!(anti.len(), x.len());
        for (a, n) in anti.iter().zip(&x) {
            prop_assert_eq!(*a, -*n);
            prop_assert!((n + a).abs() <= 1e-10);
        }
        prop_assert!(verify_cancellation(&x, &anti).unwrap().is_perfect);
    }

    #[test]
    fn inversion_scales_by_amplitude(x in samples(), f in 0.0f64..4.0) {
        let anti = AntiNoiseGenerator::phase_inversion().generate_anti_noise(&x, f).unwrap();
        for (a, n) in anti.iter().zip(&x) {
            prop_assert_eq!(*a, -*n * f);
        }
        let original = rms(&x);
        prop_assume!(original > 1e-6);
        prop_assert!((rms(&anti) / original - f).abs() < 1e-9);
    }

    #[test]
    fn processing_is_deterministic(
        kind in kind(),
        warmup in prop::collection::vec(-1.0f64..1.0, 0..256),
        chunk in prop::collection::vec(-1.0f64..1.0, 1..256),
    ) {
        let cfg = FilterConfig::with_kind(8, kind).unwrap();
        let mut base = AdaptiveFilter::new(&cfg);
        let desired: Vec<f64> = warmup.iter().map(|v| 0.7 * v).collect();
        base.process(&warmup, &desired).unwrap();

        let mut a = AdaptiveFilter::from_state(base.snapshot()).unwrap();
        let mut b = AdaptiveFilter::from_state(base.snapshot()).unwrap();
        let d: Vec<f64> = chunk.iter().rev().copied().collect();
        let out_a = a.process(&chunk, &d).unwrap();
        let out_b = b.process(&chunk, &d).unwrap();

        prop_assert_eq!(out_a, out_b);
        prop_assert_eq!(a.snapshot(), b.snapshot());
    }
}
