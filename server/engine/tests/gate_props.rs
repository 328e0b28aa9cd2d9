use anc_engine::{decide, BypassReason, EmergencyVerdict};
use proptest::prelude::*;

proptest! {
    #[test]
    fn bypass_iff_confident_emergency(
        is_emergency in any::<bool>(),
        confidence in 0.0f64..=1.0,
        threshold in 0.0f64..=1.0,
    ) {
        let v = EmergencyVerdict { is_emergency, category: "x".into(), confidence };
        let d = decide(&v, threshold);
        prop_assert_eq!(!d.should_cancel_apply, is_emergency && confidence >= threshold);
        prop_assert_eq!(d.reason == BypassReason::Emergency, !d.should_cancel_apply);
    }

    #[test]
    fn non_emergency_always_cancels(confidence in 0.0f64..=1.0) {
        let v = EmergencyVerdict { is_emergency: false, category: "traffic".into(), confidence };
        prop_assert!(decide(&v, 0.0).should_cancel_apply);
    }
}
