//! Emergency bypass decision.
//!
//! Every chunk gets its own decision; nothing here is sticky. A classifier
//! failure never falls through to whatever the error path happens to do: it
//! resolves to the configured `OnClassifierFailure` policy.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::classifier::ClassifierError;
use crate::ids::SessionId;
use crate::notify::{EventPublisher, NotificationEvent};

/// Classifier output for one chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EmergencyVerdict {
    pub is_emergency: bool,
    pub category: String,
    pub confidence: f64,
}

impl EmergencyVerdict {
    pub fn emergency(category: impl Into<String>, confidence: f64) -> Self {
        Self {
            is_emergency: true,
            category: category.into(),
            confidence,
        }
    }

    pub fn clear() -> Self {
        Self {
            is_emergency: false,
            category: "background".to_string(),
            confidence: 1.0,
        }
    }

    /// Confidence must be a probability; anything else is a classifier fault.
    pub fn is_well_formed(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BypassReason {
    /// Emergency at or above the threshold.
    Emergency,
    /// Emergency reported, but not confidently enough.
    BelowThreshold,
    NotEmergency,
    /// Classifier failed; policy chose to let the audio through untouched.
    ClassifierFailureBypass,
    /// Classifier failed; policy chose to keep cancelling.
    ClassifierFailureCancel,
}

impl BypassReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Emergency => "emergency",
            Self::BelowThreshold => "below_threshold",
            Self::NotEmergency => "not_emergency",
            Self::ClassifierFailureBypass => "classifier_failure_bypass",
            Self::ClassifierFailureCancel => "classifier_failure_cancel",
        }
    }

    pub fn is_classifier_failure(self) -> bool {
        matches!(self, Self::ClassifierFailureBypass | Self::ClassifierFailureCancel)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BypassDecision {
    pub should_cancel_apply: bool,
    pub reason: BypassReason,
}

/// Bypass iff `is_emergency && confidence >= threshold`.
pub fn decide(verdict: &EmergencyVerdict, confidence_threshold: f64) -> BypassDecision {
    match (verdict.is_emergency, verdict.confidence >= confidence_threshold) {
        (true, true) => BypassDecision {
            should_cancel_apply: false,
            reason: BypassReason::Emergency,
        },
        (true, false) => BypassDecision {
            should_cancel_apply: true,
            reason: BypassReason::BelowThreshold,
        },
        (false, _) => BypassDecision {
            should_cancel_apply: true,
            reason: BypassReason::NotEmergency,
        },
    }
}

/// What to do with a chunk when no trustworthy verdict exists.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OnClassifierFailure {
    /// Fail open to safety: do not cancel, so an alarm stays audible.
    #[default]
    Bypass,
    /// Keep cancelling. Only for deployments that accept the risk.
    Cancel,
}

impl OnClassifierFailure {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bypass => "bypass",
            Self::Cancel => "cancel",
        }
    }

    fn decision(self) -> BypassDecision {
        match self {
            Self::Bypass => BypassDecision {
                should_cancel_apply: false,
                reason: BypassReason::ClassifierFailureBypass,
            },
            Self::Cancel => BypassDecision {
                should_cancel_apply: true,
                reason: BypassReason::ClassifierFailureCancel,
            },
        }
    }
}

impl fmt::Display for OnClassifierFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OnClassifierFailure {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bypass" => Ok(Self::Bypass),
            "cancel" => Ok(Self::Cancel),
            other => Err(format!("unknown classifier failure policy: {other}")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GateConfig {
    pub confidence_threshold: f64,
    pub on_classifier_failure: OnClassifierFailure,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.70,
            on_classifier_failure: OnClassifierFailure::Bypass,
        }
    }
}

/// Applies `decide` plus the failure policy, and announces bypasses.
///
/// Announcements go through a non-blocking publisher, so a slow or broken
/// notification sink cannot delay the bypass itself.
pub struct EmergencyGate {
    cfg: GateConfig,
    events: Arc<dyn EventPublisher>,
}

impl EmergencyGate {
    pub fn new(cfg: GateConfig, events: Arc<dyn EventPublisher>) -> Self {
        Self { cfg, events }
    }

    pub fn config(&self) -> &GateConfig {
        &self.cfg
    }

    pub fn evaluate(
        &self,
        session: &SessionId,
        seq: u64,
        verdict: Result<&EmergencyVerdict, &ClassifierError>,
    ) -> BypassDecision {
        let decision = match verdict {
            Ok(v) if v.is_well_formed() => decide(v, self.cfg.confidence_threshold),
            Ok(v) => {
                warn!(%session, seq, confidence = v.confidence, "malformed classifier verdict");
                self.cfg.on_classifier_failure.decision()
            }
            Err(e) => {
                warn!(
                    %session,
                    seq,
                    error = %e,
                    policy = %self.cfg.on_classifier_failure,
                    "classifier failed"
                );
                self.cfg.on_classifier_failure.decision()
            }
        };

        if !decision.should_cancel_apply {
            let (category, confidence) = match verdict {
                Ok(v) => (v.category.clone(), v.confidence),
                Err(_) => ("classifier_unavailable".to_string(), 0.0),
            };
            info!(
                %session,
                seq,
                %category,
                confidence,
                reason = decision.reason.as_str(),
                "cancellation bypassed"
            );
            self.events.publish(NotificationEvent::emergency_bypassed(
                session.clone(),
                seq,
                category,
                confidence,
            ));
        }
        decision
    }
}
