use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

/// When a delivery is acknowledged, fixed for the lifetime of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AcknowledgeMode {
    /// Ack on receipt, before dispatch. Nothing is tracked.
    Immediate,
    /// Ack once the pipeline completes, whatever the result.
    #[default]
    AfterSuccess,
    /// Ack on success, nack on failure.
    FailureAware,
    /// Ack or nack only when downstream makes an explicit call.
    ExplicitSignal,
}

impl AcknowledgeMode {
    pub const ALL: [AcknowledgeMode; 4] = [
        AcknowledgeMode::Immediate,
        AcknowledgeMode::AfterSuccess,
        AcknowledgeMode::FailureAware,
        AcknowledgeMode::ExplicitSignal,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AcknowledgeMode::Immediate => "immediate",
            AcknowledgeMode::AfterSuccess => "after-success",
            AcknowledgeMode::FailureAware => "failure-aware",
            AcknowledgeMode::ExplicitSignal => "explicit-signal",
        }
    }

    /// Whether deliveries are registered with the tracker.
    pub fn tracks_deliveries(self) -> bool {
        self != AcknowledgeMode::Immediate
    }
}

impl fmt::Display for AcknowledgeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AcknowledgeMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        AcknowledgeMode::ALL
            .into_iter()
            .find(|mode| mode.as_str() == value)
            .ok_or_else(|| {
                format!(
                    "unknown acknowledge mode '{value}' (expected one of: immediate, after-success, failure-aware, explicit-signal)"
                )
            })
    }
}

/// Result reported for a dispatched delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    Failure,
    /// No signal has arrived yet.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Decision {
    Ack,
    Nack,
    Defer,
}

/// Terminal action for a delivery given its mode and outcome.
///
/// `Immediate` deliveries were acked at receipt, so every outcome maps to `Ack`.
/// For `ExplicitSignal` the outcome is the explicit call itself.
pub fn decide(mode: AcknowledgeMode, outcome: Outcome) -> Decision {
    match (mode, outcome) {
        (AcknowledgeMode::Immediate, _) => Decision::Ack,
        (_, Outcome::Pending) => Decision::Defer,
        (_, Outcome::Success) => Decision::Ack,
        (AcknowledgeMode::AfterSuccess, Outcome::Failure) => Decision::Ack,
        (AcknowledgeMode::FailureAware | AcknowledgeMode::ExplicitSignal, Outcome::Failure) => {
            Decision::Nack
        }
    }
}
