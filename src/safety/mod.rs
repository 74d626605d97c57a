//! Safety policy applied before each block runs

pub mod confirm;
pub mod gate;

pub use confirm::{
    confirm_with_timeout, AutoApprove, AutoDeny, ChannelConfirmer, ConfirmationOutcome,
    ConfirmationRequest, ConfirmationVerdict, Confirmer, PendingConfirmation,
};
pub use gate::{SafetyDecision, SafetyGate, Verdict};
