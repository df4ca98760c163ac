//! Pre-forwarding guard stage: a hidden-Unicode scrub followed by an
//! external content-guard HTTP call.

pub mod content_guard;
pub mod hidden_unicode;

pub use content_guard::{ContentGuardClient, GuardDecision};
pub use hidden_unicode::{apply, extract_message_texts, GuardMode, GuardOutcome};
