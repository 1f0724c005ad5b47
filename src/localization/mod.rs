//! Visual localization: spatial query, descriptor matching, robust PnP and
//! gravity validation.

pub mod localizer;
pub mod result;

pub use localizer::{FeatureLocalizer, LocalizerConfig};
pub use result::{LocalizeDiagnostics, LocalizeFailure, LocalizeOutcome};
