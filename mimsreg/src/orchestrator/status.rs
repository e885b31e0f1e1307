//! Per-image and per-set lifecycle states.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImageStatus {
    Preprocessing,
    Preprocessed,
    Registering,
    Registered,
    InvalidFile,
    OutsideCanvas,
    RegistrationIssue,
}

impl ImageStatus {
    /// States that count as accounted for when deciding whether a set is done.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ImageStatus::Registered | ImageStatus::InvalidFile | ImageStatus::OutsideCanvas
        )
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SetStatus {
    Preprocessing,
    Preprocessed,
    RoughAlignment,
    PartiallyRegistered,
    Registered,
}

/// Derives the set status from its images, first matching rule wins:
///
/// - no images: unchanged
/// - every image terminal: `REGISTERED`
/// - any image registered: `PARTIALLY_REGISTERED`
/// - any image registering, with a registration issue or outside the canvas: `ROUGH_ALIGNMENT`
/// - no image still preprocessing: `PREPROCESSED`
/// - otherwise unchanged
pub fn aggregate_set_status(images: &[ImageStatus], previous: SetStatus) -> SetStatus {
    if images.is_empty() {
        return previous;
    }
    if images.iter().all(|s| s.is_terminal()) {
        return SetStatus::Registered;
    }
    if images.contains(&ImageStatus::Registered) {
        return SetStatus::PartiallyRegistered;
    }
    if images.iter().any(|s| {
        matches!(
            s,
            ImageStatus::Registering | ImageStatus::RegistrationIssue | ImageStatus::OutsideCanvas
        )
    }) {
        return SetStatus::RoughAlignment;
    }
    if !images.contains(&ImageStatus::Preprocessing) {
        return SetStatus::Preprocessed;
    }
    previous
}

#[cfg(test)]
mod tests {
    use super::*;
    use ImageStatus::*;

    #[test]
    fn test_status_strings() {
        assert_eq!(RegistrationIssue.to_string(), "REGISTRATION_ISSUE");
        assert_eq!(SetStatus::PartiallyRegistered.to_string(), "PARTIALLY_REGISTERED");
        let json = serde_json::to_string(&OutsideCanvas).unwrap();
        assert_eq!(json, "\"OUTSIDE_CANVAS\"");
        let back: SetStatus = serde_json::from_str("\"ROUGH_ALIGNMENT\"").unwrap();
        assert_eq!(back, SetStatus::RoughAlignment);
    }

    #[test]
    fn test_all_accounted_is_registered() {
        let status = aggregate_set_status(
            &[Registered, Registered, OutsideCanvas],
            SetStatus::PartiallyRegistered,
        );
        assert_eq!(status, SetStatus::Registered);
        assert_eq!(
            aggregate_set_status(&[InvalidFile, OutsideCanvas], SetStatus::RoughAlignment),
            SetStatus::Registered
        );
    }

    #[test]
    fn test_pending_image_keeps_set_partial() {
        let status = aggregate_set_status(
            &[Registered, Registered, Registering],
            SetStatus::RoughAlignment,
        );
        assert_eq!(status, SetStatus::PartiallyRegistered);
        assert_eq!(
            aggregate_set_status(&[Registered, RegistrationIssue], SetStatus::Registered),
            SetStatus::PartiallyRegistered
        );
    }

    #[test]
    fn test_rough_alignment_and_preprocessed() {
        assert_eq!(
            aggregate_set_status(&[Preprocessed, Registering], SetStatus::Preprocessed),
            SetStatus::RoughAlignment
        );
        assert_eq!(
            aggregate_set_status(&[Preprocessed, Preprocessed], SetStatus::Preprocessing),
            SetStatus::Preprocessed
        );
        assert_eq!(
            aggregate_set_status(&[Preprocessed, Preprocessing], SetStatus::Preprocessing),
            SetStatus::Preprocessing
        );
    }

    #[test]
    fn test_empty_set_keeps_previous() {
        assert_eq!(
            aggregate_set_status(&[], SetStatus::RoughAlignment),
            SetStatus::RoughAlignment
        );
    }
}
