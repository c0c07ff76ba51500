use anyhow::Result;

use crate::message::ConditionKind;

/// One camera frame, opaque to the relay core. Acquisition and decoding
/// happen upstream; the core only routes frames to detectors.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// Outcome of running one detector over one frame.
#[derive(Debug, Clone)]
pub struct Detection {
    pub present: bool,
    pub details: String,
}

impl Detection {
    pub fn clear() -> Self {
        Self {
            present: false,
            details: String::new(),
        }
    }

    pub fn positive(details: impl Into<String>) -> Self {
        Self {
            present: true,
            details: details.into(),
        }
    }
}

/// Contract required from each external detector (fire, damage, person).
///
/// Called at most once per frame per condition kind. Detectors must not
/// reach back into the core; they only report what they see.
pub trait Detector: Send {
    fn kind(&self) -> ConditionKind;
    fn detect(&mut self, frame: &Frame) -> Result<Detection>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysFire;

    impl Detector for AlwaysFire {
        fn kind(&self) -> ConditionKind {
            ConditionKind::Fire
        }

        fn detect(&mut self, _frame: &Frame) -> Result<Detection> {
            Ok(Detection::positive("1 fire/smoke instance"))
        }
    }

    #[test]
    fn test_detector_contract() {
        let frame = Frame {
            data: vec![0; 16],
            width: 4,
            height: 4,
        };
        let mut det = AlwaysFire;
        assert_eq!(det.kind(), ConditionKind::Fire);

        let detection = det.detect(&frame).unwrap();
        assert!(detection.present);
        assert_eq!(detection.details, "1 fire/smoke instance");
    }

    #[test]
    fn test_clear_detection() {
        let d = Detection::clear();
        assert!(!d.present);
        assert!(d.details.is_empty());
    }
}
