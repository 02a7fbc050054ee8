//! Anomaly classification.

/// Packets strictly larger than this many bytes are flagged anomalous.
pub const ANOMALY_THRESHOLD_BYTES: u32 = 1500;

/// Decides whether a packet is anomalous from its size.
pub trait Classifier: Send + Sync {
    fn is_anomalous(&self, size_bytes: u32) -> bool;
}

/// Flags packets above a fixed byte threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeThreshold {
    threshold: u32,
}

impl SizeThreshold {
    pub const fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    pub const fn threshold(&self) -> u32 {
        self.threshold
    }
}

impl Default for SizeThreshold {
    fn default() -> Self {
        Self::new(ANOMALY_THRESHOLD_BYTES)
    }
}

impl Classifier for SizeThreshold {
    #[inline]
    fn is_anomalous(&self, size_bytes: u32) -> bool {
        size_bytes > self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_threshold_boundary() {
        let classifier = SizeThreshold::default();
        assert_eq!(classifier.threshold(), ANOMALY_THRESHOLD_BYTES);

        assert!(!classifier.is_anomalous(0));
        assert!(!classifier.is_anomalous(64));
        assert!(!classifier.is_anomalous(1500));
        assert!(classifier.is_anomalous(1501));
        assert!(classifier.is_anomalous(9000));
        assert!(classifier.is_anomalous(u32::MAX));
    }

    #[test]
    fn test_classifier_is_object_safe() {
        let classifier: Box<dyn Classifier> = Box::new(SizeThreshold::new(100));
        assert!(!classifier.is_anomalous(100));
        assert!(classifier.is_anomalous(101));
    }
}
