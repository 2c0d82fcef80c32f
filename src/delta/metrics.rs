// src/delta/metrics.rs

//! Delta size accounting

/// Size figures of one built delta
#[derive(Debug, Clone, PartialEq)]
pub struct DeltaMetrics {
    pub old_size: u64,
    pub new_size: u64,
    pub delta_size: u64,
    pub compression_ratio: f64,
}

impl DeltaMetrics {
    /// Calculate metrics from sizes
    pub fn new(old_size: u64, new_size: u64, delta_size: u64) -> Self {
        let compression_ratio = if new_size > 0 {
            delta_size as f64 / new_size as f64
        } else {
            1.0
        };

        Self {
            old_size,
            new_size,
            delta_size,
            compression_ratio,
        }
    }

    /// A delta is only worth publishing when clearly smaller than the full archive
    pub fn is_worthwhile(&self, max_ratio: f64) -> bool {
        self.compression_ratio < max_ratio
    }

    /// Percentage of the full download a client saves
    pub fn savings_percentage(&self) -> f64 {
        (1.0 - self.compression_ratio) * 100.0
    }
}
