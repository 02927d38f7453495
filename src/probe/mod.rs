/// HTTP liveness probes
pub mod prober;

/// Majority-rule health classification
pub mod classifier;

/// Where observations come from
pub mod source;

pub use classifier::classify;
pub use prober::Prober;
pub use source::ObservationSource;
