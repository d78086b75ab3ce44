//! devgrid-metrics — periodic resource utilization sampling.
//!
//! On a fixed interval, for every `running` environment on each
//! registered cluster, the sampler queries current utilization through
//! the cluster's API and appends a `MetricSample`. One environment's
//! failure never aborts sampling for the rest, and one cluster's failure
//! never aborts the others. Samples past the retention window are purged
//! after every round.

pub mod sampler;

pub use sampler::MetricsSampler;
