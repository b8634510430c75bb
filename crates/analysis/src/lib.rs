//! Control-flow metrics used to gate and report obfuscation passes.

pub mod metrics;

pub use metrics::{collect_metrics, compare, Metrics};
