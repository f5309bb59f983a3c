pub mod counters;
pub mod snapshot;
