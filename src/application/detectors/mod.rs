//! Signal detectors. All of them are pure CPU: suspension points (store
//! queries, order-book fetches, sink delivery) stay in the processor.

pub mod consecutive;
pub mod imbalance;
pub mod priority;
pub mod volume;
