//! Lock-free data structures used to decouple writers from background
//! workers.
//!
//! The queue implements the Michael-Scott algorithm. The classic
//! formulation defeats ABA with tagged pointers; here safe reclamation
//! comes from epoch-based garbage collection instead, which also
//! guarantees that node memory is never reused while a reader can still
//! observe it.

pub mod queue;

pub use queue::LfQueue;
