//! Background work.
//!
//! - `queue`: bounded event queue with a supervised worker pool
//! - `reconcile`: periodic re-scan for conversations still unanswered

pub mod queue;
pub mod reconcile;

pub use queue::{EventHandler, EventQueue, QueueStats};
pub use reconcile::{ItemResult, ReconciliationScheduler, ScanReport, SchedulerState};
