//! Export Controller
//!
//! Work queue, per-exporter watch tasks and the reconciler tying the
//! resolver, extractor and registry together.

pub mod queue;
pub mod reconciler;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use queue::WorkQueue;
pub use reconciler::{ExportReconciler, ReconcileOutcome, ReconcilerConfig};
pub use watch::{ActiveWatch, WatchContext};
