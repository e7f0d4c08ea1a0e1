//! Reconcile Module - keeps stored referrer pointers in line with the ledger
//!
//! - `Reconciler`: one address, at most one pointer write
//! - `BatchDriver`: throttled sequential sweep with a retry pass

pub mod batch;
pub mod reconciler;

pub use batch::{BatchDriver, BatchMode, BatchProgress, BatchRun, StopHandle};
pub use reconciler::{ReconcileOutcome, Reconciler};
