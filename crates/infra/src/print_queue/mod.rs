//! Print Fulfillment Queue: print jobs consumed by external print workers.

pub mod postgres;
pub mod service;
pub mod store;
pub mod types;

pub use service::{PrintJobView, PrintQueue, PrintQueueError, download_path};
pub use store::PrintJobStore;
pub use types::{ClaimedPrintJob, PrintClaim, PrintJob, PrintJobStatus};
