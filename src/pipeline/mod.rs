//! Batching and persistence of capture records.
//!
//! The capture thread appends to a [`RecordBatch`]; each full batch is handed
//! to the [`Flusher`] worker over a bounded queue and written to the store in
//! capture order.

pub mod batch;
pub mod flush;

pub use batch::RecordBatch;
pub use flush::{FlushHandle, FlushSummary, Flusher};
