//! Tensor-level building blocks of the gated linear recurrence.
//!
//! Gate math runs in F32 internally and hands results back in the
//! caller's dtype. The two scan paths compute the same recurrence;
//! [`select_scan_mode`] picks between them.

pub mod chunk;
pub mod gate;
pub mod mode;
pub mod recurrent;

pub use chunk::chunk_scan;
pub use gate::{apply_decay_floor, log_sigmoid, logaddexp, swiglu};
pub use mode::{select_scan_mode, ScanMode, DEFAULT_CHUNK_SIZE, SHORT_SEQ_THRESHOLD};
pub use recurrent::recurrent_scan;
