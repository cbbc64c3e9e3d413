//! WebSocket progress streams.
//!
//! Each connection follows one job: it receives that job's
//! [`ProgressEvent`](qsim_events::ProgressEvent)s as JSON text frames and
//! is closed by the server after the terminal event.

mod handler;

pub use handler::progress_stream;
