//! Client stream building blocks
//!
//! Decoding of upstream SSE bodies, the event model shared with the
//! browser, answer cleaning, paced chunking and incremental persistence.

pub mod chunker;
pub mod clean;
pub mod decoder;
pub mod event;
pub mod persist;

pub use chunker::{chunk_text, Pacing};
pub use clean::{clean_text, detect_anomalies, ResponseAnomaly, TextAccumulator};
pub use decoder::{data_payload, LineDecoder};
pub use event::{parse_upstream_event, ProgressUpdate, StreamEvent};
pub use persist::MessagePersister;
