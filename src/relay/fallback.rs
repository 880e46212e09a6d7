//! Canned answer for an inactive workflow
//!
//! When the webhook reports that its workflow is not active the browser
//! still gets a complete stream: a short fabricated progress sequence, an
//! instructional answer and `done`.

use crate::stream::{chunk_text, ProgressUpdate, StreamEvent};
use crate::tracker::SIMULATED_STAGES;

/// Answer sent while the workflow is inactive
pub const FALLBACK_TEXT: &str = "The legal research service is not available right now \
because its workflow is not active.\n\n\
Please try again in a few minutes. If the problem persists, ask an administrator \
to activate the chat workflow in the workflow editor.";

/// Events of the fallback stream, in order
///
/// Text is pre-chunked with `chunk_size`; the caller paces delivery.
pub fn fallback_events(chunk_size: usize) -> Vec<StreamEvent> {
    let stages = SIMULATED_STAGES
        .iter()
        .map(|(stage, message, percent)| {
            StreamEvent::Status(ProgressUpdate::new(*stage, *message, *percent))
        });
    let text = chunk_text(FALLBACK_TEXT, chunk_size)
        .into_iter()
        .map(StreamEvent::text);

    stages
        .chain(text)
        .chain(std::iter::once(StreamEvent::done()))
        .collect()
}
