//! Fixed-size text chunking for paced delivery
//!
//! The browser renders answers with a typing effect, so text is always
//! re-chunked into a few characters per event regardless of how coarse or
//! fine the upstream delivered it.

use std::time::Duration;

/// Split `text` into pieces of at most `size` characters
///
/// Joining the pieces yields `text` again. A `size` of zero is treated as 1.
pub fn chunk_text(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let mut chunks = Vec::with_capacity(text.len() / size + 1);
    let mut current = String::new();
    let mut count = 0;
    for c in text.chars() {
        current.push(c);
        count += 1;
        if count == size {
            chunks.push(std::mem::take(&mut current));
            count = 0;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Chunk size and inter-chunk delay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pacing {
    pub chunk_size: usize,
    pub delay: Duration,
}

impl Pacing {
    pub fn new(chunk_size: usize, delay: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            delay,
        }
    }

    /// No delay between chunks
    pub fn immediate(chunk_size: usize) -> Self {
        Self::new(chunk_size, Duration::ZERO)
    }
}

impl From<&crate::config::StreamConfig> for Pacing {
    fn from(config: &crate::config::StreamConfig) -> Self {
        Self::new(
            config.chunk_size,
            Duration::from_millis(config.chunk_delay_ms),
        )
    }
}
