// Downstream audio sink boundary
//
// The broadcast engine consumes chunks through `AudioSink`. Submission never
// blocks the pacing thread: a full or unavailable sink rejects the chunk and
// the caller moves on to the next deadline.

use rtrb::{Consumer, Producer, PushError, RingBuffer};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::generator::AudioChunk;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("Audio sink queue is full")]
    QueueFull,

    #[error("Audio sink unavailable: {0}")]
    Unavailable(String),
}

/// Accepts one chunk at a time; may reject without blocking.
pub trait AudioSink: Send + Sync {
    fn submit_audio(&self, chunk: AudioChunk) -> Result<(), SinkError>;
}

/// Bounded lock-free queue between the pacing thread and an engine thread.
///
/// The consumer half goes to whoever encodes and transmits the audio.
pub struct RingBufferSink {
    producer: Mutex<Producer<AudioChunk>>,
    capacity: usize,
    rejected: AtomicU64,
}

impl RingBufferSink {
    /// Create a sink holding at most `capacity` chunks
    pub fn new(capacity: usize) -> (Self, Consumer<AudioChunk>) {
        let (producer, consumer) = RingBuffer::<AudioChunk>::new(capacity);
        let sink = Self {
            producer: Mutex::new(producer),
            capacity,
            rejected: AtomicU64::new(0),
        };
        (sink, consumer)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Chunks turned away because the queue was full or the consumer was gone
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

impl AudioSink for RingBufferSink {
    fn submit_audio(&self, chunk: AudioChunk) -> Result<(), SinkError> {
        let mut producer = self
            .producer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if producer.is_abandoned() {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(SinkError::Unavailable("consumer dropped".to_string()));
        }

        match producer.push(chunk) {
            Ok(()) => Ok(()),
            Err(PushError::Full(_)) => {
                self.rejected.fetch_add(1, Ordering::Relaxed);
                Err(SinkError::QueueFull)
            }
        }
    }
}
