//! Lock-free chunk queue between capture and send
//!
//! Single-producer single-consumer: the capture thread pushes, the send
//! thread pops. Capture never waits on the network; when the queue is full
//! the newest chunk is dropped and counted.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One captured block of raw PCM
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub data: Bytes,
}

impl AudioChunk {
    pub fn new(data: Bytes) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Bounded queue of captured chunks
pub struct ChunkQueue {
    queue: ArrayQueue<AudioChunk>,
    overflow_count: AtomicUsize,
}

impl ChunkQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            overflow_count: AtomicUsize::new(0),
        }
    }

    /// Returns false (and counts an overflow) when the queue is full
    pub fn push(&self, chunk: AudioChunk) -> bool {
        match self.queue.push(chunk) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn pop(&self) -> Option<AudioChunk> {
        self.queue.pop()
    }

    /// Drop everything queued, returning how many chunks were discarded
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.queue.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }
}

pub type SharedChunkQueue = Arc<ChunkQueue>;

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(tag: u8) -> AudioChunk {
        AudioChunk::new(Bytes::from(vec![tag; 4]))
    }

    fn tag(chunk: Option<AudioChunk>) -> u8 {
        chunk.unwrap().data[0]
    }

    #[test]
    fn test_chunk_queue_fifo() {
        let queue = ChunkQueue::new(4);
        for tag in 0..3 {
            assert!(queue.push(chunk(tag)));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(tag(queue.pop()), 0);
        assert_eq!(tag(queue.pop()), 1);
        assert_eq!(tag(queue.pop()), 2);
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_chunk_queue_overflow_drops_newest() {
        let queue = ChunkQueue::new(2);
        assert!(queue.push(chunk(0)));
        assert!(queue.push(chunk(1)));
        assert!(!queue.push(chunk(2)));
        assert_eq!(queue.overflow_count(), 1);
        assert_eq!(tag(queue.pop()), 0);
    }

    #[test]
    fn test_chunk_queue_clear() {
        let queue = ChunkQueue::new(8);
        queue.push(chunk(0));
        queue.push(chunk(1));
        assert_eq!(queue.clear(), 2);
        assert!(queue.is_empty());
        assert_eq!(queue.capacity(), 8);
    }
}
