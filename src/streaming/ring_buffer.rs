//! Bounded Byte Channel: a single-producer/single-consumer ring of
//! variable-length byte messages.
//!
//! Each message is stored as a 4-byte little-endian length header followed by
//! its payload, published with a single `push_slice` so the reader never sees
//! a header without its payload. The writer and reader halves are not `Clone`,
//! which keeps the channel single-writer/single-reader by construction.

use crate::defaults;
use crate::error::{DfStreamError, Result};
use crate::pipeline::idle::IdleStrategy;
use ringbuf::traits::{Consumer, Observer, Producer, Split};
use ringbuf::{HeapCons, HeapProd, HeapRb};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Length header size in bytes.
const HEADER_LEN: usize = 4;

/// Shared view of the number of payload bytes currently queued.
///
/// The writer adds before publishing and the reader subtracts after consuming,
/// so the gauge never under-reports.
#[derive(Debug, Clone, Default)]
pub struct RingGauge {
    queued: Arc<AtomicUsize>,
}

impl RingGauge {
    /// Approximate number of payload bytes queued.
    pub fn size(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Creates a channel holding `capacity` bytes (rounded up to a power of two).
///
/// The largest accepted message is `capacity / 8` bytes.
pub fn channel(capacity: usize) -> Result<(RingWriter, RingReader)> {
    if capacity < defaults::MIN_RING_CAPACITY {
        return Err(DfStreamError::CapacityMisconfigured {
            message: format!(
                "ring capacity {} is below the minimum of {} bytes",
                capacity,
                defaults::MIN_RING_CAPACITY
            ),
        });
    }
    let capacity = capacity.next_power_of_two();
    let max_message_len = capacity / defaults::RING_MAX_MESSAGE_DIVISOR;

    let (producer, consumer) = HeapRb::<u8>::new(capacity).split();
    let gauge = RingGauge::default();

    let writer = RingWriter {
        producer,
        gauge: gauge.clone(),
        capacity,
        max_message_len,
        scratch: Vec::with_capacity(HEADER_LEN + max_message_len),
    };
    let reader = RingReader {
        consumer,
        gauge,
        max_message_len,
    };
    Ok((writer, reader))
}

/// Writing half of the channel.
pub struct RingWriter {
    producer: HeapProd<u8>,
    gauge: RingGauge,
    capacity: usize,
    max_message_len: usize,
    scratch: Vec<u8>,
}

impl RingWriter {
    /// Enqueues `msg` if there is room. Never blocks.
    ///
    /// Returns false when the ring is full or the message is larger than
    /// `max_message_len()`. Empty messages are accepted and dropped.
    pub fn write(&mut self, msg: &[u8]) -> bool {
        if msg.is_empty() {
            return true;
        }
        if msg.len() > self.max_message_len {
            tracing::warn!(
                len = msg.len(),
                max = self.max_message_len,
                "ring message exceeds maximum length, rejected"
            );
            return false;
        }
        let record_len = HEADER_LEN + msg.len();
        if self.producer.vacant_len() < record_len {
            return false;
        }

        self.scratch.clear();
        self.scratch
            .extend_from_slice(&(msg.len() as u32).to_le_bytes());
        self.scratch.extend_from_slice(msg);

        self.gauge.queued.fetch_add(msg.len(), Ordering::AcqRel);
        let pushed = self.producer.push_slice(&self.scratch);
        debug_assert_eq!(pushed, record_len);
        true
    }

    /// Writes `msg`, retrying with `idle` while the ring is full.
    ///
    /// Gives up and returns false once `cancel` returns true; the caller must
    /// treat that as "shutting down, stop sending".
    pub fn write_until(
        &mut self,
        msg: &[u8],
        cancel: impl Fn() -> bool,
        idle: IdleStrategy,
    ) -> bool {
        let mut idler = idle.idler();
        loop {
            if cancel() {
                return false;
            }
            if self.write(msg) {
                return true;
            }
            idler.idle();
        }
    }

    /// Largest message accepted by `write`.
    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }

    /// Total ring capacity in bytes, headers included.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Approximate number of payload bytes queued.
    pub fn size(&self) -> usize {
        self.gauge.size()
    }

    /// Shared gauge for liveness probes.
    pub fn gauge(&self) -> RingGauge {
        self.gauge.clone()
    }
}

/// Reading half of the channel.
pub struct RingReader {
    consumer: HeapCons<u8>,
    gauge: RingGauge,
    max_message_len: usize,
}

impl RingReader {
    /// Dequeues one message if available. Never blocks.
    pub fn read_if_available(&mut self) -> Option<Vec<u8>> {
        if self.consumer.occupied_len() < HEADER_LEN {
            return None;
        }

        let mut header = [0u8; HEADER_LEN];
        self.consumer.pop_slice(&mut header);
        let len = u32::from_le_bytes(header) as usize;

        // The writer publishes header and payload together.
        let mut msg = vec![0u8; len];
        let popped = self.consumer.pop_slice(&mut msg);
        debug_assert_eq!(popped, len);
        msg.truncate(popped);

        self.gauge.queued.fetch_sub(popped, Ordering::AcqRel);
        Some(msg)
    }

    /// Appends one message to `out` if available, returning its length.
    pub fn read_into(&mut self, out: &mut Vec<u8>) -> Option<usize> {
        let msg = self.read_if_available()?;
        out.extend_from_slice(&msg);
        Some(msg.len())
    }

    /// Approximate number of payload bytes queued.
    pub fn size(&self) -> usize {
        self.gauge.size()
    }

    pub fn is_empty(&self) -> bool {
        self.consumer.occupied_len() == 0
    }

    /// Largest message the writer accepts.
    pub fn max_message_len(&self) -> usize {
        self.max_message_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        let (writer, reader) = channel(5000).unwrap();
        assert_eq!(writer.capacity(), 8192);
        assert_eq!(writer.max_message_len(), 1024);
        assert_eq!(reader.max_message_len(), 1024);
    }

    #[test]
    fn rejects_tiny_capacity() {
        match channel(16) {
            Err(DfStreamError::CapacityMisconfigured { message }) => {
                assert!(message.contains("16"));
            }
            Ok(_) => panic!("expected capacity error"),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn messages_come_out_in_order_with_original_boundaries() {
        let (mut writer, mut reader) = channel(1024).unwrap();
        assert!(writer.write(&[1, 2, 3]));
        assert!(writer.write(&[4]));
        assert!(writer.write(&[5, 6]));

        assert_eq!(reader.read_if_available(), Some(vec![1, 2, 3]));
        assert_eq!(reader.read_if_available(), Some(vec![4]));
        assert_eq!(reader.read_if_available(), Some(vec![5, 6]));
        assert_eq!(reader.read_if_available(), None);
    }

    #[test]
    fn size_tracks_payload_bytes() {
        let (mut writer, mut reader) = channel(1024).unwrap();
        assert_eq!(writer.size(), 0);
        writer.write(&[0u8; 100]);
        writer.write(&[0u8; 28]);
        assert_eq!(writer.size(), 128);
        assert_eq!(reader.size(), 128);

        reader.read_if_available();
        assert_eq!(reader.size(), 28);
        reader.read_if_available();
        assert!(reader.is_empty());
        assert!(writer.gauge().is_empty());
    }

    #[test]
    fn write_fails_when_full_instead_of_blocking() {
        // 1024-byte ring, 128-byte max message: 7 records of 132 bytes fit.
        let (mut writer, mut reader) = channel(1024).unwrap();
        let msg = [7u8; 128];
        let mut written = 0;
        while writer.write(&msg) {
            written += 1;
        }
        assert_eq!(written, 7);

        reader.read_if_available();
        assert!(writer.write(&msg));
    }

    #[test]
    fn oversized_message_is_rejected() {
        let (mut writer, _reader) = channel(1024).unwrap();
        assert!(!writer.write(&[0u8; 129]));
        assert_eq!(writer.size(), 0);
    }

    #[test]
    fn empty_message_is_accepted_and_dropped() {
        let (mut writer, mut reader) = channel(1024).unwrap();
        assert!(writer.write(&[]));
        assert_eq!(reader.read_if_available(), None);
    }

    #[test]
    fn read_into_appends() {
        let (mut writer, mut reader) = channel(1024).unwrap();
        writer.write(&[9, 9]);
        let mut out = vec![1];
        assert_eq!(reader.read_into(&mut out), Some(2));
        assert_eq!(out, vec![1, 9, 9]);
        assert_eq!(reader.read_into(&mut out), None);
    }

    #[test]
    fn write_until_gives_up_once_cancelled() {
        let (mut writer, _reader) = channel(1024).unwrap();
        while writer.write(&[0u8; 128]) {}

        let cancel = AtomicBool::new(true);
        assert!(!writer.write_until(&[0u8; 128], || cancel.load(Ordering::SeqCst), IdleStrategy::Yield));
    }

    #[test]
    fn write_until_waits_for_reader() {
        let (mut writer, mut reader) = channel(1024).unwrap();
        while writer.write(&[0u8; 128]) {}

        let consumer = thread::spawn(move || {
            let mut drained = 0;
            while drained < 8 {
                if reader.read_if_available().is_some() {
                    drained += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let cancel = AtomicBool::new(false);
        assert!(writer.write_until(&[1u8; 128], || cancel.load(Ordering::SeqCst), IdleStrategy::Yield));
        consumer.join().unwrap();
    }

    #[test]
    fn concurrent_producer_consumer_preserves_every_byte() {
        let (mut writer, mut reader) = channel(256).unwrap();
        let total: usize = 10_000;

        let producer = thread::spawn(move || {
            let cancel = AtomicBool::new(false);
            let mut next = 0u8;
            let mut sent = 0;
            while sent < total {
                let len = (sent % 31 + 1).min(total - sent);
                let msg: Vec<u8> = (0..len)
                    .map(|_| {
                        next = next.wrapping_add(1);
                        next
                    })
                    .collect();
                assert!(writer.write_until(&msg, || cancel.load(Ordering::SeqCst), IdleStrategy::Yield));
                sent += len;
            }
        });

        let mut received = Vec::with_capacity(total);
        while received.len() < total {
            if reader.read_into(&mut received).is_none() {
                thread::yield_now();
            }
        }
        producer.join().unwrap();

        for (i, byte) in received.iter().enumerate() {
            assert_eq!(*byte, (i as u8).wrapping_add(1));
        }
    }
}
