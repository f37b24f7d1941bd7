//! Fixed-capacity slot ring shared by one producer and one consumer.
//!
//! Each slot carries a FREE/FILLED flag, a fixed 64-byte header region
//! holding a [`BlockHeader`], and an 8-byte aligned payload region. Slot
//! ownership moves with the flag: the producer only touches a slot between
//! observing FREE and calling [`FreeSlot::set_filled`]; the consumer only
//! between observing FILLED and calling [`FilledSlot::set_free`]. Both ends
//! walk the slots strictly round-robin.
//!
//! Dropping either end closes the ring. The consumer drains every FILLED
//! slot before reporting end of stream; the producer stops handing out
//! slots.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use bytemuck::{Pod, Zeroable};

use crate::block::{BlockShape, BlockTiming};
use crate::cancel::CancelToken;
use crate::error::{FoldError, Result};

pub const HEADER_BYTES: usize = 64;

/// Interval at which blocked waits re-check cancellation and closure.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum BlockMode {
    /// Raw `[sample][pol][chan]` 8-bit samples.
    Search = 0,
    /// An encoded fold accumulator (see `FoldAccumulator::encode_into`).
    Fold = 1,
}

impl BlockMode {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(BlockMode::Search),
            1 => Ok(BlockMode::Fold),
            other => Err(FoldError::Io(format!("unknown block mode {other} in slot header"))),
        }
    }
}

/// Fixed-layout slot header. `nsamp` holds the bin count for fold payloads.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct BlockHeader {
    pub packet_index: u64,
    pub offs: f64,
    pub tsubint: f64,
    pub tsamp: f64,
    pub drop_frac: f64,
    /// Bytes of payload in use.
    pub payload_len: u64,
    pub mode: u32,
    pub nsamp: u32,
    pub npol: u32,
    pub nchan: u32,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_BYTES);

impl BlockHeader {
    pub fn search(packet_index: u64, timing: BlockTiming, shape: BlockShape, drop_frac: f64) -> Self {
        Self {
            packet_index,
            offs: timing.offs,
            tsubint: timing.tsubint,
            tsamp: timing.tsamp,
            drop_frac,
            payload_len: shape.len() as u64,
            mode: BlockMode::Search as u32,
            nsamp: shape.nsamp as u32,
            npol: shape.npol as u32,
            nchan: shape.nchan as u32,
        }
    }

    pub fn fold(packet_index: u64, timing: BlockTiming, nbin: usize, npol: usize, nchan: usize) -> Self {
        let words = crate::accumulator::FoldAccumulator::encoded_words(nchan, npol, nbin);
        Self {
            packet_index,
            offs: timing.offs,
            tsubint: timing.tsubint,
            tsamp: timing.tsamp,
            drop_frac: 0.0,
            payload_len: (words * 8) as u64,
            mode: BlockMode::Fold as u32,
            nsamp: nbin as u32,
            npol: npol as u32,
            nchan: nchan as u32,
        }
    }

    pub fn mode(&self) -> Result<BlockMode> {
        BlockMode::from_raw(self.mode)
    }

    pub fn timing(&self) -> BlockTiming {
        BlockTiming {
            offs: self.offs,
            tsubint: self.tsubint,
            tsamp: self.tsamp,
        }
    }

    pub fn shape(&self) -> BlockShape {
        BlockShape::new(self.nsamp as usize, self.npol as usize, self.nchan as usize)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SlotState {
    Free,
    Filled,
}

struct SlotBuffer {
    header: [u8; HEADER_BYTES],
    payload: Vec<u64>,
}

struct Slot {
    state: Mutex<SlotState>,
    changed: Condvar,
    buf: Mutex<SlotBuffer>,
}

struct RingShared {
    slots: Box<[Slot]>,
    closed: AtomicBool,
}

impl RingShared {
    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        for slot in self.slots.iter() {
            // Taking the lock orders the flag store before any waiter's re-check.
            let _guard = slot.state.lock();
            slot.changed.notify_all();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn filled_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.lock().map(|st| *st == SlotState::Filled).unwrap_or(false))
            .count()
    }
}

fn poisoned<T>(_: T) -> FoldError {
    FoldError::Concurrency("ring slot lock poisoned".into())
}

/// Create a ring of `n_block` slots, each able to hold `payload_bytes`.
pub fn ring(n_block: usize, payload_bytes: usize) -> Result<(RingProducer, RingConsumer)> {
    if n_block == 0 {
        return Err(FoldError::Setup("ring needs at least one slot".into()));
    }
    let words = payload_bytes.div_ceil(8);
    let slots = (0..n_block)
        .map(|_| Slot {
            state: Mutex::new(SlotState::Free),
            changed: Condvar::new(),
            buf: Mutex::new(SlotBuffer {
                header: [0; HEADER_BYTES],
                payload: vec![0; words],
            }),
        })
        .collect();
    let shared = Arc::new(RingShared {
        slots,
        closed: AtomicBool::new(false),
    });
    Ok((
        RingProducer {
            shared: Arc::clone(&shared),
            cursor: 0,
        },
        RingConsumer { shared, cursor: 0 },
    ))
}

/// Block on `slot` until it reaches `want`, the ring closes or `cancel` fires.
/// Returns `false` on closure.
fn wait_for(shared: &RingShared, slot: &Slot, want: SlotState, cancel: &CancelToken) -> Result<bool> {
    let mut state = slot.state.lock().map_err(poisoned)?;
    loop {
        if *state == want {
            return Ok(true);
        }
        if shared.is_closed() {
            return Ok(false);
        }
        cancel.check()?;
        state = slot
            .changed
            .wait_timeout(state, POLL_INTERVAL)
            .map_err(poisoned)?
            .0;
    }
}

fn mark(slot: &Slot, to: SlotState) -> Result<()> {
    let mut state = slot.state.lock().map_err(poisoned)?;
    *state = to;
    slot.changed.notify_all();
    Ok(())
}

pub struct RingConsumer {
    shared: Arc<RingShared>,
    cursor: usize,
}

impl RingConsumer {
    pub fn n_block(&self) -> usize {
        self.shared.slots.len()
    }

    /// Slot the next [`wait_filled`](Self::wait_filled) will return.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Block until the next slot is FILLED. `Ok(None)` once the producer has
    /// closed the ring and every filled slot has been consumed;
    /// `Err(Cancelled)` if `cancel` fires while waiting.
    pub fn wait_filled(&mut self, cancel: &CancelToken) -> Result<Option<FilledSlot<'_>>> {
        let shared: &RingShared = &self.shared;
        let cursor = &mut self.cursor;
        let index = *cursor;
        let slot = &shared.slots[index];
        if !wait_for(shared, slot, SlotState::Filled, cancel)? {
            return Ok(None);
        }
        let buf = slot
            .buf
            .try_lock()
            .map_err(|_| FoldError::Concurrency(format!("slot {index} FILLED but still held by producer")))?;
        Ok(Some(FilledSlot {
            index,
            shared,
            slot,
            cursor,
            buf,
        }))
    }

    pub fn filled_count(&self) -> usize {
        self.shared.filled_count()
    }

    pub fn close(&self) {
        self.shared.close();
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Consumer's exclusive view of a FILLED slot.
///
/// Dropping it without [`set_free`](Self::set_free) leaves the slot FILLED;
/// the next `wait_filled` returns it again.
pub struct FilledSlot<'a> {
    index: usize,
    shared: &'a RingShared,
    slot: &'a Slot,
    cursor: &'a mut usize,
    buf: MutexGuard<'a, SlotBuffer>,
}

impl FilledSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn header(&self) -> BlockHeader {
        bytemuck::pod_read_unaligned(&self.buf.header)
    }

    pub fn payload(&self) -> &[u64] {
        &self.buf.payload
    }

    pub fn payload_mut(&mut self) -> &mut [u64] {
        &mut self.buf.payload
    }

    pub fn payload_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.buf.payload)
    }

    pub fn payload_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.buf.payload)
    }

    /// FILLED slots across the ring, including this one.
    pub fn ring_filled(&self) -> usize {
        self.shared.filled_count()
    }

    /// Hand the slot back to the producer and advance to the next one.
    pub fn set_free(self) -> Result<()> {
        let FilledSlot {
            slot, cursor, buf, shared, ..
        } = self;
        drop(buf);
        mark(slot, SlotState::Free)?;
        *cursor = (*cursor + 1) % shared.slots.len();
        Ok(())
    }
}

pub struct RingProducer {
    shared: Arc<RingShared>,
    cursor: usize,
}

impl RingProducer {
    pub fn n_block(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Block until the next slot is FREE (backpressure). `Ok(None)` if the
    /// ring has been closed.
    pub fn wait_free(&mut self, cancel: &CancelToken) -> Result<Option<FreeSlot<'_>>> {
        let shared: &RingShared = &self.shared;
        let cursor = &mut self.cursor;
        let index = *cursor;
        let slot = &shared.slots[index];
        if shared.is_closed() || !wait_for(shared, slot, SlotState::Free, cancel)? {
            return Ok(None);
        }
        let buf = slot
            .buf
            .try_lock()
            .map_err(|_| FoldError::Concurrency(format!("slot {index} FREE but still held by consumer")))?;
        Ok(Some(FreeSlot {
            index,
            n_block: shared.slots.len(),
            slot,
            cursor,
            buf,
        }))
    }

    /// Mark end of stream. The consumer drains what is already FILLED.
    pub fn close(&self) {
        self.shared.close();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.shared.close();
    }
}

/// Producer's exclusive view of a FREE slot.
pub struct FreeSlot<'a> {
    index: usize,
    n_block: usize,
    slot: &'a Slot,
    cursor: &'a mut usize,
    buf: MutexGuard<'a, SlotBuffer>,
}

impl FreeSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn capacity_bytes(&self) -> usize {
        self.buf.payload.len() * 8
    }

    pub fn payload_mut(&mut self) -> &mut [u64] {
        &mut self.buf.payload
    }

    pub fn payload_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.buf.payload)
    }

    /// Publish the payload with `header` and advance to the next slot.
    pub fn set_filled(self, header: &BlockHeader) -> Result<()> {
        let FreeSlot {
            mut buf,
            slot,
            cursor,
            n_block,
            ..
        } = self;
        buf.header.copy_from_slice(bytemuck::bytes_of(header));
        drop(buf);
        mark(slot, SlotState::Filled)?;
        *cursor = (*cursor + 1) % n_block;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::thread;

    fn header(i: u64) -> BlockHeader {
        BlockHeader::search(
            i,
            BlockTiming {
                offs: i as f64 + 0.5,
                tsubint: 1.0,
                tsamp: 0.25,
            },
            BlockShape::new(4, 1, 2),
            0.0,
        )
    }

    #[test]
    fn test_header_is_64_bytes_and_survives_slot() {
        let (mut tx, mut rx) = ring(2, 16).unwrap();
        let cancel = CancelToken::new();
        let mut slot = tx.wait_free(&cancel).unwrap().unwrap();
        slot.payload_bytes_mut()[..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        slot.set_filled(&header(7)).unwrap();

        let filled = rx.wait_filled(&cancel).unwrap().unwrap();
        assert_eq!(filled.index(), 0);
        assert_eq!(filled.header(), header(7));
        assert_eq!(filled.header().mode().unwrap(), BlockMode::Search);
        assert_eq!(&filled.payload_bytes()[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(filled.ring_filled(), 1);
        filled.set_free().unwrap();
        assert_eq!(rx.cursor(), 1);
        assert_eq!(rx.filled_count(), 0);
    }

    #[test]
    fn test_unknown_mode_rejected() {
        let h = BlockHeader {
            mode: 9,
            ..BlockHeader::default()
        };
        assert!(h.mode().is_err());
    }

    #[test]
    fn test_dropped_guard_does_not_advance() {
        let (mut tx, mut rx) = ring(3, 8).unwrap();
        let cancel = CancelToken::new();
        tx.wait_free(&cancel).unwrap().unwrap().set_filled(&header(0)).unwrap();
        {
            let slot = rx.wait_filled(&cancel).unwrap().unwrap();
            assert_eq!(slot.index(), 0);
        }
        let again = rx.wait_filled(&cancel).unwrap().unwrap();
        assert_eq!(again.index(), 0);
    }

    #[test]
    fn test_close_drains_filled_slots_first() {
        let (mut tx, mut rx) = ring(4, 8).unwrap();
        let cancel = CancelToken::new();
        for i in 0..2 {
            tx.wait_free(&cancel).unwrap().unwrap().set_filled(&header(i)).unwrap();
        }
        drop(tx);
        for i in 0..2 {
            let slot = rx.wait_filled(&cancel).unwrap().unwrap();
            assert_eq!(slot.header().packet_index, i);
            slot.set_free().unwrap();
        }
        assert!(rx.wait_filled(&cancel).unwrap().is_none());
    }

    #[test]
    fn test_consumer_drop_releases_producer() {
        let (mut tx, rx) = ring(1, 8).unwrap();
        let cancel = CancelToken::new();
        tx.wait_free(&cancel).unwrap().unwrap().set_filled(&header(0)).unwrap();
        let handle = thread::spawn(move || {
            let cancel = CancelToken::new();
            let released = tx.wait_free(&cancel).map(|s| s.is_none());
            released
        });
        drop(rx);
        assert!(handle.join().unwrap().unwrap());
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let (_tx, mut rx) = ring(2, 8).unwrap();
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            trigger.cancel();
        });
        assert!(matches!(rx.wait_filled(&cancel), Err(FoldError::Cancelled)));
        handle.join().unwrap();
    }

    #[test]
    fn test_randomized_interleaving_preserves_order_and_contents() {
        const N: u64 = 400;
        let (mut tx, mut rx) = ring(3, 64).unwrap();
        let cancel = CancelToken::new();

        let producer_cancel = cancel.clone();
        let producer = thread::spawn(move || {
            let mut rng = StdRng::seed_from_u64(7);
            for i in 0..N {
                let mut slot = tx.wait_free(&producer_cancel).unwrap().unwrap();
                // Fill the whole payload with the sequence number; a torn
                // read would show mixed values.
                slot.payload_mut().fill(i);
                if rng.random_range(0..4) == 0 {
                    thread::sleep(Duration::from_micros(rng.random_range(0..200)));
                }
                slot.set_filled(&header(i)).unwrap();
                if rng.random_bool(0.3) {
                    thread::yield_now();
                }
            }
        });

        let mut rng = StdRng::seed_from_u64(11);
        let mut seen = 0u64;
        while let Some(mut slot) = rx.wait_filled(&cancel).unwrap() {
            let h = slot.header();
            assert_eq!(h.packet_index, seen);
            assert_eq!(slot.index() as u64, seen % 3);
            assert!(slot.payload().iter().all(|&w| w == seen));
            if rng.random_range(0..4) == 0 {
                thread::sleep(Duration::from_micros(rng.random_range(0..200)));
            }
            // Scribble before release; the producer must not see this slot
            // until it is FREE again.
            slot.payload_mut().fill(u64::MAX);
            slot.set_free().unwrap();
            seen += 1;
        }
        producer.join().unwrap();
        assert_eq!(seen, N);
    }
}
