//! Shared-memory ring buffer.
//!
//! A power-of-two byte ring driven by four cursors: producers reserve a
//! range by CAS on `producer_reserve`, stage their bytes, then publish by
//! advancing `producer_commit` in ticket order. Consumers mirror the scheme
//! with `consumer_reserve`/`consumer_commit`. All cursors are free-running
//! `u32`s; positions are `cursor & (capacity - 1)` and distances are
//! wrapping subtractions bounded by the capacity.
//!
//! Orderings: reservations are AcqRel CAS; `producer_commit` is stored with
//! Release after staging so a consumer acquiring it observes the staged
//! bytes, and symmetrically for `consumer_commit` releasing the range back
//! to producers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};

use super::IpcError;

bitflags::bitflags! {
    /// Construction-time options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamOptions: u32 {
        const MULTIPLE_PRODUCERS = 1 << 0;
        const MULTIPLE_CONSUMERS = 1 << 1;
        const GLOBAL             = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Per-operation flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StreamFlags: u32 {
        /// Return instead of waiting for space/data.
        const NO_BLOCK      = 1 << 0;
        /// Return once at least one byte has been transferred.
        const ALLOW_PARTIAL = 1 << 1;
    }
}

const PACKET_PREFIX: u32 = 4;

pub struct StreamBuffer {
    data: Box<[UnsafeCell<u8>]>,
    mask: u32,
    options: StreamOptions,
    producer_reserve: AtomicU32,
    producer_commit: AtomicU32,
    consumer_reserve: AtomicU32,
    consumer_commit: AtomicU32,
    closed: AtomicBool,
    parker: Mutex<()>,
    signal: Condvar,
}

// The reserve/commit protocol hands every byte position to exactly one
// producer and later exactly one consumer, so the UnsafeCell accesses are
// disjoint between threads.
unsafe impl Send for StreamBuffer {}
unsafe impl Sync for StreamBuffer {}

impl StreamBuffer {
    /// `capacity` must be a power of two.
    pub fn new(capacity: u32, options: StreamOptions) -> Self {
        assert!(capacity.is_power_of_two(), "capacity must be a power of two");
        let data = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        StreamBuffer {
            data,
            mask: capacity - 1,
            options,
            producer_reserve: AtomicU32::new(0),
            producer_commit: AtomicU32::new(0),
            consumer_reserve: AtomicU32::new(0),
            consumer_commit: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            parker: Mutex::new(()),
            signal: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.mask + 1
    }

    pub fn options(&self) -> StreamOptions {
        self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the channel and wake every waiter.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify();
    }

    fn notify(&self) {
        let _guard = self.parker.lock().unwrap();
        self.signal.notify_all();
    }

    /// Park until `ready` holds or the channel closes. `ready` must be
    /// re-checkable; it is evaluated under the parker lock so a commit on
    /// the other side cannot slip between the check and the wait.
    fn wait_until(&self, mut ready: impl FnMut() -> bool) {
        let mut guard = self.parker.lock().unwrap();
        while !ready() && !self.is_closed() {
            guard = self.signal.wait(guard).unwrap();
        }
    }

    fn write_space(&self) -> u32 {
        let reserve = self.producer_reserve.load(Ordering::Acquire);
        let consumed = self.consumer_commit.load(Ordering::Acquire);
        self.capacity() - reserve.wrapping_sub(consumed)
    }

    fn read_available(&self) -> u32 {
        let committed = self.producer_commit.load(Ordering::Acquire);
        let reserved = self.consumer_reserve.load(Ordering::Acquire);
        committed.wrapping_sub(reserved)
    }

    fn stage(&self, start: u32, bytes: &[u8]) {
        for (index, &byte) in bytes.iter().enumerate() {
            let position = (start.wrapping_add(index as u32) & self.mask) as usize;
            unsafe { *self.data[position].get() = byte };
        }
    }

    fn unstage(&self, start: u32, out: &mut [u8]) {
        for (index, slot) in out.iter_mut().enumerate() {
            let position = (start.wrapping_add(index as u32) & self.mask) as usize;
            *slot = unsafe { *self.data[position].get() };
        }
    }

    /// Reserve up to `wanted` bytes for writing; returns `(start, count)`.
    fn reserve_write(&self, wanted: u32) -> (u32, u32) {
        loop {
            let reserve = self.producer_reserve.load(Ordering::Acquire);
            let consumed = self.consumer_commit.load(Ordering::Acquire);
            let space = self.capacity() - reserve.wrapping_sub(consumed);
            let count = wanted.min(space);
            if count == 0 {
                return (reserve, 0);
            }
            if self
                .producer_reserve
                .compare_exchange(
                    reserve,
                    reserve.wrapping_add(count),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return (reserve, count);
            }
        }
    }

    /// Publish `[start, start + count)`; waits for earlier tickets first.
    fn commit_write(&self, start: u32, count: u32) {
        while self.producer_commit.load(Ordering::Acquire) != start {
            std::hint::spin_loop();
        }
        self.producer_commit
            .store(start.wrapping_add(count), Ordering::Release);
        self.notify();
    }

    fn reserve_read(&self, wanted: u32) -> (u32, u32) {
        loop {
            let reserved = self.consumer_reserve.load(Ordering::Acquire);
            let committed = self.producer_commit.load(Ordering::Acquire);
            let available = committed.wrapping_sub(reserved);
            let count = wanted.min(available);
            if count == 0 {
                return (reserved, 0);
            }
            if self
                .consumer_reserve
                .compare_exchange(
                    reserved,
                    reserved.wrapping_add(count),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return (reserved, count);
            }
        }
    }

    fn commit_read(&self, start: u32, count: u32) {
        while self.consumer_commit.load(Ordering::Acquire) != start {
            std::hint::spin_loop();
        }
        self.consumer_commit
            .store(start.wrapping_add(count), Ordering::Release);
        self.notify();
    }

    /// Byte-stream write. Without flags the whole buffer is written,
    /// blocking for space; ALLOW_PARTIAL returns once something was
    /// written; NO_BLOCK never waits.
    pub fn write(&self, bytes: &[u8], flags: StreamFlags) -> Result<usize, IpcError> {
        let mut written = 0usize;
        while written < bytes.len() {
            if self.is_closed() {
                if written > 0 {
                    break;
                }
                return Err(IpcError::Closed);
            }

            let remaining = &bytes[written..];
            let (start, count) = self.reserve_write(remaining.len().min(u32::MAX as usize) as u32);
            if count > 0 {
                self.stage(start, &remaining[..count as usize]);
                self.commit_write(start, count);
                written += count as usize;
                if flags.contains(StreamFlags::ALLOW_PARTIAL) {
                    break;
                }
                continue;
            }

            if flags.contains(StreamFlags::NO_BLOCK) {
                break;
            }
            self.wait_until(|| self.write_space() > 0);
        }
        Ok(written)
    }

    /// Byte-stream read, symmetric with [`StreamBuffer::write`]. A closed
    /// and drained channel reads zero bytes.
    pub fn read(&self, out: &mut [u8], flags: StreamFlags) -> Result<usize, IpcError> {
        let mut consumed = 0usize;
        while consumed < out.len() {
            let remaining = out.len() - consumed;
            let (start, count) = self.reserve_read(remaining.min(u32::MAX as usize) as u32);
            if count > 0 {
                self.unstage(start, &mut out[consumed..consumed + count as usize]);
                self.commit_read(start, count);
                consumed += count as usize;
                if flags.contains(StreamFlags::ALLOW_PARTIAL) {
                    break;
                }
                continue;
            }

            if self.is_closed() || flags.contains(StreamFlags::NO_BLOCK) {
                break;
            }
            self.wait_until(|| self.read_available() > 0);
        }
        Ok(consumed)
    }

    /// Reserve a packet of `length` payload bytes. The returned writer has
    /// the length prefix already staged.
    pub fn write_packet_start(
        &self,
        length: u32,
        flags: StreamFlags,
    ) -> Result<Option<PacketWriter<'_>>, IpcError> {
        let total = length + PACKET_PREFIX;
        if total > self.capacity() {
            return Err(IpcError::PacketTooLarge);
        }

        loop {
            if self.is_closed() {
                return Err(IpcError::Closed);
            }
            let reserve = self.producer_reserve.load(Ordering::Acquire);
            let consumed = self.consumer_commit.load(Ordering::Acquire);
            let space = self.capacity() - reserve.wrapping_sub(consumed);
            if space < total {
                if flags.contains(StreamFlags::NO_BLOCK) {
                    return Ok(None);
                }
                self.wait_until(|| self.write_space() >= total);
                continue;
            }
            if self
                .producer_reserve
                .compare_exchange(
                    reserve,
                    reserve.wrapping_add(total),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.stage(reserve, &length.to_le_bytes());
                return Ok(Some(PacketWriter {
                    buffer: self,
                    base: reserve,
                    cursor: reserve.wrapping_add(PACKET_PREFIX),
                    end: reserve.wrapping_add(total),
                    committed: false,
                }));
            }
        }
    }

    /// Reserve the next whole packet for reading. Returns `Ok(None)` when
    /// no packet is available under NO_BLOCK, or when the channel closed.
    pub fn read_packet_start(
        &self,
        flags: StreamFlags,
    ) -> Result<Option<PacketReader<'_>>, IpcError> {
        loop {
            let reserved = self.consumer_reserve.load(Ordering::Acquire);
            let committed = self.producer_commit.load(Ordering::Acquire);
            let available = committed.wrapping_sub(reserved);
            if available < PACKET_PREFIX {
                if self.is_closed() {
                    return Ok(None);
                }
                if flags.contains(StreamFlags::NO_BLOCK) {
                    return Ok(None);
                }
                self.wait_until(|| self.read_available() >= PACKET_PREFIX);
                continue;
            }

            let mut prefix = [0u8; PACKET_PREFIX as usize];
            self.unstage(reserved, &mut prefix);
            let length = u32::from_le_bytes(prefix);
            let total = length + PACKET_PREFIX;
            if available < total {
                // Producers publish whole packets; the tail is on its way.
                if flags.contains(StreamFlags::NO_BLOCK) {
                    return Ok(None);
                }
                self.wait_until(|| self.read_available() >= total);
                continue;
            }

            if self
                .consumer_reserve
                .compare_exchange(
                    reserved,
                    reserved.wrapping_add(total),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                return Ok(Some(PacketReader {
                    buffer: self,
                    base: reserved,
                    cursor: reserved.wrapping_add(PACKET_PREFIX),
                    end: reserved.wrapping_add(total),
                    committed: false,
                }));
            }
        }
    }

    /// Write one whole packet.
    pub fn write_packet(&self, payload: &[u8], flags: StreamFlags) -> Result<usize, IpcError> {
        match self.write_packet_start(payload.len() as u32, flags)? {
            Some(mut writer) => {
                writer.write_data(payload);
                writer.finish();
                Ok(payload.len())
            }
            None => Ok(0),
        }
    }

    /// Read one whole packet into a fresh buffer; `Ok(None)` if nothing was
    /// available under the requested blocking mode.
    pub fn read_packet(&self, flags: StreamFlags) -> Result<Option<Vec<u8>>, IpcError> {
        match self.read_packet_start(flags)? {
            Some(mut reader) => {
                let mut payload = vec![0u8; reader.remaining() as usize];
                reader.read_data(&mut payload);
                reader.finish();
                Ok(Some(payload))
            }
            None => Ok(None),
        }
    }
}

/// Staged packet write; publishes on [`PacketWriter::finish`] (or on drop,
/// so an abandoned ticket cannot wedge later producers).
pub struct PacketWriter<'a> {
    buffer: &'a StreamBuffer,
    base: u32,
    cursor: u32,
    end: u32,
    committed: bool,
}

impl PacketWriter<'_> {
    pub fn write_data(&mut self, bytes: &[u8]) {
        let space = self.end.wrapping_sub(self.cursor) as usize;
        let count = bytes.len().min(space);
        self.buffer.stage(self.cursor, &bytes[..count]);
        self.cursor = self.cursor.wrapping_add(count as u32);
    }

    pub fn finish(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if !self.committed {
            self.committed = true;
            self.buffer
                .commit_write(self.base, self.end.wrapping_sub(self.base));
        }
    }
}

impl Drop for PacketWriter<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

/// Staged packet read; releases the ring range on [`PacketReader::finish`]
/// or drop.
pub struct PacketReader<'a> {
    buffer: &'a StreamBuffer,
    base: u32,
    cursor: u32,
    end: u32,
    committed: bool,
}

impl PacketReader<'_> {
    pub fn remaining(&self) -> u32 {
        self.end.wrapping_sub(self.cursor)
    }

    pub fn read_data(&mut self, out: &mut [u8]) -> usize {
        let available = self.remaining() as usize;
        let count = out.len().min(available);
        self.buffer.unstage(self.cursor, &mut out[..count]);
        self.cursor = self.cursor.wrapping_add(count as u32);
        count
    }

    pub fn finish(mut self) {
        self.commit();
    }

    fn commit(&mut self) {
        if !self.committed {
            self.committed = true;
            self.buffer
                .commit_read(self.base, self.end.wrapping_sub(self.base));
        }
    }
}

impl Drop for PacketReader<'_> {
    fn drop(&mut self) {
        self.commit();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bytes_round_trip() {
        let ring = StreamBuffer::new(64, StreamOptions::empty());
        assert_eq!(ring.write(b"hello", StreamFlags::empty()).unwrap(), 5);
        let mut out = [0u8; 5];
        assert_eq!(ring.read(&mut out, StreamFlags::empty()).unwrap(), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn no_block_returns_zero_when_full() {
        let ring = StreamBuffer::new(8, StreamOptions::empty());
        assert_eq!(ring.write(&[1; 8], StreamFlags::empty()).unwrap(), 8);
        assert_eq!(ring.write(&[2; 4], StreamFlags::NO_BLOCK).unwrap(), 0);

        let mut out = [0u8; 4];
        assert_eq!(ring.read(&mut out, StreamFlags::ALLOW_PARTIAL).unwrap(), 4);
        assert_eq!(ring.write(&[2; 4], StreamFlags::NO_BLOCK).unwrap(), 4);
    }

    #[test]
    fn wrap_around_preserves_content() {
        let ring = StreamBuffer::new(8, StreamOptions::empty());
        let mut out = [0u8; 6];
        for round in 0u8..40 {
            let payload = [round, round ^ 0x5A, round.wrapping_mul(3), 7, 8, 9];
            assert_eq!(ring.write(&payload, StreamFlags::empty()).unwrap(), 6);
            assert_eq!(ring.read(&mut out, StreamFlags::empty()).unwrap(), 6);
            assert_eq!(out, payload);
        }
    }

    #[test]
    fn packets_are_whole_or_absent() {
        let ring = StreamBuffer::new(64, StreamOptions::empty());
        assert!(ring.read_packet(StreamFlags::NO_BLOCK).unwrap().is_none());

        ring.write_packet(b"first", StreamFlags::empty()).unwrap();
        ring.write_packet(b"second!", StreamFlags::empty()).unwrap();
        assert_eq!(
            ring.read_packet(StreamFlags::empty()).unwrap().unwrap(),
            b"first"
        );
        assert_eq!(
            ring.read_packet(StreamFlags::empty()).unwrap().unwrap(),
            b"second!"
        );
    }

    #[test]
    fn oversized_packet_is_rejected() {
        let ring = StreamBuffer::new(16, StreamOptions::empty());
        assert!(matches!(
            ring.write_packet(&[0; 16], StreamFlags::empty()),
            Err(IpcError::PacketTooLarge)
        ));
    }

    #[test]
    fn closed_channel_errors_writers_and_drains_readers() {
        let ring = StreamBuffer::new(64, StreamOptions::empty());
        ring.write(b"tail", StreamFlags::empty()).unwrap();
        ring.close();

        assert!(matches!(
            ring.write(b"x", StreamFlags::empty()),
            Err(IpcError::Closed)
        ));
        let mut out = [0u8; 8];
        assert_eq!(ring.read(&mut out, StreamFlags::ALLOW_PARTIAL).unwrap(), 4);
        assert_eq!(ring.read(&mut out, StreamFlags::empty()).unwrap(), 0);
    }
}
