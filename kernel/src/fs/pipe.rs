//! Anonymous pipes
//!
//! A fixed pool of 64 bounded ring buffers. Each end keeps an open-handle
//! count rather than a flag so that descriptors duplicated by `fork`
//! behave correctly: the read end stays usable until the last reader
//! closes it. When both counts reach zero the slot is freed.
//!
//! The pool itself never blocks; `try_read`/`try_write` report
//! `WouldBlock` and the syscall layer parks the caller on the pipe's wait
//! queue, waking exactly one waiter from the peer queue per completed
//! transfer (and all of them when an end closes).

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;

use crate::{error::PipeError, process::Pid};

/// Ring buffer capacity in bytes.
pub const PIPE_CAPACITY: usize = 4096;

/// Fixed number of pipe slots.
pub const MAX_PIPES: usize = 64;

/// Identifier of a live pipe. Ids increase monotonically and are never
/// reused, so a stale descriptor can not reach a recycled slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipeId(pub u64);

/// Result of a non-blocking read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Bytes were copied out.
    Data(usize),
    /// Buffer empty and the write end is closed.
    Eof,
    /// Buffer empty but a writer may still produce data.
    WouldBlock,
}

/// Result of a non-blocking write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// This many bytes were committed (possibly fewer than asked).
    Wrote(usize),
    /// No space at all.
    WouldBlock,
}

/// One bounded ring-buffer pipe.
pub struct Pipe {
    id: PipeId,
    ring: [u8; PIPE_CAPACITY],
    read_pos: usize,
    write_pos: usize,
    data_size: usize,
    /// Open read handles.
    readers: u32,
    /// Open write handles.
    writers: u32,
    read_waiters: VecDeque<Pid>,
    write_waiters: VecDeque<Pid>,
}

impl Pipe {
    fn new(id: PipeId) -> Self {
        Self {
            id,
            ring: [0; PIPE_CAPACITY],
            read_pos: 0,
            write_pos: 0,
            data_size: 0,
            readers: 1,
            writers: 1,
            read_waiters: VecDeque::new(),
            write_waiters: VecDeque::new(),
        }
    }

    pub fn id(&self) -> PipeId {
        self.id
    }

    pub fn data_size(&self) -> usize {
        self.data_size
    }

    pub fn readers(&self) -> u32 {
        self.readers
    }

    pub fn writers(&self) -> u32 {
        self.writers
    }
}

/// The pipe pool.
pub struct PipeTable {
    slots: [Option<Box<Pipe>>; MAX_PIPES],
    next_id: u64,
}

impl Default for PipeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeTable {
    pub fn new() -> Self {
        Self {
            slots: [const { None }; MAX_PIPES],
            next_id: 1,
        }
    }

    /// Allocate a pipe with one open handle on each end.
    pub fn create(&mut self) -> Result<PipeId, PipeError> {
        let slot = self
            .slots
            .iter()
            .position(|s| s.is_none())
            .ok_or(PipeError::Full)?;
        let id = PipeId(self.next_id);
        self.next_id += 1;
        self.slots[slot] = Some(Box::new(Pipe::new(id)));
        Ok(id)
    }

    fn get_mut(&mut self, id: PipeId) -> Option<&mut Pipe> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|p| p.id == id)
            .map(|p| &mut **p)
    }

    pub fn get(&self, id: PipeId) -> Option<&Pipe> {
        self.slots
            .iter()
            .flatten()
            .find(|p| p.id == id)
            .map(|p| &**p)
    }

    /// Account for a duplicated read descriptor (fork).
    pub fn retain_read(&mut self, id: PipeId) {
        if let Some(pipe) = self.get_mut(id) {
            pipe.readers += 1;
        }
    }

    /// Account for a duplicated write descriptor (fork).
    pub fn retain_write(&mut self, id: PipeId) {
        if let Some(pipe) = self.get_mut(id) {
            pipe.writers += 1;
        }
    }

    /// Copy up to `buf.len()` bytes out of the ring.
    pub fn try_read(&mut self, id: PipeId, buf: &mut [u8]) -> Result<ReadOutcome, PipeError> {
        let pipe = self.get_mut(id).ok_or(PipeError::Closed)?;
        if pipe.readers == 0 {
            return Err(PipeError::Closed);
        }
        if pipe.data_size == 0 {
            if pipe.writers == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Ok(ReadOutcome::WouldBlock);
        }
        let count = buf.len().min(pipe.data_size);
        for slot in buf.iter_mut().take(count) {
            *slot = pipe.ring[pipe.read_pos];
            pipe.read_pos = (pipe.read_pos + 1) % PIPE_CAPACITY;
        }
        pipe.data_size -= count;
        Ok(ReadOutcome::Data(count))
    }

    /// Copy as much of `data` into the ring as fits.
    pub fn try_write(&mut self, id: PipeId, data: &[u8]) -> Result<WriteOutcome, PipeError> {
        let pipe = self.get_mut(id).ok_or(PipeError::Closed)?;
        if pipe.writers == 0 {
            return Err(PipeError::Closed);
        }
        if pipe.readers == 0 {
            // Broken pipe: nobody will ever drain the ring.
            return Err(PipeError::Closed);
        }
        if data.is_empty() {
            return Ok(WriteOutcome::Wrote(0));
        }
        let space = PIPE_CAPACITY - pipe.data_size;
        if space == 0 {
            return Ok(WriteOutcome::WouldBlock);
        }
        let count = data.len().min(space);
        for &byte in data.iter().take(count) {
            pipe.ring[pipe.write_pos] = byte;
            pipe.write_pos = (pipe.write_pos + 1) % PIPE_CAPACITY;
        }
        pipe.data_size += count;
        Ok(WriteOutcome::Wrote(count))
    }

    /// Park a reader waiting for data.
    pub fn push_read_waiter(&mut self, id: PipeId, pid: Pid) {
        if let Some(pipe) = self.get_mut(id) {
            if !pipe.read_waiters.contains(&pid) {
                pipe.read_waiters.push_back(pid);
            }
        }
    }

    /// Park a writer waiting for space.
    pub fn push_write_waiter(&mut self, id: PipeId, pid: Pid) {
        if let Some(pipe) = self.get_mut(id) {
            if !pipe.write_waiters.contains(&pid) {
                pipe.write_waiters.push_back(pid);
            }
        }
    }

    /// Dequeue exactly one waiting reader.
    pub fn pop_read_waiter(&mut self, id: PipeId) -> Option<Pid> {
        self.get_mut(id)?.read_waiters.pop_front()
    }

    /// Dequeue exactly one waiting writer.
    pub fn pop_write_waiter(&mut self, id: PipeId) -> Option<Pid> {
        self.get_mut(id)?.write_waiters.pop_front()
    }

    /// Drop one read handle. Returns every parked writer (they must fail
    /// with `Closed`) and, once both ends reach zero handles, frees the
    /// slot.
    pub fn close_read(&mut self, id: PipeId) -> Vec<Pid> {
        let mut wake = Vec::new();
        if let Some(pipe) = self.get_mut(id) {
            pipe.readers = pipe.readers.saturating_sub(1);
            if pipe.readers == 0 {
                wake.extend(pipe.write_waiters.drain(..));
            }
        }
        self.free_if_unreferenced(id);
        wake
    }

    /// Drop one write handle. Returns every parked reader (they observe
    /// EOF) and frees the slot when both ends are closed.
    pub fn close_write(&mut self, id: PipeId) -> Vec<Pid> {
        let mut wake = Vec::new();
        if let Some(pipe) = self.get_mut(id) {
            pipe.writers = pipe.writers.saturating_sub(1);
            if pipe.writers == 0 {
                wake.extend(pipe.read_waiters.drain(..));
            }
        }
        self.free_if_unreferenced(id);
        wake
    }

    fn free_if_unreferenced(&mut self, id: PipeId) {
        let free = self
            .get(id)
            .is_some_and(|p| p.readers == 0 && p.writers == 0);
        if free {
            for slot in self.slots.iter_mut() {
                if slot.as_ref().is_some_and(|p| p.id == id) {
                    *slot = None;
                }
            }
        }
    }

    /// Number of live pipes.
    pub fn count(&self) -> usize {
        self.slots.iter().flatten().count()
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    #[test]
    fn bytes_come_back_in_order() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();

        assert_eq!(
            pipes.try_write(id, b"hello ").unwrap(),
            WriteOutcome::Wrote(6)
        );
        assert_eq!(
            pipes.try_write(id, b"world").unwrap(),
            WriteOutcome::Wrote(5)
        );

        let mut buf = [0u8; 16];
        assert_eq!(
            pipes.try_read(id, &mut buf).unwrap(),
            ReadOutcome::Data(11)
        );
        assert_eq!(&buf[..11], b"hello world");
    }

    #[test]
    fn ring_wraps_correctly() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        let chunk = [0x5Au8; 3000];

        // Fill partially, drain, fill again across the wrap point.
        assert_eq!(
            pipes.try_write(id, &chunk).unwrap(),
            WriteOutcome::Wrote(3000)
        );
        let mut buf = [0u8; 3000];
        assert_eq!(
            pipes.try_read(id, &mut buf).unwrap(),
            ReadOutcome::Data(3000)
        );

        let pattern: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        assert_eq!(
            pipes.try_write(id, &pattern).unwrap(),
            WriteOutcome::Wrote(3000)
        );
        let mut back = [0u8; 3000];
        assert_eq!(
            pipes.try_read(id, &mut back).unwrap(),
            ReadOutcome::Data(3000)
        );
        assert_eq!(&back[..], &pattern[..]);
    }

    #[test]
    fn capacity_is_honored_exactly() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        let big = [1u8; PIPE_CAPACITY + 100];

        // Exactly capacity bytes fit; the rest would block.
        assert_eq!(
            pipes.try_write(id, &big).unwrap(),
            WriteOutcome::Wrote(PIPE_CAPACITY)
        );
        assert_eq!(pipes.get(id).unwrap().data_size(), PIPE_CAPACITY);
        assert_eq!(
            pipes.try_write(id, b"x").unwrap(),
            WriteOutcome::WouldBlock
        );
    }

    #[test]
    fn empty_pipe_blocks_until_writer_closes() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        let mut buf = [0u8; 4];

        assert_eq!(
            pipes.try_read(id, &mut buf).unwrap(),
            ReadOutcome::WouldBlock
        );
        pipes.close_write(id);
        assert_eq!(pipes.try_read(id, &mut buf).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn writing_to_a_readerless_pipe_fails() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        pipes.close_read(id);
        assert_eq!(pipes.try_write(id, b"x").unwrap_err(), PipeError::Closed);
    }

    #[test]
    fn fork_style_handle_counts_survive_one_close() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        pipes.retain_read(id);
        pipes.retain_write(id);

        pipes.try_write(id, b"Merhaba pipe!").unwrap();
        // One holder closes both of its ends.
        pipes.close_read(id);
        pipes.close_write(id);

        // The other holder can still drain the data.
        let mut buf = [0u8; 63];
        assert_eq!(
            pipes.try_read(id, &mut buf).unwrap(),
            ReadOutcome::Data(13)
        );
        assert_eq!(&buf[..13], b"Merhaba pipe!");

        // And then sees EOF once the last writer is gone... which it is.
        assert_eq!(pipes.try_read(id, &mut buf).unwrap(), ReadOutcome::Eof);
    }

    #[test]
    fn slot_freed_when_both_ends_close() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        assert_eq!(pipes.count(), 1);
        pipes.close_read(id);
        assert_eq!(pipes.count(), 1);
        pipes.close_write(id);
        assert_eq!(pipes.count(), 0);
        assert!(pipes.get(id).is_none());

        let mut buf = [0u8; 1];
        assert_eq!(pipes.try_read(id, &mut buf).unwrap_err(), PipeError::Closed);
    }

    #[test]
    fn pool_exhaustion_reports_full() {
        let mut pipes = PipeTable::new();
        for _ in 0..MAX_PIPES {
            pipes.create().unwrap();
        }
        assert_eq!(pipes.create().unwrap_err(), PipeError::Full);
    }

    #[test]
    fn waiters_are_woken_one_at_a_time() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        pipes.push_read_waiter(id, Pid(3));
        pipes.push_read_waiter(id, Pid(4));
        pipes.push_read_waiter(id, Pid(3)); // duplicate ignored

        assert_eq!(pipes.pop_read_waiter(id), Some(Pid(3)));
        assert_eq!(pipes.pop_read_waiter(id), Some(Pid(4)));
        assert_eq!(pipes.pop_read_waiter(id), None);
    }

    #[test]
    fn closing_write_end_wakes_parked_readers() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        pipes.push_read_waiter(id, Pid(9));
        let woken = pipes.close_write(id);
        assert_eq!(woken, alloc::vec![Pid(9)]);
    }

    #[test]
    fn ring_invariant_holds() {
        let mut pipes = PipeTable::new();
        let id = pipes.create().unwrap();
        pipes.try_write(id, &[7u8; 1500]).unwrap();
        let mut buf = [0u8; 700];
        pipes.try_read(id, &mut buf).unwrap();

        let pipe = pipes.get(id).unwrap();
        assert!(pipe.data_size() <= PIPE_CAPACITY);
        assert_eq!(
            (pipe.write_pos + PIPE_CAPACITY - pipe.read_pos) % PIPE_CAPACITY,
            pipe.data_size()
        );
    }
}
