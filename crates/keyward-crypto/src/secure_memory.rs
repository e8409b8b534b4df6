//! Hardened memory cell for long-lived secrets.
//!
//! A [`SecureCell`] owns a fixed-length heap buffer. Every read or write takes
//! a borrow on the cell before touching the buffer and returns it afterward.
//! [`SecureCell::release`] closes the cell to new borrows, waits for in-flight
//! borrows to drain, wipes the whole buffer, and only then frees it.
//!
//! ```text
//! ┌───────────┐ allocate ┌──────┐  release   ┌─────────┐  drained  ┌──────────┐
//! │ (nothing) │─────────>│ Open │───────────>│ Closing │──────────>│ Released │
//! └───────────┘          └──────┘            └─────────┘  (wiped)  └──────────┘
//!                          │  ▲
//!                 borrow+1 │  │ borrow-1
//!                          ▼  │
//!                       read / write
//! ```
//!
//! A released cell rejects every operation with [`MemoryError::Disposed`].
//! Dropping a cell releases it.

#![allow(clippy::disallowed_types, reason = "Blocking primitives guard a synchronous buffer")]

use std::{
    fmt,
    sync::{Condvar, Mutex, MutexGuard, PoisonError, RwLock},
};

use zeroize::{Zeroize, Zeroizing};

use crate::error::MemoryError;

/// Borrow accounting shared by every accessor.
struct Gate {
    /// Accessors currently touching the buffer
    borrows: usize,
    /// Set once by `release`; never cleared
    closed: bool,
}

/// Fixed-length buffer for secret material, wiped before it is freed.
///
/// The length is fixed at allocation. Shorter writes zero the tail so stale
/// bytes never survive a rewrite.
///
/// # Invariants
///
/// - `len()` never changes
/// - After `release()` returns, the backing buffer has been zeroized and
///   freed, and no accessor is still inside it
/// - Once released, a cell is never usable again
pub struct SecureCell {
    len: usize,
    buffer: RwLock<Box<[u8]>>,
    gate: Mutex<Gate>,
    drained: Condvar,
}

/// Outstanding borrow. Returning it wakes a waiting `release`.
struct Borrow<'a> {
    cell: &'a SecureCell,
}

impl Drop for Borrow<'_> {
    fn drop(&mut self) {
        let mut gate = self.cell.lock_gate();
        gate.borrows -= 1;
        if gate.borrows == 0 {
            self.cell.drained.notify_all();
        }
    }
}

impl SecureCell {
    /// Allocate a zero-filled cell of `len` bytes.
    ///
    /// `allocate(0)` yields a valid empty cell.
    ///
    /// # Errors
    ///
    /// - `MemoryError::AllocationFailed` if the allocator cannot satisfy the
    ///   request
    pub fn allocate(len: usize) -> Result<Self, MemoryError> {
        let mut bytes = Vec::new();
        bytes
            .try_reserve_exact(len)
            .map_err(|_| MemoryError::AllocationFailed { requested: len })?;
        bytes.resize(len, 0);

        Ok(Self {
            len,
            buffer: RwLock::new(bytes.into_boxed_slice()),
            gate: Mutex::new(Gate { borrows: 0, closed: false }),
            drained: Condvar::new(),
        })
    }

    /// Allocate a cell sized to `data` and copy `data` into it.
    pub fn from_slice(data: &[u8]) -> Result<Self, MemoryError> {
        let cell = Self::allocate(data.len())?;
        cell.write(data)?;
        Ok(cell)
    }

    /// Fixed length of the cell in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True for zero-length cells.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True once `release()` has started.
    pub fn is_released(&self) -> bool {
        self.lock_gate().closed
    }

    /// Copy `data` into the start of the cell and zero the remainder.
    ///
    /// # Errors
    ///
    /// - `MemoryError::Disposed` if the cell was released
    /// - `MemoryError::DataTooLarge` if `data` is longer than the cell
    pub fn write(&self, data: &[u8]) -> Result<(), MemoryError> {
        let _borrow = self.borrow()?;
        if data.len() > self.len {
            return Err(MemoryError::DataTooLarge { capacity: self.len, actual: data.len() });
        }

        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        buffer[..data.len()].copy_from_slice(data);
        buffer[data.len()..].zeroize();
        Ok(())
    }

    /// Copy the whole cell into the start of `dest`. Returns bytes copied.
    ///
    /// # Errors
    ///
    /// - `MemoryError::Disposed` if the cell was released
    /// - `MemoryError::BufferTooSmall` if `dest` is shorter than the cell
    pub fn read(&self, dest: &mut [u8]) -> Result<usize, MemoryError> {
        let _borrow = self.borrow()?;
        if dest.len() < self.len {
            return Err(MemoryError::BufferTooSmall { required: self.len, actual: dest.len() });
        }

        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        dest[..self.len].copy_from_slice(&buffer);
        Ok(self.len)
    }

    /// Run `f` over the cell contents without copying them out.
    ///
    /// `f` must not call `release()` on this cell; release waits for this
    /// borrow and would never return.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, MemoryError> {
        let _borrow = self.borrow()?;
        let buffer = self.buffer.read().unwrap_or_else(PoisonError::into_inner);
        Ok(f(&buffer))
    }

    /// Copy the contents out into a buffer that zeroizes on drop.
    pub fn extract(&self) -> Result<Zeroizing<Vec<u8>>, MemoryError> {
        self.with_bytes(|bytes| Zeroizing::new(bytes.to_vec()))
    }

    /// Copy the contents into a freshly allocated cell.
    pub fn try_clone(&self) -> Result<Self, MemoryError> {
        let bytes = self.extract()?;
        Self::from_slice(&bytes)
    }

    /// Close the cell, wait for borrows to drain, wipe and free the buffer.
    ///
    /// Idempotent. Blocks while other threads are inside `read`, `write` or
    /// `with_bytes`.
    pub fn release(&self) {
        self.close(|_| {});
    }

    fn close(&self, inspect: impl FnOnce(&[u8])) {
        let mut gate = self.lock_gate();
        if gate.closed {
            return;
        }
        gate.closed = true;
        while gate.borrows > 0 {
            gate = self.drained.wait(gate).unwrap_or_else(PoisonError::into_inner);
        }
        drop(gate);

        let mut buffer = self.buffer.write().unwrap_or_else(PoisonError::into_inner);
        let bytes: &mut [u8] = &mut buffer;
        bytes.zeroize();
        inspect(bytes);
        *buffer = Box::default();
    }

    fn borrow(&self) -> Result<Borrow<'_>, MemoryError> {
        let mut gate = self.lock_gate();
        if gate.closed {
            return Err(MemoryError::Disposed);
        }
        gate.borrows += 1;
        Ok(Borrow { cell: self })
    }

    fn lock_gate(&self) -> MutexGuard<'_, Gate> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Release the cell and return what the buffer held after the wipe and
    /// before it was freed.
    #[cfg(test)]
    pub(crate) fn release_and_inspect(&self) -> Vec<u8> {
        let mut observed = Vec::new();
        self.close(|bytes| observed = bytes.to_vec());
        observed
    }
}

impl Drop for SecureCell {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for SecureCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureCell")
            .field("len", &self.len)
            .field("released", &self.is_released())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, thread, time::Duration};

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn zero_length_cell_is_valid() {
        let cell = SecureCell::allocate(0).unwrap();
        assert!(cell.is_empty());

        cell.write(&[]).unwrap();
        let mut dest: [u8; 0] = [];
        assert_eq!(cell.read(&mut dest).unwrap(), 0);
    }

    #[test]
    fn write_then_read_returns_data() {
        let cell = SecureCell::allocate(4).unwrap();
        cell.write(&[1, 2, 3, 4]).unwrap();

        let mut dest = [0u8; 8];
        assert_eq!(cell.read(&mut dest).unwrap(), 4);
        assert_eq!(&dest[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn short_write_zeroes_tail() {
        let cell = SecureCell::from_slice(&[9, 9, 9, 9]).unwrap();
        cell.write(&[1, 2]).unwrap();

        assert_eq!(cell.extract().unwrap().as_slice(), &[1, 2, 0, 0]);
    }

    #[test]
    fn oversized_write_is_rejected() {
        let cell = SecureCell::allocate(2).unwrap();
        let result = cell.write(&[1, 2, 3]);

        assert_eq!(result, Err(MemoryError::DataTooLarge { capacity: 2, actual: 3 }));
    }

    #[test]
    fn undersized_read_is_rejected() {
        let cell = SecureCell::allocate(32).unwrap();
        let mut dest = [0u8; 31];

        assert_eq!(
            cell.read(&mut dest),
            Err(MemoryError::BufferTooSmall { required: 32, actual: 31 })
        );
    }

    #[test]
    fn released_cell_rejects_access() {
        let cell = SecureCell::from_slice(&[7; 16]).unwrap();
        cell.release();

        assert!(cell.is_released());
        assert_eq!(cell.write(&[1]), Err(MemoryError::Disposed));
        assert_eq!(cell.read(&mut [0u8; 16]), Err(MemoryError::Disposed));
        assert!(matches!(cell.extract(), Err(MemoryError::Disposed)));
        assert!(matches!(cell.try_clone(), Err(MemoryError::Disposed)));

        // Second release is a no-op
        cell.release();
    }

    #[test]
    fn release_wipes_before_free() {
        let cell = SecureCell::from_slice(&[0xAB; 64]).unwrap();
        let observed = cell.release_and_inspect();

        assert_eq!(observed.len(), 64);
        assert!(observed.iter().all(|&b| b == 0));
    }

    #[test]
    fn release_after_failed_write_still_wipes() {
        let cell = SecureCell::from_slice(&[0x5A; 8]).unwrap();
        assert!(cell.write(&[0u8; 9]).is_err());

        let observed = cell.release_and_inspect();
        assert!(observed.iter().all(|&b| b == 0));
    }

    #[test]
    fn clone_is_independent() {
        let cell = SecureCell::from_slice(&[1, 2, 3]).unwrap();
        let copy = cell.try_clone().unwrap();
        cell.release();

        assert_eq!(copy.extract().unwrap().as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn release_waits_for_in_flight_borrow() {
        let cell = Arc::new(SecureCell::from_slice(&[3u8; 32]).unwrap());
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();

        let reader = {
            let cell = Arc::clone(&cell);
            thread::spawn(move || {
                cell.with_bytes(|bytes| {
                    entered_tx.send(()).unwrap();
                    thread::sleep(Duration::from_millis(50));
                    bytes.iter().all(|&b| b == 3)
                })
            })
        };

        entered_rx.recv().unwrap();
        cell.release();

        // The reader saw intact data even though release started mid-borrow
        assert_eq!(reader.join().unwrap(), Ok(true));
        assert!(cell.is_released());
    }

    #[test]
    fn concurrent_readers_and_writers() {
        let cell = SecureCell::allocate(32).unwrap();

        thread::scope(|scope| {
            for i in 0..4u8 {
                let cell = &cell;
                scope.spawn(move || {
                    for _ in 0..100 {
                        cell.write(&[i; 32]).unwrap();
                        let bytes = cell.extract().unwrap();
                        // Writes are whole-buffer, so every byte matches
                        assert!(bytes.iter().all(|&b| b == bytes[0]));
                    }
                });
            }
        });
    }

    proptest! {
        #[test]
        fn prop_release_leaves_only_zeroes(data in prop::collection::vec(any::<u8>(), 0..512)) {
            let cell = SecureCell::from_slice(&data).unwrap();
            let observed = cell.release_and_inspect();

            prop_assert_eq!(observed.len(), data.len());
            prop_assert!(observed.iter().all(|&b| b == 0));
        }

        #[test]
        fn prop_length_never_changes(
            len in 0usize..256,
            writes in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..300), 0..8),
        ) {
            let cell = SecureCell::allocate(len).unwrap();
            for data in &writes {
                let result = cell.write(data);
                prop_assert_eq!(result.is_ok(), data.len() <= len);
                prop_assert_eq!(cell.len(), len);
            }
        }
    }
}
