//! Holding register storage.
//!
//! Provides a thread-safe, fixed-size bank of 16-bit holding registers.
//! Every read or write takes a single exclusive lock for the duration of
//! that one operation, so a multi-register write is never observed torn.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::info;

/// Error returned when an access falls outside the bank
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegisterError {
    /// `address + quantity` exceeds the number of registers
    OutOfRange {
        address: u16,
        quantity: usize,
        len: usize,
    },
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::OutOfRange {
                address,
                quantity,
                len,
            } => write!(
                f,
                "registers {address}..{} out of range (bank holds {len})",
                usize::from(*address) + quantity
            ),
        }
    }
}

impl std::error::Error for RegisterError {}

/// Thread-safe bank of holding registers
#[derive(Debug)]
pub struct RegisterBank {
    values: Mutex<Vec<u16>>,
}

impl RegisterBank {
    /// Create a bank of `count` registers, all zero
    pub fn new(count: usize) -> Arc<Self> {
        info!(count, "Initializing register bank");
        Arc::new(Self {
            values: Mutex::new(vec![0; count]),
        })
    }

    /// Number of registers in the bank
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Read `quantity` registers starting at `address`
    pub fn read(&self, address: u16, quantity: usize) -> Result<Vec<u16>, RegisterError> {
        let values = self.lock();
        let range = Self::range(values.len(), address, quantity)?;
        Ok(values[range].to_vec())
    }

    /// Store a single register
    pub fn write(&self, address: u16, value: u16) -> Result<(), RegisterError> {
        self.write_multiple(address, &[value])
    }

    /// Store consecutive registers starting at `address`, all or nothing
    pub fn write_multiple(&self, address: u16, data: &[u16]) -> Result<(), RegisterError> {
        let mut values = self.lock();
        let range = Self::range(values.len(), address, data.len())?;
        values[range].copy_from_slice(data);
        Ok(())
    }

    fn range(
        len: usize,
        address: u16,
        quantity: usize,
    ) -> Result<std::ops::Range<usize>, RegisterError> {
        let start = usize::from(address);
        match start.checked_add(quantity) {
            Some(end) if end <= len => Ok(start..end),
            _ => Err(RegisterError::OutOfRange {
                address,
                quantity,
                len,
            }),
        }
    }

    // Slice copies cannot be interrupted halfway, so poisoned data is intact.
    fn lock(&self) -> MutexGuard<'_, Vec<u16>> {
        self.values.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
