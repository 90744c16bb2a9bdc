//! Caller memory
//!
//! Control calls never touch caller memory directly; they go through
//! [`UserBuffer`], whose copies can fail the way a bad user pointer would.
//! A failed copy is always fatal to the control call that attempted it.

use crate::error::{DriverError, Result};
use std::sync::{Arc, Mutex, PoisonError};

/// Caller-owned memory a control call reads arguments from and writes
/// results into.
pub trait UserBuffer {
    /// Accessible length in bytes.
    fn len(&self) -> usize;

    /// Whether the buffer has no accessible bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy `dst.len()` bytes out of the buffer starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::UserCopyFault` if the range is not accessible.
    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()>;

    /// Copy `src` into the buffer starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::UserCopyFault` if the range is not accessible.
    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()>;

    /// Read native-endian 32-bit word `index`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::UserCopyFault` if the word is not accessible.
    fn get_u32(&self, index: usize) -> Result<u32> {
        let mut word = [0u8; 4];
        self.copy_from_user(index * 4, &mut word)?;
        Ok(u32::from_ne_bytes(word))
    }

    /// Write native-endian 32-bit word `index`.
    ///
    /// # Errors
    ///
    /// Returns `DriverError::UserCopyFault` if the word is not accessible.
    fn put_u32(&mut self, index: usize, value: u32) -> Result<()> {
        self.copy_to_user(index * 4, &value.to_ne_bytes())
    }
}

fn range(len: usize, offset: usize, n: usize) -> Result<std::ops::Range<usize>> {
    match offset.checked_add(n) {
        Some(end) if end <= len => Ok(offset..end),
        _ => Err(DriverError::user_fault(format!(
            "accessing {n} bytes at {offset} of a {len}-byte buffer"
        ))),
    }
}

impl UserBuffer for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        dst.copy_from_slice(&self[range(<[u8]>::len(self), offset, dst.len())?]);
        Ok(())
    }

    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        let r = range(<[u8]>::len(self), offset, src.len())?;
        self[r].copy_from_slice(src);
        Ok(())
    }
}

impl UserBuffer for Vec<u8> {
    fn len(&self) -> usize {
        self.as_slice().len()
    }

    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.as_slice().copy_from_user(offset, dst)
    }

    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.as_mut_slice().copy_to_user(offset, src)
    }
}

/// Growable caller buffer shared between the caller and a session.
///
/// Used as an exposure destination: the session keeps one handle until the
/// frame is collected and the caller inspects the other.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    /// Zero-filled buffer of `len` bytes.
    pub fn zeroed(len: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![0; len])))
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl UserBuffer for SharedBuffer {
    fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn copy_from_user(&self, offset: usize, dst: &mut [u8]) -> Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .copy_from_user(offset, dst)
    }

    fn copy_to_user(&mut self, offset: usize, src: &[u8]) -> Result<()> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .copy_to_user(offset, src)
    }
}

/// Buffer whose every access faults.
#[derive(Debug, Clone, Copy, Default)]
pub struct FaultyBuffer {
    /// Length the buffer claims to have.
    pub len: usize,
}

impl UserBuffer for FaultyBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn copy_from_user(&self, offset: usize, _dst: &mut [u8]) -> Result<()> {
        Err(DriverError::user_fault(format!("reading at {offset}")))
    }

    fn copy_to_user(&mut self, offset: usize, _src: &[u8]) -> Result<()> {
        Err(DriverError::user_fault(format!("writing at {offset}")))
    }
}

/// Exposure destination owned by a session between arm and collect.
pub type PixelSink = Box<dyn UserBuffer + Send>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn words_round_trip_within_bounds() {
        let mut buf = vec![0u8; 8];
        buf.put_u32(1, 0xDEAD_BEEF).unwrap();
        assert_eq!(buf.get_u32(1).unwrap(), 0xDEAD_BEEF);
        assert!(matches!(
            buf.get_u32(2),
            Err(DriverError::UserCopyFault { .. })
        ));
    }

    #[test]
    fn shared_buffer_is_visible_through_clones() {
        let dest = SharedBuffer::zeroed(4);
        let mut sink: PixelSink = Box::new(dest.clone());
        sink.copy_to_user(1, &[7, 8]).unwrap();
        assert_eq!(dest.snapshot(), vec![0, 7, 8, 0]);
    }

    #[test]
    fn faulty_buffer_always_faults() {
        let mut b = FaultyBuffer { len: 64 };
        assert!(b.get_u32(0).is_err());
        assert!(b.put_u32(0, 1).is_err());
    }
}
