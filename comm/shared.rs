// ========================================================================================
//
//                        Node tier: the shared reduction region
//
// ========================================================================================
//
// One region exists per node. It is allocated once before the solver starts and never
// resized. Processes on the node exchange partials through it instead of sending
// messages to each other; the barrier discipline of `Collective` decides who may touch
// which byte range at any moment, the region itself performs no locking.

use super::CommError;
use memmap2::{MmapMut, MmapOptions};
use std::fs::OpenOptions;
use std::path::Path;
use std::ptr;

const VALUE_BYTES: usize = std::mem::size_of::<f64>();

/// A fixed-size array of `f64` values mapped into memory shared by every process of
/// a node.
pub struct SharedRegion {
    // Keeps the mapping alive; all access goes through `base`.
    _map: MmapMut,
    base: *mut f64,
    len: usize,
}

// SAFETY: the mapping is plain memory. Concurrent access is coordinated by the
// collective protocol: a byte range is written by one participant between two
// barriers and only read after the second one.
unsafe impl Send for SharedRegion {}
unsafe impl Sync for SharedRegion {}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion").field("len", &self.len).finish()
    }
}

impl SharedRegion {
    /// Maps an anonymous region of `len` values, shared by every thread of this OS
    /// process.
    pub fn anonymous(len: usize) -> Result<Self, CommError> {
        let map = MmapOptions::new()
            .len(len.max(1) * VALUE_BYTES)
            .map_anon()?;
        Ok(Self::from_map(map, len))
    }

    /// Maps a file-backed region of `len` values so that separate OS processes on the
    /// same machine can open the same path (typically under `/dev/shm`).
    pub fn file_backed(path: &Path, len: usize) -> Result<Self, CommError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let bytes = (len.max(1) * VALUE_BYTES) as u64;
        if file.metadata()?.len() < bytes {
            file.set_len(bytes)?;
        }
        // SAFETY: the file is owned by this run; no other program truncates it while
        // the mapping is alive.
        let map = unsafe { MmapOptions::new().len(bytes as usize).map_mut(&file)? };
        Ok(Self::from_map(map, len))
    }

    fn from_map(mut map: MmapMut, len: usize) -> Self {
        // Mappings are page aligned, which satisfies the alignment of f64.
        let base = map.as_mut_ptr().cast::<f64>();
        Self {
            _map: map,
            base,
            len,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn check(&self, offset: usize, count: usize) -> Result<(), CommError> {
        match offset.checked_add(count) {
            Some(end) if end <= self.len => Ok(()),
            _ => Err(CommError::RegionBounds {
                offset,
                len: count,
                capacity: self.len,
            }),
        }
    }

    /// Copies `values` into the region starting at `offset`.
    ///
    /// # Safety
    /// No other participant may read or write `offset..offset + values.len()` until
    /// the caller has passed the barrier that publishes this write.
    pub unsafe fn write(&self, offset: usize, values: &[f64]) -> Result<(), CommError> {
        self.check(offset, values.len())?;
        // SAFETY: bounds checked above; exclusivity is the caller's contract.
        unsafe {
            ptr::copy_nonoverlapping(values.as_ptr(), self.base.add(offset), values.len());
        }
        Ok(())
    }

    /// Copies `out.len()` values starting at `offset` out of the region.
    ///
    /// # Safety
    /// No participant may be writing `offset..offset + out.len()` concurrently.
    pub unsafe fn read(&self, offset: usize, out: &mut [f64]) -> Result<(), CommError> {
        self.check(offset, out.len())?;
        // SAFETY: bounds checked above; absence of writers is the caller's contract.
        unsafe {
            ptr::copy_nonoverlapping(self.base.add(offset), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}
