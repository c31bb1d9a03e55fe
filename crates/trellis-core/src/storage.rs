use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::{Error, Result};
use crate::Element;

// Storage: the shared flat buffer behind every view
//
// A Storage is a reference-counted handle to one flat Vec. Cloning the handle
// aliases the buffer; the Vec is freed when the last view referencing it is
// dropped. Writes through any view are visible through every other view of
// the same buffer. `Tensor::deep_copy` is the only way to break that.
//
// The buffer only ever grows. Growing happens in place, so views created
// before the growth keep their offsets and keep aliasing the same data. The
// parameter buffer relies on this: each module parameter is a view at some
// offset, and registering a new parameter grows the shared buffer.
//
// LOCKING:
//
// Operators take one lock per distinct buffer for the whole operation, never
// one per element. When a source aliases the destination, it is read through
// the destination's write guard (see `Sources`), so in-place updates such as
// `dst += dst` or accumulation into overlapping unfolded windows never try to
// lock the same buffer twice.

/// Reference-counted, growable element buffer.
#[derive(Debug)]
pub struct Storage<T> {
    data: Arc<RwLock<Vec<T>>>,
}

impl<T> Clone for Storage<T> {
    fn clone(&self) -> Self {
        Storage {
            data: Arc::clone(&self.data),
        }
    }
}

impl<T: Element> Storage<T> {
    /// Wrap an existing vector.
    pub fn from_vec(data: Vec<T>) -> Self {
        Storage {
            data: Arc::new(RwLock::new(data)),
        }
    }

    /// A zero-filled buffer of `len` elements.
    pub fn zeros(len: usize) -> Self {
        Storage::from_vec(vec![T::zero(); len])
    }

    /// Number of allocated elements.
    pub fn len(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of live handles (views, states, parameters) on this buffer.
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.data)
    }

    pub fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.data.read().map_err(|_| Error::StoragePoisoned)
    }

    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.data.write().map_err(|_| Error::StoragePoisoned)
    }

    /// Make sure at least `min_len` elements are allocated.
    /// New elements are zero. Returns true if the buffer grew.
    pub fn grow(&self, min_len: usize) -> Result<bool> {
        let mut data = self.write()?;
        if data.len() >= min_len {
            return Ok(false);
        }
        data.resize(min_len, T::zero());
        Ok(true)
    }

    /// Same underlying buffer (pointer identity, not contents).
    pub fn same(&self, other: &Storage<T>) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Address of the first element. Changes whenever the Vec reallocates.
    pub fn data_ptr(&self) -> Result<*const T> {
        Ok(self.read()?.as_ptr())
    }
}

enum Slot {
    Dst,
    Guard(usize),
}

/// Read access to a set of source buffers, deduplicated by identity.
///
/// A source that is the destination buffer is read through the caller's
/// write guard; sources sharing a buffer share one read guard.
pub(crate) struct Sources<'a, T> {
    guards: Vec<RwLockReadGuard<'a, Vec<T>>>,
    owners: Vec<&'a Storage<T>>,
    slots: Vec<Slot>,
}

impl<'a, T: Element> Sources<'a, T> {
    pub(crate) fn lock(dst: Option<&Storage<T>>, srcs: &[&'a Storage<T>]) -> Result<Self> {
        let mut sources = Sources {
            guards: Vec::with_capacity(srcs.len()),
            owners: Vec::with_capacity(srcs.len()),
            slots: Vec::with_capacity(srcs.len()),
        };
        for &src in srcs {
            if dst.map_or(false, |d| d.same(src)) {
                sources.slots.push(Slot::Dst);
                continue;
            }
            match sources.owners.iter().position(|o| o.same(src)) {
                Some(g) => sources.slots.push(Slot::Guard(g)),
                None => {
                    sources.guards.push(src.read()?);
                    sources.owners.push(src);
                    sources.slots.push(Slot::Guard(sources.guards.len() - 1));
                }
            }
        }
        Ok(sources)
    }

    /// Element `idx` of source `k`. `dst` is the destination's data, ignored
    /// when source `k` has its own guard.
    #[inline]
    pub(crate) fn get(&self, k: usize, dst: &[T], idx: usize) -> T {
        match self.slots[k] {
            Slot::Dst => dst[idx],
            Slot::Guard(g) => self.guards[g][idx],
        }
    }
}
