//! Magic ring buffer: a bounded FIFO whose contents are always readable
//! as one contiguous region.
//!
//! The backing store is mapped twice at adjacent virtual addresses, so a
//! read of `n` items starting anywhere inside the buffer never has to
//! handle wrap-around: the second mapping continues where the first
//! ends. This is what lets [`CircularBuffer::peek`] hand the FCCH
//! detector a zero-copy view of everything buffered, regardless of where
//! the read cursor sits.
//!
//! Construction reserves `2 * size` of address space with a `PROT_NONE`
//! anonymous mapping, then maps a memory-backed file into both halves
//! with `MAP_FIXED`. The reserve-then-map pattern keeps other allocators
//! from racing us for the range.

use std::marker::PhantomData;
use std::mem;
use std::ptr;
use std::sync::Mutex;

use crate::error::{Error, Result};

/// Byte cursors. Both count monotonically; the number of buffered bytes
/// is `w - r`.
struct Cursors {
    r: usize,
    w: usize,
}

/// Thread-safe ring buffer of `Copy` items over a doubly-mapped region.
pub struct CircularBuffer<T: Copy> {
    base: *mut u8,
    /// Mapped size in bytes, rounded up to a page multiple.
    buf_size: usize,
    /// Capacity in items.
    buf_len: usize,
    fd: libc::c_int,
    /// When set, writes never truncate: the read cursor advances so the
    /// newest `capacity` items survive.
    overwrite: bool,
    cursors: Mutex<Cursors>,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for CircularBuffer<T> {}
unsafe impl<T: Copy + Send> Sync for CircularBuffer<T> {}

#[cfg(target_os = "linux")]
fn backing_fd() -> libc::c_int {
    unsafe { libc::memfd_create(c"kal-ring".as_ptr(), 0) }
}

#[cfg(all(unix, not(target_os = "linux")))]
fn backing_fd() -> libc::c_int {
    let mut template = *b"/tmp/kal.ring.XXXXXX\0";
    let fd = unsafe { libc::mkstemp(template.as_mut_ptr() as *mut libc::c_char) };
    if fd >= 0 {
        unsafe { libc::unlink(template.as_ptr() as *const libc::c_char) };
    }
    fd
}

impl<T: Copy> CircularBuffer<T> {
    /// Allocate a buffer holding at least `buf_len` items.
    ///
    /// The effective capacity is `buf_len` rounded up so the byte size is
    /// a page multiple. Fails if the byte size overflows, the backing
    /// file cannot be created, or the double mapping cannot be placed;
    /// no partial object is left behind on failure.
    pub fn new(buf_len: usize, overwrite: bool) -> Result<Self> {
        let item_size = mem::size_of::<T>();
        if buf_len == 0 || item_size == 0 {
            return Err(Error::BufferAllocation(
                "zero-sized ring buffer".to_string(),
            ));
        }

        let raw_size = buf_len
            .checked_mul(item_size)
            .ok_or_else(|| Error::BufferAllocation("buffer size overflow".to_string()))?;

        let page_size = {
            let p = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
            if p > 0 {
                p as usize
            } else {
                4096
            }
        };
        let buf_size = raw_size
            .checked_add(page_size - 1)
            .ok_or_else(|| Error::BufferAllocation("buffer size overflow".to_string()))?
            & !(page_size - 1);

        let fd = backing_fd();
        if fd < 0 {
            return Err(Error::BufferAllocation(
                "failed to create backing file".to_string(),
            ));
        }

        if unsafe { libc::ftruncate(fd, buf_size as libc::off_t) } < 0 {
            unsafe { libc::close(fd) };
            return Err(Error::BufferAllocation("ftruncate failed".to_string()));
        }

        // Reserve the whole range, then pin both mappings inside it.
        let reserved = unsafe {
            libc::mmap(
                ptr::null_mut(),
                2 * buf_size,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if reserved == libc::MAP_FAILED {
            unsafe { libc::close(fd) };
            return Err(Error::BufferAllocation(
                "address space reservation failed".to_string(),
            ));
        }

        let cleanup = |msg: &str| -> Result<Self> {
            unsafe {
                libc::munmap(reserved, 2 * buf_size);
                libc::close(fd);
            }
            Err(Error::BufferAllocation(msg.to_string()))
        };

        let first = unsafe {
            libc::mmap(
                reserved,
                buf_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if first != reserved {
            return cleanup("first mapping failed");
        }

        let upper_half = unsafe { (reserved as *mut u8).add(buf_size) } as *mut libc::c_void;
        let second = unsafe {
            libc::mmap(
                upper_half,
                buf_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_FIXED,
                fd,
                0,
            )
        };
        if second != upper_half {
            return cleanup("second mapping failed");
        }

        Ok(Self {
            base: reserved as *mut u8,
            buf_size,
            buf_len: buf_size / item_size,
            fd,
            overwrite,
            cursors: Mutex::new(Cursors { r: 0, w: 0 }),
            _marker: PhantomData,
        })
    }

    /// Capacity in items (page-rounded).
    pub fn capacity(&self) -> usize {
        self.buf_len
    }

    /// Number of items buffered.
    pub fn data_available(&self) -> usize {
        let c = self.cursors.lock().unwrap();
        (c.w - c.r) / mem::size_of::<T>()
    }

    /// Number of items that fit before the buffer is full.
    pub fn space_available(&self) -> usize {
        let c = self.cursors.lock().unwrap();
        (self.buf_size - (c.w - c.r)) / mem::size_of::<T>()
    }

    /// Store up to `items.len()` items, returning how many were stored.
    ///
    /// In non-overwrite mode the count is limited by the free space. In
    /// overwrite mode everything is stored and the read cursor advances
    /// past the oldest items so at most `capacity` remain.
    pub fn write(&self, items: &[T]) -> usize {
        let item_size = mem::size_of::<T>();
        let mut c = self.cursors.lock().unwrap();

        let bytes_used = c.w - c.r;
        let items_free = (self.buf_size - bytes_used) / item_size;

        let mut src = items;
        if !self.overwrite && src.len() > items_free {
            src = &src[..items_free];
        }
        // Only the newest `capacity` items can survive anyway, and the
        // copy must stay inside the double mapping.
        if self.overwrite && src.len() > self.buf_len {
            src = &src[src.len() - self.buf_len..];
        }
        let to_write = src.len();

        if to_write > 0 {
            let offset = c.w % self.buf_size;
            unsafe {
                ptr::copy_nonoverlapping(
                    src.as_ptr() as *const u8,
                    self.base.add(offset),
                    to_write * item_size,
                );
            }
            c.w += to_write * item_size;
        }

        if self.overwrite && c.w - c.r > self.buf_size {
            c.r = c.w - self.buf_size;
        }

        Self::normalize(&mut c, self.buf_size);
        to_write
    }

    /// Copy out up to `out.len()` items, returning how many were copied.
    pub fn read(&self, out: &mut [T]) -> usize {
        let item_size = mem::size_of::<T>();
        let mut c = self.cursors.lock().unwrap();

        let items_avail = (c.w - c.r) / item_size;
        let to_read = out.len().min(items_avail);

        if to_read > 0 {
            let offset = c.r % self.buf_size;
            unsafe {
                ptr::copy_nonoverlapping(
                    self.base.add(offset),
                    out.as_mut_ptr() as *mut u8,
                    to_read * item_size,
                );
            }
            c.r += to_read * item_size;
        }

        Self::normalize(&mut c, self.buf_size);
        to_read
    }

    /// Contiguous view of everything buffered, without consuming it.
    ///
    /// Returns the start of the region and the item count. Thanks to the
    /// double mapping the region is contiguous even when the data wraps.
    /// The pointer is invalidated by the next `read`, `purge`, or
    /// `flush` (and, in overwrite mode, the next `write`) from any
    /// thread.
    pub fn peek(&self) -> (*const T, usize) {
        let c = self.cursors.lock().unwrap();
        let len = (c.w - c.r) / mem::size_of::<T>();
        let ptr = unsafe { self.base.add(c.r % self.buf_size) } as *const T;
        (ptr, len)
    }

    /// Advance the read cursor by up to `len` items without copying.
    pub fn purge(&self, len: usize) -> usize {
        let item_size = mem::size_of::<T>();
        let mut c = self.cursors.lock().unwrap();

        let items_avail = (c.w - c.r) / item_size;
        let to_purge = len.min(items_avail);
        c.r += to_purge * item_size;

        Self::normalize(&mut c, self.buf_size);
        to_purge
    }

    /// Discard everything buffered.
    pub fn flush(&self) {
        let mut c = self.cursors.lock().unwrap();
        c.r = 0;
        c.w = 0;
    }

    /// Once both cursors pass the buffer size, pull them back by one
    /// buffer length. No observable effect; keeps the counters small.
    fn normalize(c: &mut Cursors, buf_size: usize) {
        if c.r >= buf_size && c.w >= buf_size {
            c.r -= buf_size;
            c.w -= buf_size;
        }
    }
}

impl<T: Copy> Drop for CircularBuffer<T> {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, 2 * self.buf_size);
            libc::close(self.fd);
        }
    }
}
