//! Scratch memory from a DMA heap (`/dev/dma_heap/*`).
use log::trace;
use std::{
    fs::{File, OpenOptions},
    io,
    os::unix::io::{AsRawFd, FromRawFd},
    path::Path,
    ptr::null_mut,
    slice,
};

use super::{sys, DmaAllocator, DmaBuffer};
use crate::surface::DmaBufRef;

#[derive(Debug)]
pub struct DmaHeap {
    file: File,
}

impl DmaHeap {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }
}

impl DmaAllocator for DmaHeap {
    type Buffer = HeapBuffer;

    fn allocate(&self, len: usize) -> io::Result<HeapBuffer> {
        let mut req = sys::dma_heap_allocation_data {
            len: len as u64,
            fd_flags: (libc::O_RDWR | libc::O_CLOEXEC) as u32,
            ..Default::default()
        };
        unsafe { sys::ioctl(self.file.as_raw_fd(), sys::DMA_HEAP_IOCTL_ALLOC, &mut req) }?;
        trace!("Allocated {} bytes as dmabuf#{}", len, req.fd);

        Ok(HeapBuffer {
            file: unsafe { File::from_raw_fd(req.fd as i32) },
            len,
        })
    }
}

/// A DMA-buf allocated from a `DmaHeap`. Closed on drop.
#[derive(Debug)]
pub struct HeapBuffer {
    file: File,
    len: usize,
}

/// A CPU mapping bracketed by `DMA_BUF_IOCTL_SYNC`.
struct Mapping<'a> {
    buffer: &'a HeapBuffer,
    ptr: *mut libc::c_void,
}

impl<'a> Mapping<'a> {
    fn new(buffer: &'a HeapBuffer) -> io::Result<Self> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                buffer.len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                buffer.file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let this = Self { buffer, ptr };
        this.sync(sys::DMA_BUF_SYNC_START)?;
        Ok(this)
    }

    fn sync(&self, flags: u64) -> io::Result<()> {
        let mut req = sys::dma_buf_sync {
            flags: flags | sys::DMA_BUF_SYNC_RW,
        };
        unsafe { sys::ioctl(self.buffer.file.as_raw_fd(), sys::DMA_BUF_IOCTL_SYNC, &mut req) }
    }

    fn bytes(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.ptr as *mut u8, self.buffer.len) }
    }
}

impl Drop for Mapping<'_> {
    fn drop(&mut self) {
        let _ = self.sync(sys::DMA_BUF_SYNC_END);
        unsafe {
            libc::munmap(self.ptr, self.buffer.len);
        }
    }
}

impl DmaBuffer for HeapBuffer {
    fn fd(&self) -> DmaBufRef {
        DmaBufRef::borrow_raw(self.file.as_raw_fd())
    }

    fn len(&self) -> usize {
        self.len
    }

    fn write_with(&mut self, f: &mut dyn FnMut(&mut [u8])) -> io::Result<()> {
        let mut mapping = Mapping::new(self)?;
        f(mapping.bytes());
        Ok(())
    }
}
