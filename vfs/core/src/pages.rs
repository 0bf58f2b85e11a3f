//! Page arithmetic and the raw host mapping primitives.
//!
//! Everything here deals in `usize` addresses so callers stay `Send`/`Sync`;
//! the actual pointers only exist inside the unsafe blocks.

use std::io;
use std::ptr;

use crate::error::{Errno, VfsError, VfsResult};
use crate::flags::ProtFlags;

pub fn page_size() -> usize {
    region::page::size()
}

pub fn is_page_aligned(value: usize) -> bool {
    value & (page_size() - 1) == 0
}

/// Round `size` up to the nearest multiple of the host page size.
pub fn round_up_to_page_size(size: usize) -> usize {
    let page_size = page_size();
    (size + (page_size - 1)) & !(page_size - 1)
}

pub fn page_align_down(addr: usize) -> usize {
    addr & !(page_size() - 1)
}

fn last_errno(context: &'static str) -> VfsError {
    VfsError::new(Errno::from_io_error(&io::Error::last_os_error()), context)
}

/// Map fresh zero-filled anonymous pages, honoring a fixed placement when
/// `fixed` is set.
pub fn map_anonymous(addr: usize, len: usize, prot: ProtFlags, fixed: bool) -> VfsResult<usize> {
    let mut flags = libc::MAP_PRIVATE | libc::MAP_ANONYMOUS;
    if fixed {
        flags |= libc::MAP_FIXED;
    }
    let hint = if addr == 0 {
        ptr::null_mut()
    } else {
        addr as *mut libc::c_void
    };
    let ptr = unsafe { libc::mmap(hint, len, prot.bits(), flags, -1, 0) };
    if ptr == libc::MAP_FAILED {
        return Err(last_errno("pages.map_anonymous"));
    }
    Ok(ptr as usize)
}

pub fn unmap(addr: usize, len: usize) -> VfsResult<()> {
    let rc = unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    if rc != 0 {
        return Err(last_errno("pages.unmap"));
    }
    Ok(())
}

pub fn protect(addr: usize, len: usize, prot: ProtFlags) -> VfsResult<()> {
    let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, prot.bits()) };
    if rc != 0 {
        return Err(last_errno("pages.protect"));
    }
    Ok(())
}

pub fn advise(addr: usize, len: usize, advice: i32) -> VfsResult<()> {
    let rc = unsafe { libc::madvise(addr as *mut libc::c_void, len, advice) };
    if rc != 0 {
        return Err(last_errno("pages.advise"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding() {
        let page = page_size();
        assert_eq!(round_up_to_page_size(0), 0);
        assert_eq!(round_up_to_page_size(1), page);
        assert_eq!(round_up_to_page_size(page), page);
        assert_eq!(round_up_to_page_size(page + 1), 2 * page);
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(page));
        assert!(!is_page_aligned(page + 1));
    }

    #[test]
    fn anonymous_map_round_trip() {
        let page = page_size();
        let addr = map_anonymous(0, page, ProtFlags::READ | ProtFlags::WRITE, false)
            .expect("map_anonymous");
        assert!(is_page_aligned(addr));
        unsafe {
            *(addr as *mut u8) = 0xa5;
            assert_eq!(*(addr as *const u8), 0xa5);
        }
        protect(addr, page, ProtFlags::READ).expect("protect");
        unmap(addr, page).expect("unmap");
    }
}
