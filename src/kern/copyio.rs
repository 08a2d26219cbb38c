//! Copyin/Copyout - User <-> Kernel Data Transfer
//!
//! User pointers are range-checked, then dereferenced inside a
//! fault-resumable call: a page fault or protection fault on a bad user
//! address becomes `KernError::Fault` instead of a kernel panic.

use core::ptr;

use super::fault::{fault_resumable_call, GPF_MASK, PAGE_FAULT_MASK};
use crate::error::{KResult, KernError};

/// Faults a user copy may recover from
pub const COPYIO_FAULTS_MASK: u32 = PAGE_FAULT_MASK | GPF_MASK;

/// User space address range limits
#[cfg(target_arch = "x86_64")]
pub const USER_SPACE_END: usize = 0x0000_7FFF_FFFF_FFFF;

#[cfg(target_arch = "aarch64")]
pub const USER_SPACE_END: usize = 0x0000_FFFF_FFFF_FFFF;

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
pub const USER_SPACE_END: usize = 0xBFFF_FFFF;

/// The first page is never mapped
pub const USER_SPACE_START: usize = 0x1000;

/// Check if an address is in user space
#[inline]
pub fn is_user_address(addr: usize) -> bool {
    (USER_SPACE_START..=USER_SPACE_END).contains(&addr)
}

/// Check if an address range is entirely in user space
#[inline]
pub fn is_user_range(addr: usize, size: usize) -> bool {
    if size == 0 {
        return true;
    }
    match addr.checked_add(size - 1) {
        Some(end) => is_user_address(addr) && is_user_address(end),
        None => false,
    }
}

/// Copy `dest.len()` bytes from user address `src`
pub fn copy_from_user(dest: &mut [u8], src: usize) -> KResult<()> {
    if !is_user_range(src, dest.len()) {
        return Err(KernError::Fault);
    }
    fault_resumable_call(COPYIO_FAULTS_MASK, || {
        // SAFETY: src is a user-range address; a bad mapping faults and is
        // recovered from by the enclosing call.
        unsafe { ptr::copy_nonoverlapping(src as *const u8, dest.as_mut_ptr(), dest.len()) }
    })
    .map_err(|_| KernError::Fault)
}

/// Copy `src` to user address `dest`
pub fn copy_to_user(dest: usize, src: &[u8]) -> KResult<()> {
    if !is_user_range(dest, src.len()) {
        return Err(KernError::Fault);
    }
    fault_resumable_call(COPYIO_FAULTS_MASK, || {
        // SAFETY: as in copy_from_user
        unsafe { ptr::copy_nonoverlapping(src.as_ptr(), dest as *mut u8, src.len()) }
    })
    .map_err(|_| KernError::Fault)
}

/// Copy a NUL-terminated string from user address `src` into `dest`,
/// terminator included. Returns the string length.
pub fn copy_str_from_user(dest: &mut [u8], src: usize) -> KResult<usize> {
    if dest.is_empty() {
        return Err(KernError::Invalid);
    }
    let r = fault_resumable_call(COPYIO_FAULTS_MASK, || {
        for (i, slot) in dest.iter_mut().enumerate() {
            let addr = src.checked_add(i).filter(|&a| is_user_address(a))?;
            // SAFETY: as in copy_from_user
            let byte = unsafe { ptr::read(addr as *const u8) };
            *slot = byte;
            if byte == 0 {
                return Some(Ok(i));
            }
        }
        Some(Err(KernError::NoSpace))
    });
    match r {
        Ok(Some(res)) => res,
        Ok(None) | Err(_) => Err(KernError::Fault),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;
    use alloc::vec;

    #[test]
    fn test_is_user_range() {
        assert!(is_user_range(0x1000, 0x100));
        assert!(is_user_range(0, 0));
        assert!(!is_user_address(0));
        assert!(!is_user_address(usize::MAX));
        // Range that wraps around
        assert!(!is_user_range(usize::MAX - 10, 100));
    }

    #[test]
    fn test_copy_round_trip() {
        let _k = testing::boot();
        let user = vec![1u8, 2, 3, 4];
        let mut kernel = [0u8; 4];
        copy_from_user(&mut kernel, user.as_ptr() as usize).unwrap();
        assert_eq!(kernel, [1, 2, 3, 4]);

        let mut out = vec![0u8; 4];
        copy_to_user(out.as_mut_ptr() as usize, &[9, 8, 7, 6]).unwrap();
        assert_eq!(out, [9, 8, 7, 6]);
    }

    #[test]
    fn test_bad_addresses_rejected() {
        let _k = testing::boot();
        let mut buf = [0u8; 8];
        assert_eq!(copy_from_user(&mut buf, 0), Err(KernError::Fault));
        assert_eq!(copy_from_user(&mut buf, usize::MAX - 3), Err(KernError::Fault));
        assert_eq!(copy_to_user(usize::MAX - 3, &buf), Err(KernError::Fault));
    }

    #[test]
    fn test_copy_str() {
        let _k = testing::boot();
        let user = b"hello\0world";
        let mut buf = [0u8; 16];
        assert_eq!(copy_str_from_user(&mut buf, user.as_ptr() as usize), Ok(5));
        assert_eq!(&buf[..6], b"hello\0");

        let mut small = [0u8; 3];
        assert_eq!(
            copy_str_from_user(&mut small, user.as_ptr() as usize),
            Err(KernError::NoSpace)
        );
        assert_eq!(copy_str_from_user(&mut buf, 0), Err(KernError::Fault));
    }
}
