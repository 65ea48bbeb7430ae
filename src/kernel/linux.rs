//! Production kernel backend.

use super::KernelOps;
use rustix::fd::{AsRawFd, BorrowedFd, OwnedFd};
use rustix::fs::{Mode, OFlags};
use std::ffi::c_void;
use std::path::Path;

/// Issues real syscalls against the running kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct LinuxKernel;

impl LinuxKernel {
    /// Create the production backend.
    pub fn new() -> Self {
        Self
    }
}

impl KernelOps for LinuxKernel {
    fn open_device(&self, path: &Path) -> rustix::io::Result<OwnedFd> {
        rustix::fs::open(path, OFlags::RDONLY | OFlags::CLOEXEC, Mode::empty())
    }

    unsafe fn ioctl(
        &self,
        fd: BorrowedFd<'_>,
        request: u32,
        arg: *mut c_void,
    ) -> rustix::io::Result<()> {
        // SAFETY: the caller guarantees `arg` matches `request`.
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), request as libc::Ioctl, arg) };
        if ret < 0 {
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO);
            return Err(rustix::io::Errno::from_raw_os_error(errno));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::ioctl::{ION_IOC_FREE, LegacyHandleData};
    use rustix::fd::AsFd;

    #[test]
    fn test_open_missing_device() {
        let kernel = LinuxKernel::new();
        let err = kernel
            .open_device(Path::new("/nonexistent/dmabuf-gralloc/ion"))
            .unwrap_err();
        assert_eq!(err, rustix::io::Errno::NOENT);
    }

    #[test]
    fn test_ioctl_on_regular_fd_is_not_a_tty() {
        let kernel = LinuxKernel::new();
        let fd = rustix::fs::memfd_create("test_ioctl", rustix::fs::MemfdFlags::CLOEXEC).unwrap();
        let mut data = LegacyHandleData::default();

        let err = unsafe {
            kernel.ioctl(
                fd.as_fd(),
                ION_IOC_FREE,
                (&mut data as *mut LegacyHandleData).cast(),
            )
        }
        .unwrap_err();
        assert_eq!(err, rustix::io::Errno::NOTTY);
    }
}
