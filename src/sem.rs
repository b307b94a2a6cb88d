//! Process-shared counting semaphore.
//!
//! The `sem_t` lives in an anonymous `MAP_SHARED` mapping so posts and
//! waits pair up across the fork boundary. The caller owns the lifecycle:
//! one semaphore per run, created before any worker forks and destroyed
//! on drop.

use std::ptr::NonNull;

use nix::errno::Errno;

use crate::error::{Error, Result};

pub struct Semaphore {
    sem: NonNull<libc::sem_t>,
    map_len: usize,
}

// sem_t is explicitly initialised for cross-process use (pshared = 1).
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    pub fn new(initial: u32) -> Result<Self> {
        let map_len = std::mem::size_of::<libc::sem_t>();
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                map_len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::sys("semaphore", "mmap", Errno::last()));
        }
        let sem = ptr as *mut libc::sem_t;
        if unsafe { libc::sem_init(sem, 1, initial) } != 0 {
            let err = Errno::last();
            unsafe { libc::munmap(ptr, map_len) };
            return Err(Error::sys("semaphore", "sem_init", err));
        }
        Ok(Semaphore {
            sem: NonNull::new(sem).expect("mmap returned null"),
            map_len,
        })
    }

    pub fn wait(&self) -> std::result::Result<(), Errno> {
        if unsafe { libc::sem_wait(self.sem.as_ptr()) } < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    pub fn post(&self) -> std::result::Result<(), Errno> {
        if unsafe { libc::sem_post(self.sem.as_ptr()) } < 0 {
            Err(Errno::last())
        } else {
            Ok(())
        }
    }

    pub fn value(&self) -> std::result::Result<i32, Errno> {
        let mut value: libc::c_int = 0;
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut value) } < 0 {
            Err(Errno::last())
        } else {
            Ok(value)
        }
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.sem.as_ptr());
            libc::munmap(self.sem.as_ptr() as *mut libc::c_void, self.map_len);
        }
    }
}
