//! Shared-memory channel to the audio host: two single-producer
//! single-consumer byte rings back to back in one mapped region, each with
//! a process-shared semaphore for wakeup.
//!
//! `head` belongs to the producer, `tail` to the consumer. One cell is kept
//! unused so `head == tail` always means empty.

use std::cell::UnsafeCell;
use std::ffi::CString;
use std::io;
use std::mem::size_of;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Byte capacity of one ring, sized so a [`RingChannel`] packs into 8 KiB.
pub const RING_DATA_SIZE: usize = 8192 - size_of::<libc::sem_t>() - 2 * size_of::<u32>();

/// One direction of the link.
#[repr(C)]
pub struct RingChannel {
    sem: UnsafeCell<libc::sem_t>,
    head: AtomicU32,
    tail: AtomicU32,
    bytes: UnsafeCell<[u8; RING_DATA_SIZE]>,
}

// Both sides of the process boundary poke at this through a shared mapping;
// the atomics and the semaphore carry the synchronization.
unsafe impl Send for RingChannel {}
unsafe impl Sync for RingChannel {}

/// One typed event as read off a ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventRecord {
    pub event: u8,
    pub page: u8,
    pub subpage: u8,
    pub msg: Vec<u8>,
}

impl RingChannel {
    fn used(&self) -> usize {
        let head = self.head.load(Ordering::Acquire) as usize;
        let tail = self.tail.load(Ordering::Acquire) as usize;
        (head + RING_DATA_SIZE - tail) % RING_DATA_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    /// Copies `data` into the ring in one shot, splitting at the wrap
    /// boundary. Fails without touching anything when the bytes do not fit.
    pub fn write(&self, data: &[u8]) -> bool {
        if data.len() > RING_DATA_SIZE - 1 - self.used() {
            return false;
        }

        let head = self.head.load(Ordering::Acquire) as usize;
        let bytes = self.bytes.get() as *mut u8;
        let first = (RING_DATA_SIZE - head).min(data.len());
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), bytes.add(head), first);
            if first < data.len() {
                std::ptr::copy_nonoverlapping(data[first..].as_ptr(), bytes, data.len() - first);
            }
        }

        self.head
            .store(((head + data.len()) % RING_DATA_SIZE) as u32, Ordering::Release);
        true
    }

    fn pop(&self) -> Option<u8> {
        let tail = self.tail.load(Ordering::Acquire) as usize;
        if tail == self.head.load(Ordering::Acquire) as usize {
            return None;
        }
        let b = unsafe { *(self.bytes.get() as *const u8).add(tail) };
        self.tail
            .store(((tail + 1) % RING_DATA_SIZE) as u32, Ordering::Release);
        Some(b)
    }

    /// Frames `msg` as one event record and writes it atomically.
    pub fn write_record(&self, event: u8, page: u8, subpage: u8, msg: &[u8]) -> bool {
        let mut record = Vec::with_capacity(msg.len() + 4);
        record.push(event);
        record.push(page);
        record.push(subpage);
        record.extend_from_slice(msg);
        record.push(0);
        self.write(&record)
    }

    /// Reads one event record, advancing `tail` past it. Returns `None`
    /// when the ring is empty.
    pub fn read_record(&self) -> Option<EventRecord> {
        let event = self.pop()?;
        let page = self.pop().unwrap_or(0);
        let subpage = self.pop().unwrap_or(0);
        let mut msg = Vec::new();
        while let Some(b) = self.pop() {
            if b == 0 {
                break;
            }
            msg.push(b);
        }
        Some(EventRecord { event, page, subpage, msg })
    }

    fn init_sem(&self) -> io::Result<()> {
        // 1 = shared between processes
        if unsafe { libc::sem_init(self.sem.get(), 1, 0) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn destroy_sem(&self) {
        unsafe {
            libc::sem_destroy(self.sem.get());
        }
    }

    pub fn post(&self) {
        unsafe {
            libc::sem_post(self.sem.get());
        }
    }

    /// Blocks until the semaphore is posted or `timeout` elapses. Returns
    /// whether a post was consumed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut ts = libc::timespec { tv_sec: 0, tv_nsec: 0 };
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        ts.tv_sec += timeout.as_secs() as libc::time_t;
        ts.tv_nsec += timeout.subsec_nanos() as libc::c_long;
        if ts.tv_nsec >= 1_000_000_000 {
            ts.tv_sec += 1;
            ts.tv_nsec -= 1_000_000_000;
        }
        unsafe { libc::sem_timedwait(self.sem.get(), &ts) == 0 }
    }
}

/// The full mapped region.
#[repr(C)]
pub struct RingPair {
    /// events flowing from the audio host into the daemon
    pub to_server: RingChannel,
    /// events flowing from the daemon out to the audio host
    pub to_client: RingChannel,
}

/// Owner of the POSIX shared memory mapping. The creating side zeroes the
/// region, initializes both semaphores and unlinks the name on drop.
pub struct ShmRegion {
    ptr: *mut RingPair,
    fd: libc::c_int,
    name: CString,
    owner: bool,
}

unsafe impl Send for ShmRegion {}
unsafe impl Sync for ShmRegion {}

impl ShmRegion {
    pub fn create(name: &str) -> io::Result<ShmRegion> {
        Self::setup(name, true)
    }

    pub fn open(name: &str) -> io::Result<ShmRegion> {
        Self::setup(name, false)
    }

    fn setup(name: &str, owner: bool) -> io::Result<ShmRegion> {
        let cname = CString::new(name)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "bad shm name"))?;
        let size = size_of::<RingPair>();

        let fd = if owner {
            unsafe {
                libc::shm_open(
                    cname.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600 as libc::mode_t,
                )
            }
        } else {
            unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0) }
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        let fail = |fd: libc::c_int, cname: &CString, owner: bool| {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(fd);
                if owner {
                    libc::shm_unlink(cname.as_ptr());
                }
            }
            err
        };

        if owner && unsafe { libc::ftruncate(fd, size as libc::off_t) } != 0 {
            return Err(fail(fd, &cname, owner));
        }

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(fail(fd, &cname, owner));
        }
        let ptr = ptr as *mut RingPair;

        if owner {
            unsafe {
                std::ptr::write_bytes(ptr as *mut u8, 0, size);
                if (*ptr).to_server.init_sem().is_err() || (*ptr).to_client.init_sem().is_err() {
                    let err = fail(fd, &cname, owner);
                    libc::munmap(ptr as *mut libc::c_void, size);
                    return Err(err);
                }
            }
        }

        Ok(ShmRegion { ptr, fd, name: cname, owner })
    }

    pub fn pair(&self) -> &RingPair {
        unsafe { &*self.ptr }
    }
}

impl Drop for ShmRegion {
    fn drop(&mut self) {
        unsafe {
            if self.owner {
                (*self.ptr).to_server.destroy_sem();
                (*self.ptr).to_client.destroy_sem();
            }
            libc::munmap(self.ptr as *mut libc::c_void, size_of::<RingPair>());
            libc::close(self.fd);
            if self.owner {
                libc::shm_unlink(self.name.as_ptr());
            }
        }
    }
}
