//! Thin, unsafe bindings to the System-V message queue and shared-memory
//! syscalls (`msgget`/`msgsnd`/`msgrcv`/`msgctl`, `shmget`/`shmat`/`shmdt`/
//! `shmctl`), grounded on `shm_channel.c`'s direct libc calls. Every function
//! here returns `io::Result` instead of the original's bare `-1`/`errno`
//! convention; nothing above this module touches `libc` directly.

use std::io;

/// Permission bits the original C source hard-codes on every `msgget`/
/// `shmget` call (`0666`).
const DEFAULT_PERMS: libc::c_int = 0o666;

fn last_os_error() -> io::Error {
    io::Error::last_os_error()
}

/// Creates (or opens, if already present) the message queue identified by
/// `key`. Mirrors `shm_init_msg_que`'s `IPC_CREAT` call.
pub fn msgget_create(key: libc::key_t) -> io::Result<libc::c_int> {
    let id = unsafe { libc::msgget(key, DEFAULT_PERMS | libc::IPC_CREAT) };
    if id == -1 {
        return Err(last_os_error());
    }
    Ok(id)
}

/// Opens an existing message queue without creating it. Mirrors
/// `shm_connect_to_msg_que`'s bare `msgget` call.
pub fn msgget_connect(key: libc::key_t) -> io::Result<libc::c_int> {
    let id = unsafe { libc::msgget(key, DEFAULT_PERMS) };
    if id == -1 {
        return Err(last_os_error());
    }
    Ok(id)
}

pub fn msgctl_remove(msqid: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::msgctl(msqid, libc::IPC_RMID, std::ptr::null_mut()) };
    if ret == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Sends `payload` (a `#[repr(C)]` fixed-size struct) tagged with `mtype` on
/// the queue `msqid`. `mtype` must be strictly positive, per `msgsnd(2)`.
///
/// # Safety
/// `T` must be `#[repr(C)]`, contain no padding the kernel would read as
/// uninitialized, and not require `Drop` (the bytes are copied verbatim into
/// the kernel buffer; the original `T` is left intact for the caller to drop
/// normally afterward).
pub unsafe fn msgsnd<T: Copy>(msqid: libc::c_int, mtype: libc::c_long, payload: &T) -> io::Result<()> {
    #[repr(C)]
    struct Envelope<T> {
        mtype: libc::c_long,
        data: T,
    }
    let envelope = Envelope {
        mtype,
        data: *payload,
    };
    let size = std::mem::size_of::<T>();
    let ptr = &envelope as *const Envelope<T> as *const libc::c_void;
    let ret = libc::msgsnd(msqid, ptr, size, 0);
    if ret == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Whether `msgrcv` blocks until a matching message arrives or returns
/// immediately with `ENOMSG`/`EAGAIN` when none is queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvMode {
    Wait,
    NoWait,
}

/// Receives a message of the given `mtype` from `msqid` into a freshly
/// zeroed `T`. Returns `Ok(None)` when `mode` is `NoWait` and nothing is
/// queued yet.
///
/// # Safety
/// Same layout requirements on `T` as [`msgsnd`].
pub unsafe fn msgrcv<T: Copy>(
    msqid: libc::c_int,
    mtype: libc::c_long,
    mode: RecvMode,
) -> io::Result<Option<T>> {
    #[repr(C)]
    struct Envelope<T> {
        mtype: libc::c_long,
        data: T,
    }
    let mut envelope: Envelope<T> = std::mem::zeroed();
    let size = std::mem::size_of::<T>();
    let flags = if mode == RecvMode::NoWait {
        libc::IPC_NOWAIT
    } else {
        0
    };
    let ptr = &mut envelope as *mut Envelope<T> as *mut libc::c_void;
    let ret = libc::msgrcv(msqid, ptr, size, mtype, flags);
    if ret == -1 {
        let err = last_os_error();
        if mode == RecvMode::NoWait {
            if let Some(code) = err.raw_os_error() {
                if code == libc::ENOMSG || code == libc::EAGAIN {
                    return Ok(None);
                }
            }
        }
        return Err(err);
    }
    Ok(Some(envelope.data))
}

/// Creates (or opens) a shared-memory segment of `size` bytes under `key`.
/// Mirrors `shm_init_mem_segs`'s per-segment `shmget`.
pub fn shmget_create(key: libc::key_t, size: usize) -> io::Result<libc::c_int> {
    let id = unsafe { libc::shmget(key, size, DEFAULT_PERMS | libc::IPC_CREAT) };
    if id == -1 {
        return Err(last_os_error());
    }
    Ok(id)
}

pub fn shmctl_remove(shmid: libc::c_int) -> io::Result<()> {
    let ret = unsafe { libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut()) };
    if ret == -1 {
        return Err(last_os_error());
    }
    Ok(())
}

/// Attaches segment `shmid` into this process's address space.
///
/// # Safety
/// The returned pointer is valid only until a matching [`shmdt`] call and
/// must not outlive the segment's lifetime; concurrent readers/writers must
/// coordinate externally (the shared-memory segment provides no locking of
/// its own, matching the original `shm_attach_mem_seg`).
pub unsafe fn shmat(shmid: libc::c_int) -> io::Result<*mut libc::c_void> {
    let addr = libc::shmat(shmid, std::ptr::null(), 0);
    if addr == usize::MAX as *mut libc::c_void {
        return Err(last_os_error());
    }
    Ok(addr)
}

/// # Safety
/// `addr` must have come from a prior successful [`shmat`] call on the same
/// segment and must not be used again afterward.
pub unsafe fn shmdt(addr: *mut libc::c_void) -> io::Result<()> {
    let ret = libc::shmdt(addr);
    if ret == -1 {
        return Err(last_os_error());
    }
    Ok(())
}
