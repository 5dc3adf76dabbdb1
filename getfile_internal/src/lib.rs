//! Low-level System-V IPC bindings used by the GETFILE proxy and cache
//! daemon to hand off file content without a second TCP hop. Everything
//! exposed here is unsafe-adjacent by nature (raw syscalls, shared memory);
//! [`getfile::pipeline`] is where callers get a safe, typed request/response
//! shape built on top of it.

pub mod ipc;
pub mod segment;
mod sysv;

pub use ipc::{
    ClientChannel, Error as IpcError, HeaderTag, IpcStatus, MessageQueue, RequestInfo,
    ResponseInfo, ServerChannel, CONNECT_BACKOFF, CONNECT_RETRIES,
};
pub use segment::{attach_by_id, AttachedSegment, Error as SegmentError, Segment, SegmentPool};

/// The message queue key the cache daemon creates and the proxy connects to,
/// matching `shm_channel.c`'s `_mq_key = 99999`.
pub const MESSAGE_QUEUE_KEY: libc::key_t = 99999;
