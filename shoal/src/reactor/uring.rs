//! io_uring backend for a reactor.
//!
//! One ring per reactor. Submissions accumulate in a pending batch that
//! the submission poller flushes with a single `io_uring_enter` per loop
//! iteration; the completion poller drains the CQ and hands each result
//! to the completion closure registered at submit time. Every in-flight
//! operation owns its kernel-visible resources (buffers, sockaddr
//! storage, path strings) through the op slab, so nothing moves or frees
//! while the kernel may still touch it.
//!
//! Sleeping is a bounded `submit_and_wait`: the eventfd read is armed so
//! peer reactors and signal handlers can interrupt, and the nearest timer
//! deadline bounds the wait.

use std::ffi::CString;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use io_uring::{IoUring, opcode, squeue, types};
use slab::Slab;

use crate::dma::DmaBuffer;
use crate::error::AsyncResult;
use crate::future::{Future, Promise};

/// user_data reserved for the eventfd wake read.
const WAKE_TOKEN: u64 = u64::MAX;

/// Socket address storage for accept/connect, boxed for a stable address.
pub(crate) struct SockaddrBuf {
    pub storage: libc::sockaddr_storage,
    pub len: libc::socklen_t,
}

impl SockaddrBuf {
    pub fn new() -> Box<SockaddrBuf> {
        Box::new(SockaddrBuf {
            storage: unsafe { std::mem::zeroed() },
            len: std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t,
        })
    }
}

/// msghdr + iovec + address + payload for UDP sendmsg/recvmsg, boxed so
/// the internal pointers stay valid while the op is in flight.
pub(crate) struct MsgBuf {
    pub hdr: libc::msghdr,
    pub iov: libc::iovec,
    pub addr: libc::sockaddr_storage,
    pub buf: Vec<u8>,
}

impl MsgBuf {
    /// A boxed MsgBuf whose msghdr points at its own iovec/address/buffer.
    pub fn new(buf: Vec<u8>) -> Box<MsgBuf> {
        let mut m = Box::new(MsgBuf {
            hdr: unsafe { std::mem::zeroed() },
            iov: libc::iovec {
                iov_base: std::ptr::null_mut(),
                iov_len: 0,
            },
            addr: unsafe { std::mem::zeroed() },
            buf,
        });
        m.iov.iov_base = m.buf.as_mut_ptr() as *mut libc::c_void;
        m.iov.iov_len = m.buf.len();
        m.hdr.msg_iov = &mut m.iov;
        m.hdr.msg_iovlen = 1;
        m.hdr.msg_name = &mut m.addr as *mut _ as *mut libc::c_void;
        m.hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        m
    }
}

/// Resources an in-flight operation keeps alive until its CQE arrives.
/// All variants are heap-backed, so moving the enum never moves the
/// memory the kernel sees.
pub(crate) enum OpRes {
    None,
    Dma(DmaBuffer),
    Bytes(Vec<u8>),
    /// Reference-counted immutable bytes (zero-copy sends).
    Shared(bytes::Bytes),
    Sockaddr(Box<SockaddrBuf>),
    Path(CString),
    PathPair(CString, CString),
    /// Path plus statx output buffer (Statx ops take both).
    PathStatx(CString, Box<libc::statx>),
    Msg(Box<MsgBuf>),
}

impl OpRes {
    pub fn dma(&mut self) -> &mut DmaBuffer {
        match self {
            OpRes::Dma(b) => b,
            _ => unreachable!("op resource is not a dma buffer"),
        }
    }

    pub fn into_dma(self) -> DmaBuffer {
        match self {
            OpRes::Dma(b) => b,
            _ => unreachable!("op resource is not a dma buffer"),
        }
    }

    pub fn bytes(&mut self) -> &mut Vec<u8> {
        match self {
            OpRes::Bytes(b) => b,
            _ => unreachable!("op resource is not a byte buffer"),
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            OpRes::Bytes(b) => b,
            _ => unreachable!("op resource is not a byte buffer"),
        }
    }

    pub fn shared(&self) -> &bytes::Bytes {
        match self {
            OpRes::Shared(b) => b,
            _ => unreachable!("op resource is not shared bytes"),
        }
    }

    pub fn sockaddr(&mut self) -> &mut SockaddrBuf {
        match self {
            OpRes::Sockaddr(b) => b,
            _ => unreachable!("op resource is not sockaddr storage"),
        }
    }

    pub fn into_sockaddr(self) -> Box<SockaddrBuf> {
        match self {
            OpRes::Sockaddr(b) => b,
            _ => unreachable!("op resource is not sockaddr storage"),
        }
    }

    pub fn path_statx(&mut self) -> (&CString, &mut libc::statx) {
        match self {
            OpRes::PathStatx(p, b) => (p, b),
            _ => unreachable!("op resource is not a statx buffer"),
        }
    }

    pub fn into_statx(self) -> Box<libc::statx> {
        match self {
            OpRes::PathStatx(_, b) => b,
            _ => unreachable!("op resource is not a statx buffer"),
        }
    }

    pub fn path(&self) -> &CString {
        match self {
            OpRes::Path(p) => p,
            _ => unreachable!("op resource is not a path"),
        }
    }

    pub fn path_pair(&self) -> (&CString, &CString) {
        match self {
            OpRes::PathPair(a, b) => (a, b),
            _ => unreachable!("op resource is not a path pair"),
        }
    }

    pub fn msg(&mut self) -> &mut MsgBuf {
        match self {
            OpRes::Msg(m) => m,
            _ => unreachable!("op resource is not a msghdr"),
        }
    }

    pub fn into_msg(self) -> Box<MsgBuf> {
        match self {
            OpRes::Msg(m) => m,
            _ => unreachable!("op resource is not a msghdr"),
        }
    }
}

type CompleteFn = Box<dyn FnOnce(i32, OpRes)>;

struct OpEntry {
    complete: CompleteFn,
    res: OpRes,
}

/// A reaped completion, ready to run outside the ring borrow.
pub(crate) struct Completed {
    complete: CompleteFn,
    result: i32,
    res: OpRes,
}

impl Completed {
    pub fn run(self) {
        (self.complete)(self.result, self.res);
    }
}

pub(crate) struct Uring {
    ring: IoUring,
    ops: Slab<OpEntry>,
    pending: Vec<squeue::Entry>,
    eventfd: RawFd,
    eventfd_buf: Box<u64>,
    wake_armed: bool,
}

impl Uring {
    pub fn new(sq_entries: u32) -> io::Result<Uring> {
        let ring = IoUring::builder().build(sq_entries)?;
        let eventfd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if eventfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Uring {
            ring,
            ops: Slab::with_capacity(sq_entries as usize),
            pending: Vec::new(),
            eventfd,
            eventfd_buf: Box::new(0),
            wake_armed: false,
        })
    }

    /// The fd peers write to wake this reactor out of `wait()`.
    pub fn wake_fd(&self) -> RawFd {
        self.eventfd
    }

    /// Write a wake token into a reactor's eventfd. Async-signal-safe.
    pub fn notify(fd: RawFd) {
        let val: u64 = 1;
        unsafe {
            libc::write(fd, &val as *const u64 as *const libc::c_void, 8);
        }
    }

    /// Queue an operation. `build` constructs the SQE against the op's
    /// resources after they reached their final heap location; `complete`
    /// receives the raw CQE result and the resources back.
    pub fn submit_op(
        &mut self,
        mut res: OpRes,
        build: impl FnOnce(&mut OpRes) -> squeue::Entry,
        complete: CompleteFn,
    ) -> u64 {
        let entry = build(&mut res);
        let vacant = self.ops.vacant_entry();
        let key = vacant.key() as u64;
        debug_assert_ne!(key, WAKE_TOKEN);
        vacant.insert(OpEntry { complete, res });
        self.pending.push(entry.user_data(key));
        key
    }

    /// Queue an operation and return a future for its mapped result.
    pub fn submit<T: 'static>(
        &mut self,
        res: OpRes,
        build: impl FnOnce(&mut OpRes) -> squeue::Entry,
        map: impl FnOnce(i32, OpRes) -> AsyncResult<T> + 'static,
    ) -> Future<T> {
        self.submit_keyed(res, build, map).1
    }

    /// Like [`submit`](Self::submit), also returning the op key so the
    /// caller can [`cancel`](Self::cancel) the operation later.
    pub fn submit_keyed<T: 'static>(
        &mut self,
        res: OpRes,
        build: impl FnOnce(&mut OpRes) -> squeue::Entry,
        map: impl FnOnce(i32, OpRes) -> AsyncResult<T> + 'static,
    ) -> (u64, Future<T>) {
        let mut p = Promise::new();
        let fut = p.get_future();
        let key = self.submit_op(res, build, Box::new(move |ret, res| p.set_result(map(ret, res))));
        (key, fut)
    }

    /// Ask the kernel to cancel the operation with the given key. The
    /// canceled op completes with -ECANCELED through its own CQE.
    pub fn cancel(&mut self, target: u64) {
        self.submit_op(
            OpRes::None,
            |_| opcode::AsyncCancel::new(target).build(),
            Box::new(|_, _| {}),
        );
    }

    /// Move the pending batch into the SQ and submit it. One syscall per
    /// loop iteration regardless of how many operations accumulated.
    pub fn flush(&mut self) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        for entry in std::mem::take(&mut self.pending) {
            unsafe {
                if self.ring.submission().push(&entry).is_err() {
                    let _ = self.ring.submit();
                    if self.ring.submission().push(&entry).is_err() {
                        // SQ still full: put it back for the next round.
                        self.pending.push(entry);
                        break;
                    }
                }
            }
        }
        let _ = self.ring.submit();
        true
    }

    /// Drain the CQ. The returned completions are run by the caller after
    /// this borrow ends, so completion code may re-enter the ring.
    pub fn take_completions(&mut self) -> Vec<Completed> {
        let mut cqes = Vec::new();
        for cqe in self.ring.completion() {
            cqes.push((cqe.user_data(), cqe.result()));
        }
        let mut out = Vec::with_capacity(cqes.len());
        for (user_data, result) in cqes {
            if user_data == WAKE_TOKEN {
                self.wake_armed = false;
                continue;
            }
            let key = user_data as usize;
            if !self.ops.contains(key) {
                continue;
            }
            let entry = self.ops.remove(key);
            out.push(Completed {
                complete: entry.complete,
                result,
                res: entry.res,
            });
        }
        out
    }

    /// Arm the eventfd read so a peer's `notify()` produces a CQE.
    pub fn arm_wake(&mut self) {
        if self.wake_armed {
            return;
        }
        let buf: *mut u64 = &mut *self.eventfd_buf;
        let entry = opcode::Read::new(types::Fd(self.eventfd), buf as *mut u8, 8)
            .build()
            .user_data(WAKE_TOKEN);
        self.pending.push(entry);
        self.wake_armed = true;
    }

    /// Block until a completion arrives, bounded by `timeout`. Pending
    /// submissions are flushed as part of the same syscall.
    pub fn wait(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        self.flush();
        let res = match timeout {
            Some(d) => {
                let ts = types::Timespec::new()
                    .sec(d.as_secs())
                    .nsec(d.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submitter().submit_and_wait(1),
        };
        match res {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.raw_os_error(),
                    Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY)
                ) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for Uring {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.eventfd);
        }
    }
}

/// Map a raw CQE result to a byte count, treating negative values as
/// errno failures.
pub(crate) fn check_len(ret: i32) -> AsyncResult<usize> {
    if ret < 0 {
        Err(crate::error::Error::from_errno(-ret))
    } else {
        Ok(ret as usize)
    }
}

/// Map a raw CQE result to success/failure.
pub(crate) fn check_zero(ret: i32) -> AsyncResult<()> {
    if ret < 0 {
        Err(crate::error::Error::from_errno(-ret))
    } else {
        Ok(())
    }
}
