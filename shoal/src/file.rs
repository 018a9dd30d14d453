//! The asynchronous file layer.
//!
//! Files are uncached and unbuffered: data moves by DMA, which constrains
//! file offsets, buffer addresses and transfer lengths to the file's
//! reported alignments. `dma_read`/`dma_write` are the raw aligned
//! operations; `dma_read_bulk` accepts arbitrary offsets and lengths by
//! over-reading aligned ranges and trimming, with a fallback loop that
//! tells EOF apart from transient short reads (an `EINVAL` from a
//! realigned read at the end of an unaligned file means EOF).
//!
//! Every data operation is queued under an I/O priority class through the
//! reactor's fair queue. Metadata operations go straight to the ring;
//! the few calls the ring cannot express on supported kernels
//! (`ftruncate`, `statfs`) are issued inline.

use std::cell::RefCell;
use std::ffi::CString;
use std::ops::BitOr;
use std::os::fd::RawFd;
use std::rc::Rc;

use io_uring::{opcode, types};

use crate::dma::{DmaBuffer, align_up};
use crate::error::{AsyncResult, Error};
use crate::future::Future;
use crate::future::iterate::do_until;
use crate::io_queue::IoPriorityClass;
use crate::metrics;
use crate::reactor;
use crate::reactor::uring::{OpRes, check_len, check_zero};

/// Open flags for [`open_file_dma`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags(i32);

impl OpenFlags {
    pub const RO: OpenFlags = OpenFlags(libc::O_RDONLY);
    pub const WO: OpenFlags = OpenFlags(libc::O_WRONLY);
    pub const RW: OpenFlags = OpenFlags(libc::O_RDWR);
    pub const CREATE: OpenFlags = OpenFlags(libc::O_CREAT);
    pub const TRUNCATE: OpenFlags = OpenFlags(libc::O_TRUNC);
    pub const EXCLUSIVE: OpenFlags = OpenFlags(libc::O_EXCL);

    fn bits(self) -> i32 {
        self.0
    }
}

impl BitOr for OpenFlags {
    type Output = OpenFlags;
    fn bitor(self, rhs: OpenFlags) -> OpenFlags {
        OpenFlags(self.0 | rhs.0)
    }
}

/// Directory entry kinds reported by [`file_type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntryType {
    BlockDevice,
    CharDevice,
    Directory,
    Fifo,
    Link,
    Regular,
    Socket,
}

/// Filesystem kinds reported by [`file_system_at`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Xfs,
    Ext,
    Btrfs,
    Tmpfs,
    Other,
}

struct FileInner {
    fd: RawFd,
    memory_dma_alignment: u64,
    disk_read_dma_alignment: u64,
    disk_write_dma_alignment: u64,
}

/// A data file on persistent storage.
///
/// Reference-counted: clones share the underlying descriptor. Closing is
/// explicit and awaitable; the descriptor is not closed on drop.
#[derive(Clone)]
pub struct File {
    inner: Rc<FileInner>,
}

struct ReadState {
    buf: DmaBuffer,
    pos: usize,
    front: usize,
    to_read: usize,
    offset: u64,
    eof: bool,
}

impl File {
    fn from_fd(fd: RawFd) -> File {
        File {
            inner: Rc::new(FileInner {
                fd,
                memory_dma_alignment: 4096,
                disk_read_dma_alignment: 4096,
                disk_write_dma_alignment: 4096,
            }),
        }
    }

    /// Alignment requirement for data buffer addresses.
    pub fn memory_dma_alignment(&self) -> u64 {
        self.inner.memory_dma_alignment
    }

    /// Alignment requirement for read offsets and lengths.
    pub fn disk_read_dma_alignment(&self) -> u64 {
        self.inner.disk_read_dma_alignment
    }

    /// Alignment requirement for write offsets and lengths.
    pub fn disk_write_dma_alignment(&self) -> u64 {
        self.inner.disk_write_dma_alignment
    }

    /// Allocate a buffer meeting this file's alignment requirements,
    /// sized up to the read alignment.
    pub fn allocate_dma_buffer(&self, size: usize) -> DmaBuffer {
        let size = align_up(size as u64, self.disk_read_dma_alignment()) as usize;
        DmaBuffer::zeroed(size, self.memory_dma_alignment() as usize)
    }

    /// Single DMA read at an aligned position. `pos` and the buffer
    /// length must meet the disk alignment; the buffer address must meet
    /// the memory alignment. Resolves with the byte count actually read
    /// (short = EOF) and the buffer.
    pub fn dma_read(
        &self,
        pos: u64,
        mut buf: DmaBuffer,
        pc: IoPriorityClass,
    ) -> Future<(usize, DmaBuffer)> {
        // No position assert: the EOF-detection path deliberately issues
        // a realigned read whose EINVAL is reinterpreted as end-of-file.
        debug_assert_eq!(buf.as_ptr() as u64 % self.memory_dma_alignment(), 0);
        let fd = self.inner.fd;
        let len = buf.len();
        let ptr = buf.as_mut_ptr();
        reactor::local().submit_disk_io(
            pc,
            len,
            OpRes::Dma(buf),
            move |_res| {
                opcode::Read::new(types::Fd(fd), ptr, len as u32)
                    .offset(pos)
                    .build()
            },
            |ret, res| {
                let buf = res.into_dma();
                let n = check_len(ret)?;
                metrics::IO_READS.increment();
                metrics::IO_READ_BYTES.add(n as u64);
                Ok((n, buf))
            },
        )
    }

    /// Single DMA write at an aligned position. Resolves with the byte
    /// count written and the buffer.
    pub fn dma_write(
        &self,
        pos: u64,
        buf: DmaBuffer,
        pc: IoPriorityClass,
    ) -> Future<(usize, DmaBuffer)> {
        debug_assert_eq!(buf.as_ptr() as u64 % self.memory_dma_alignment(), 0);
        let fd = self.inner.fd;
        let len = buf.len();
        let ptr = buf.as_ptr();
        reactor::local().submit_disk_io(
            pc,
            len,
            OpRes::Dma(buf),
            move |_res| {
                opcode::Write::new(types::Fd(fd), ptr, len as u32)
                    .offset(pos)
                    .build()
            },
            |ret, res| {
                let buf = res.into_dma();
                let n = check_len(ret)?;
                metrics::IO_WRITES.increment();
                metrics::IO_WRITE_BYTES.add(n as u64);
                Ok((n, buf))
            },
        )
    }

    /// Read a bulk covering arbitrary `offset`/`range_size`: aligns the
    /// offset down, over-reads to the next alignment boundary, and trims
    /// the window to the requested range. A short first read enters a
    /// fallback loop of single aligned reads to find EOF.
    pub fn dma_read_bulk(
        &self,
        offset: u64,
        range_size: usize,
        pc: IoPriorityClass,
    ) -> Future<DmaBuffer> {
        if range_size == 0 {
            return Future::ready(DmaBuffer::empty());
        }
        let align = self.disk_read_dma_alignment();
        let front = (offset & (align - 1)) as usize;
        let start = offset - front as u64;
        let to_read = range_size + front;
        let buf = DmaBuffer::zeroed(
            align_up(to_read as u64, align) as usize,
            self.memory_dma_alignment() as usize,
        );

        let file = self.clone();
        self.dma_read(start, buf, pc).then(move |(size, buf)| {
            let state = Rc::new(RefCell::new(ReadState {
                buf,
                pos: size,
                front,
                to_read,
                offset: start,
                eof: false,
            }));

            // Short first read: issue single reads from where it stopped
            // until the range is covered or EOF shows up. Short reads due
            // to I/O glitches end at block boundaries, so the next read
            // stays aligned.
            let st_cond = state.clone();
            let st_body = state.clone();
            let st_done = state.clone();
            do_until(
                move || {
                    let s = st_cond.borrow();
                    s.eof || s.pos >= s.to_read
                },
                move || {
                    let (cur_offset, left) = {
                        let s = st_body.borrow();
                        (s.offset + s.pos as u64, s.to_read - s.pos)
                    };
                    let st = st_body.clone();
                    file.read_maybe_eof(cur_offset, left, pc).then(move |chunk| {
                        let mut s = st.borrow_mut();
                        if chunk.is_empty() {
                            s.eof = true;
                        } else {
                            let pos = s.pos;
                            let space = s.buf.len() - pos;
                            let to_copy = space.min(chunk.len());
                            s.buf.as_mut_slice()[pos..pos + to_copy]
                                .copy_from_slice(&chunk.as_slice()[..to_copy]);
                            s.pos += to_copy;
                        }
                        Ok(())
                    })
                },
            )
            .then(move |()| {
                let mut s = st_done.borrow_mut();
                let pos = s.pos.min(s.to_read);
                let front = s.front;
                let mut buf = std::mem::replace(&mut s.buf, DmaBuffer::empty());
                if pos > front {
                    buf.trim(pos);
                    buf.trim_front(front);
                } else {
                    buf.trim(0);
                }
                Ok(buf)
            })
        })
    }

    /// Read from where a short read stopped, distinguishing EOF from
    /// transient errors: a zero-length success or an `EINVAL` from this
    /// realigned read means EOF (unaligned file length), anything else
    /// is a real error.
    fn read_maybe_eof(&self, pos: u64, len: usize, pc: IoPriorityClass) -> Future<DmaBuffer> {
        let align = self.disk_read_dma_alignment();
        let buf = DmaBuffer::zeroed(
            align_up(len.max(1) as u64, align) as usize,
            self.memory_dma_alignment() as usize,
        );
        self.dma_read(pos, buf, pc).then_wrapped(|res| match res {
            Ok((size, mut buf)) => {
                buf.trim(size);
                Ok(buf)
            }
            Err(e) if e.errno() == Some(libc::EINVAL) => Ok(DmaBuffer::empty()),
            Err(e) => Err(e),
        })
    }

    /// Read `len` bytes at `pos`, neither of which needs alignment. The
    /// buffer may be shorter than `len` at EOF.
    pub fn dma_read_at(&self, pos: u64, len: usize, pc: IoPriorityClass) -> Future<DmaBuffer> {
        self.dma_read_bulk(pos, len, pc).then(move |mut buf| {
            if buf.len() > len {
                buf.trim(len);
            }
            Ok(buf)
        })
    }

    /// Read exactly `len` bytes at `pos`; fails with [`Error::Eof`] if
    /// the file ends first.
    pub fn dma_read_exactly(
        &self,
        pos: u64,
        len: usize,
        pc: IoPriorityClass,
    ) -> Future<DmaBuffer> {
        self.dma_read_at(pos, len, pc).then(move |buf| {
            if buf.len() < len {
                Err(Error::Eof)
            } else {
                Ok(buf)
            }
        })
    }

    /// Make previously written data stable on storage.
    pub fn flush(&self) -> Future<()> {
        let fd = self.inner.fd;
        reactor::local().ring.borrow_mut().submit(
            OpRes::None,
            move |_| opcode::Fsync::new(types::Fd(fd)).build(),
            |ret, _| {
                check_zero(ret)?;
                metrics::IO_FSYNCS.increment();
                Ok(())
            },
        )
    }

    /// Current file size.
    pub fn size(&self) -> Future<u64> {
        let fd = self.inner.fd;
        let res = OpRes::PathStatx(CString::new("").unwrap(), new_statx_buf());
        reactor::local().ring.borrow_mut().submit(
            res,
            move |res| {
                let (path, stx) = res.path_statx();
                opcode::Statx::new(types::Fd(fd), path.as_ptr(), stx as *mut libc::statx as *mut _)
                    .flags(libc::AT_EMPTY_PATH)
                    .mask(libc::STATX_SIZE)
                    .build()
            },
            |ret, res| {
                check_zero(ret)?;
                Ok(res.into_statx().stx_size)
            },
        )
    }

    /// Truncate (or extend) the file to `length` bytes.
    ///
    /// No ring opcode for ftruncate on the supported kernel floor; issued
    /// inline.
    pub fn truncate(&self, length: u64) -> Future<()> {
        let ret = unsafe { libc::ftruncate(self.inner.fd, length as libc::off_t) };
        if ret < 0 {
            Future::err(Error::from(std::io::Error::last_os_error()))
        } else {
            Future::ready(())
        }
    }

    /// Close the file. Clones of this handle must not be used afterwards.
    pub fn close(&self) -> Future<()> {
        let fd = self.inner.fd;
        reactor::local().ring.borrow_mut().submit(
            OpRes::None,
            move |_| opcode::Close::new(types::Fd(fd)).build(),
            |ret, _| check_zero(ret),
        )
    }
}

fn new_statx_buf() -> Box<libc::statx> {
    Box::new(unsafe { std::mem::zeroed() })
}

fn to_cstring(path: &str) -> AsyncResult<CString> {
    CString::new(path).map_err(|_| Error::message("path contains an interior NUL byte"))
}

fn submit_open(path: CString, oflags: i32) -> Future<RawFd> {
    reactor::local().ring.borrow_mut().submit(
        OpRes::Path(path),
        move |res| {
            opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), res.path().as_ptr())
                .flags(oflags | libc::O_CLOEXEC)
                .mode(0o666)
                .build()
        },
        |ret, _| check_len(ret).map(|fd| fd as RawFd),
    )
}

/// Open (or create) a file for DMA access.
///
/// The file is opened with `O_DIRECT`. On filesystems that reject it
/// (tmpfs and friends) and with strict DMA disabled in the config, the
/// open falls back to buffered I/O with the same alignment discipline.
pub fn open_file_dma(path: &str, flags: OpenFlags) -> Future<File> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    let strict = reactor::local().strict_o_direct;
    let oflags = flags.bits();
    submit_open(cpath.clone(), oflags | libc::O_DIRECT).then_wrapped(move |res| match res {
        Ok(fd) => Future::ready(File::from_fd(fd)),
        Err(e) if !strict && e.errno() == Some(libc::EINVAL) => {
            submit_open(cpath, oflags).then(|fd| Ok(File::from_fd(fd)))
        }
        Err(e) => Future::err(e),
    })
}

/// Open a directory handle (for flushing after directory mutations).
pub fn open_directory(path: &str) -> Future<File> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    submit_open(cpath, libc::O_DIRECTORY | libc::O_RDONLY).then(|fd| Ok(File::from_fd(fd)))
}

/// Create a directory; fails if it already exists.
pub fn make_directory(path: &str) -> Future<()> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    reactor::local().ring.borrow_mut().submit(
        OpRes::Path(cpath),
        |res| {
            opcode::MkDirAt::new(types::Fd(libc::AT_FDCWD), res.path().as_ptr())
                .mode(0o755)
                .build()
        },
        |ret, _| check_zero(ret),
    )
}

/// Ensure a directory exists (create-if-missing).
pub fn touch_directory(path: &str) -> Future<()> {
    make_directory(path).then_wrapped(|res| match res {
        Err(e) if e.errno() == Some(libc::EEXIST) => Ok(()),
        other => other,
    })
}

fn submit_statx(path: CString, mask: u32) -> Future<Box<libc::statx>> {
    reactor::local().ring.borrow_mut().submit(
        OpRes::PathStatx(path, new_statx_buf()),
        move |res| {
            let (path, stx) = res.path_statx();
            opcode::Statx::new(
                types::Fd(libc::AT_FDCWD),
                path.as_ptr(),
                stx as *mut libc::statx as *mut _,
            )
            .mask(mask)
            .build()
        },
        |ret, res| {
            check_zero(ret)?;
            Ok(res.into_statx())
        },
    )
}

/// Size of the file at `path`.
pub fn file_size(path: &str) -> Future<u64> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    submit_statx(cpath, libc::STATX_SIZE).then(|stx| Ok(stx.stx_size))
}

/// Does anything exist at `path`?
pub fn file_exists(path: &str) -> Future<bool> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    submit_statx(cpath, libc::STATX_TYPE).then_wrapped(|res| match res {
        Ok(_) => Ok(true),
        Err(e) if e.errno() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    })
}

/// The kind of directory entry at `path`, or `None` if nothing is there.
pub fn file_type(path: &str) -> Future<Option<DirectoryEntryType>> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    submit_statx(cpath, libc::STATX_TYPE).then_wrapped(|res| match res {
        Ok(stx) => {
            let kind = match stx.stx_mode as u32 & libc::S_IFMT {
                libc::S_IFBLK => DirectoryEntryType::BlockDevice,
                libc::S_IFCHR => DirectoryEntryType::CharDevice,
                libc::S_IFDIR => DirectoryEntryType::Directory,
                libc::S_IFIFO => DirectoryEntryType::Fifo,
                libc::S_IFLNK => DirectoryEntryType::Link,
                libc::S_IFSOCK => DirectoryEntryType::Socket,
                _ => DirectoryEntryType::Regular,
            };
            Ok(Some(kind))
        }
        Err(e) if e.errno() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    })
}

/// Remove the file at `path`.
pub fn remove_file(path: &str) -> Future<()> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    reactor::local().ring.borrow_mut().submit(
        OpRes::Path(cpath),
        |res| opcode::UnlinkAt::new(types::Fd(libc::AT_FDCWD), res.path().as_ptr()).build(),
        |ret, _| check_zero(ret),
    )
}

/// Rename `old_path` to `new_path`.
pub fn rename_file(old_path: &str, new_path: &str) -> Future<()> {
    let (old_c, new_c) = match (to_cstring(old_path), to_cstring(new_path)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return Future::err(e),
    };
    reactor::local().ring.borrow_mut().submit(
        OpRes::PathPair(old_c, new_c),
        |res| {
            let (old_c, new_c) = res.path_pair();
            opcode::RenameAt::new(
                types::Fd(libc::AT_FDCWD),
                old_c.as_ptr(),
                types::Fd(libc::AT_FDCWD),
                new_c.as_ptr(),
            )
            .build()
        },
        |ret, _| check_zero(ret),
    )
}

/// Hard-link `old_path` at `new_path`.
pub fn link_file(old_path: &str, new_path: &str) -> Future<()> {
    let (old_c, new_c) = match (to_cstring(old_path), to_cstring(new_path)) {
        (Ok(a), Ok(b)) => (a, b),
        (Err(e), _) | (_, Err(e)) => return Future::err(e),
    };
    reactor::local().ring.borrow_mut().submit(
        OpRes::PathPair(old_c, new_c),
        |res| {
            let (old_c, new_c) = res.path_pair();
            opcode::LinkAt::new(
                types::Fd(libc::AT_FDCWD),
                old_c.as_ptr(),
                types::Fd(libc::AT_FDCWD),
                new_c.as_ptr(),
            )
            .build()
        },
        |ret, _| check_zero(ret),
    )
}

/// Filesystem kind hosting `path`. statfs has no ring opcode; issued
/// inline.
pub fn file_system_at(path: &str) -> Future<FsType> {
    let cpath = match to_cstring(path) {
        Ok(p) => p,
        Err(e) => return Future::err(e),
    };
    let mut buf: libc::statfs = unsafe { std::mem::zeroed() };
    let ret = unsafe { libc::statfs(cpath.as_ptr(), &mut buf) };
    if ret < 0 {
        return Future::err(Error::from(std::io::Error::last_os_error()));
    }
    let fs = match buf.f_type as i64 {
        t if t == libc::XFS_SUPER_MAGIC as i64 => FsType::Xfs,
        t if t == libc::EXT4_SUPER_MAGIC as i64 => FsType::Ext,
        t if t == libc::BTRFS_SUPER_MAGIC as i64 => FsType::Btrfs,
        t if t == libc::TMPFS_MAGIC as i64 => FsType::Tmpfs,
        _ => FsType::Other,
    };
    Future::ready(fs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_flags_combine() {
        let f = OpenFlags::RW | OpenFlags::CREATE | OpenFlags::TRUNCATE;
        assert_eq!(
            f.bits(),
            libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC
        );
    }
}
