//! File-backed streams.
//!
//! The input side keeps a FIFO of speculative reads: whenever a read
//! completes, the source tops the queue back up to the configured
//! read-ahead depth, so a sequential consumer rarely waits on the disk.
//! The output side implements write-behind: up to `write_behind` buffer
//! writes run in the background, their outcomes merged into one
//! accumulator future; after the first failure further writes
//! short-circuit and propagate it. An unaligned tail is written from its
//! zero-padded aligned buffer and the file truncated back to the logical
//! length.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use bytes::Bytes;

use crate::dma::{DmaBuffer, align_down, align_up};
use crate::file::File;
use crate::future::join::join;
use crate::future::{Future, Promise};
use crate::io_queue::{IoPriorityClass, default_priority_class};
use crate::semaphore::Semaphore;
use crate::stream::{InputStream, OutputStream, Sink, Source, WriteBuffer};

#[derive(Clone, Copy)]
pub struct FileInputStreamOptions {
    /// Bytes per read-ahead buffer.
    pub buffer_size: usize,
    /// Reads to keep in flight beyond the one being consumed.
    pub read_ahead: usize,
    pub io_priority: IoPriorityClass,
}

impl Default for FileInputStreamOptions {
    fn default() -> Self {
        FileInputStreamOptions {
            buffer_size: 8192,
            read_ahead: 1,
            io_priority: default_priority_class(),
        }
    }
}

#[derive(Clone, Copy)]
pub struct FileOutputStreamOptions {
    /// Bytes accumulated before a write is dispatched.
    pub buffer_size: usize,
    /// Buffer writes allowed in flight at once.
    pub write_behind: usize,
    pub io_priority: IoPriorityClass,
}

impl Default for FileOutputStreamOptions {
    fn default() -> Self {
        FileOutputStreamOptions {
            buffer_size: 8192,
            write_behind: 1,
            io_priority: default_priority_class(),
        }
    }
}

// ── Input side ──────────────────────────────────────────────────────

struct FileSourceState {
    file: File,
    opts: FileInputStreamOptions,
    pos: u64,
    remain: u64,
    read_buffers: VecDeque<Future<Bytes>>,
    reads_in_progress: usize,
    closing: bool,
    drained: Option<Promise<()>>,
}

/// Read-ahead source over a file region.
pub struct FileSource {
    state: Rc<RefCell<FileSourceState>>,
}

impl FileSource {
    fn new(file: File, offset: u64, len: u64, opts: FileInputStreamOptions) -> FileSource {
        // Prevent wraparound at the end of the offset space.
        let remain = len.min(u64::MAX - offset);
        FileSource {
            state: Rc::new(RefCell::new(FileSourceState {
                file,
                opts,
                pos: offset,
                remain,
                read_buffers: VecDeque::new(),
                reads_in_progress: 0,
                closing: false,
                drained: None,
            })),
        }
    }
}

fn issue_read_aheads(state: &Rc<RefCell<FileSourceState>>, min_ra: usize) {
    loop {
        // Decide the next action under the borrow, then act after it.
        enum Next {
            Done,
            PushEmpty,
            Read {
                fut: Future<DmaBuffer>,
                start: u64,
                pos: u64,
                remain: u64,
            },
        }
        let next = {
            let mut st = state.borrow_mut();
            if st.closing {
                Next::Done
            } else {
                let ra = min_ra.max(st.opts.read_ahead);
                if st.read_buffers.len() >= ra {
                    Next::Done
                } else if st.remain == 0 {
                    if st.read_buffers.len() >= min_ra {
                        Next::Done
                    } else {
                        Next::PushEmpty
                    }
                } else {
                    st.reads_in_progress += 1;
                    let align = st.file.disk_read_dma_alignment();
                    let start = align_down(st.pos, align);
                    let end = align_up(
                        (start + st.opts.buffer_size as u64).min(st.pos + st.remain),
                        align,
                    );
                    let pos = st.pos;
                    let remain = st.remain;
                    let fut =
                        st.file
                            .dma_read_bulk(start, (end - start) as usize, st.opts.io_priority);
                    let old_pos = st.pos;
                    st.pos = end;
                    st.remain = st.pos.max(old_pos + remain) - st.pos;
                    Next::Read {
                        fut,
                        start,
                        pos,
                        remain,
                    }
                }
            }
        };

        match next {
            Next::Done => return,
            Next::PushEmpty => {
                state
                    .borrow_mut()
                    .read_buffers
                    .push_back(Future::ready(Bytes::new()));
            }
            Next::Read {
                fut,
                start,
                pos,
                remain,
            } => {
                let st2 = state.clone();
                let wrapped = fut.then_wrapped(move |ret| {
                    issue_read_aheads(&st2, 0);
                    {
                        let mut st = st2.borrow_mut();
                        st.reads_in_progress -= 1;
                        if st.closing
                            && st.reads_in_progress == 0
                            && let Some(p) = st.drained.take()
                        {
                            p.set_value(());
                        }
                    }
                    let mut buf = ret?;
                    // First or last buffer of an unaligned window needs
                    // trimming; aligned interior buffers pass through.
                    if !(pos == start && start + buf.len() as u64 <= pos + remain) {
                        let real_end = start + buf.len() as u64;
                        if real_end <= pos {
                            return Ok(Bytes::new());
                        }
                        if real_end > pos + remain {
                            buf.trim((pos + remain - start) as usize);
                        }
                        if start < pos {
                            buf.trim_front((pos - start) as usize);
                        }
                    }
                    Ok(Bytes::from_owner(buf))
                });
                state.borrow_mut().read_buffers.push_back(wrapped);
            }
        }
    }
}

impl Source for FileSource {
    fn get(&mut self) -> Future<Bytes> {
        if self.state.borrow().read_buffers.is_empty() {
            issue_read_aheads(&self.state, 1);
        }
        self.state
            .borrow_mut()
            .read_buffers
            .pop_front()
            // Only reachable after close(): the stream is over.
            .unwrap_or_else(|| Future::ready(Bytes::new()))
    }

    fn close(&mut self) -> Future<()> {
        let fut = {
            let mut st = self.state.borrow_mut();
            st.closing = true;
            let mut p = Promise::new();
            let fut = p.get_future();
            if st.reads_in_progress == 0 {
                p.set_value(());
            } else {
                st.drained = Some(p);
            }
            fut
        };
        let state = self.state.clone();
        fut.then(move |()| {
            for f in state.borrow_mut().read_buffers.drain(..) {
                f.ignore();
            }
            Ok(())
        })
    }
}

/// A buffered input stream over `file`, from byte `offset`, at most
/// `len` bytes.
pub fn make_file_input_stream_bounded(
    file: File,
    offset: u64,
    len: u64,
    opts: FileInputStreamOptions,
) -> InputStream<FileSource> {
    InputStream::new(FileSource::new(file, offset, len, opts))
}

/// A buffered input stream over the whole of `file`.
pub fn make_file_input_stream(
    file: File,
    opts: FileInputStreamOptions,
) -> InputStream<FileSource> {
    make_file_input_stream_bounded(file, 0, u64::MAX, opts)
}

// ── Output side ─────────────────────────────────────────────────────

struct FileSinkState {
    file: File,
    opts: FileOutputStreamOptions,
    pos: u64,
    write_behind_sem: Semaphore,
    background_writes_done: Option<Future<()>>,
    failed: bool,
}

/// Write-behind sink over a file.
pub struct FileSink {
    state: Rc<RefCell<FileSinkState>>,
}

impl FileSink {
    fn new(file: File, opts: FileOutputStreamOptions) -> FileSink {
        FileSink {
            state: Rc::new(RefCell::new(FileSinkState {
                file,
                opts,
                pos: 0,
                write_behind_sem: Semaphore::new(opts.write_behind.max(1)),
                background_writes_done: Some(Future::ready(())),
                failed: false,
            })),
        }
    }
}

/// Write one buffer at `pos`. An unaligned tail is written at its padded
/// aligned length (the buffer is zero-filled past the logical end) and
/// the file truncated back afterwards.
fn do_put(state: &Rc<RefCell<FileSinkState>>, pos: u64, buf: WriteBuffer) -> Future<()> {
    let (mut dma, len) = buf.take_dma();
    let (file, pc, align) = {
        let st = state.borrow();
        (
            st.file.clone(),
            st.opts.io_priority,
            st.file.disk_write_dma_alignment(),
        )
    };
    assert_eq!(pos & (align - 1), 0, "unaligned put after a tail write");
    let write_len = align_up(len as u64, align) as usize;
    let needs_truncate = write_len != len;
    dma.trim(write_len);
    let state = state.clone();
    file.dma_write(pos, dma, pc).then(move |(_written, _buf)| {
        if needs_truncate {
            let logical = state.borrow().pos;
            state.borrow().file.truncate(logical)
        } else {
            Future::ready(())
        }
    })
}

/// Resolve once every background write has finished, restoring the sink
/// to a pristine state (flush and close may both run).
fn wait_for_writes(state: &Rc<RefCell<FileSinkState>>) -> Future<()> {
    let (sem, depth) = {
        let st = state.borrow();
        (st.write_behind_sem.clone(), st.opts.write_behind.max(1))
    };
    let state = state.clone();
    sem.wait_units(depth).then(move |()| {
        let bg = state.borrow_mut().background_writes_done.take().unwrap();
        let state2 = state.clone();
        bg.then_wrapped(move |res| {
            let st = state2.borrow_mut();
            st.write_behind_sem.signal_units(depth);
            drop(st);
            state2.borrow_mut().background_writes_done = Some(Future::ready(()));
            Future::from_result(res)
        })
    })
}

impl Sink for FileSink {
    fn allocate(&mut self, size_hint: usize) -> WriteBuffer {
        let st = self.state.borrow();
        let align = st.file.disk_write_dma_alignment();
        let size = align_up(size_hint as u64, align) as usize;
        WriteBuffer::dma(DmaBuffer::zeroed(
            size,
            st.file.memory_dma_alignment() as usize,
        ))
    }

    fn put(&mut self, buf: WriteBuffer) -> Future<()> {
        let state = self.state.clone();
        let (pos, sem) = {
            let mut st = state.borrow_mut();
            let pos = st.pos;
            st.pos += buf.len() as u64;
            (pos, st.write_behind_sem.clone())
        };
        sem.wait().then(move |()| {
            if state.borrow().failed {
                // Don't issue more writes; hand back the merged failure.
                state.borrow().write_behind_sem.signal();
                let bg = state.borrow_mut().background_writes_done.take().unwrap();
                state.borrow_mut().background_writes_done = Some(Future::ready(()));
                return bg;
            }
            let sem = state.borrow().write_behind_sem.clone();
            let this_write = do_put(&state, pos, buf).finally(move || {
                sem.signal();
                Ok(())
            });
            let prev = state.borrow_mut().background_writes_done.take().unwrap();
            let state2 = state.clone();
            let merged = join(prev, this_write).then(move |(first, second)| {
                // Merge the two outcomes, preferring the earlier error.
                match (first, second) {
                    (Err(e), _) => Err(e),
                    (Ok(()), Err(e)) => {
                        state2.borrow_mut().failed = true;
                        Err(e)
                    }
                    (Ok(()), Ok(())) => Ok(()),
                }
            });
            state.borrow_mut().background_writes_done = Some(merged);
            Future::ready(())
        })
    }

    fn flush(&mut self) -> Future<()> {
        let state = self.state.clone();
        wait_for_writes(&self.state).then(move |()| state.borrow().file.flush())
    }

    fn close(&mut self) -> Future<()> {
        let state = self.state.clone();
        wait_for_writes(&self.state).then(move |()| state.borrow().file.close())
    }
}

/// A buffered, write-behind output stream over `file`.
pub fn make_file_output_stream(
    file: File,
    opts: FileOutputStreamOptions,
) -> OutputStream<FileSink> {
    let buffer_size = opts.buffer_size;
    OutputStream::new(FileSink::new(file, opts), buffer_size)
}
