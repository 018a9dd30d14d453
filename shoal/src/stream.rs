//! Buffered input and output streams.
//!
//! [`InputStream`] adapts a [`Source`] of byte chunks with buffer
//! stitching, exact-length reads and a consumer loop. [`OutputStream`]
//! accumulates writes into sink-allocated buffers of `buffer_size` and
//! dispatches each full buffer through the sink; how many dispatched
//! writes may be in flight is the sink's business (the file sink applies
//! write-behind, the socket sink writes through).

use std::cell::RefCell;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::dma::DmaBuffer;
use crate::future::join::when_all;
use crate::future::iterate::{StopIteration, repeat};
use crate::future::{Future, Futurize, Promise};
use crate::reactor;

/// A producer of byte chunks. An empty chunk signals end-of-stream.
pub trait Source: 'static {
    fn get(&mut self) -> Future<Bytes>;

    fn close(&mut self) -> Future<()> {
        Future::ready(())
    }
}

/// A consumer of buffers produced by an [`OutputStream`].
pub trait Sink: 'static {
    /// Allocate a buffer suited to this sink (aligned for file sinks).
    fn allocate(&mut self, size_hint: usize) -> WriteBuffer;

    /// Dispatch one buffer. The data is logically written once the
    /// future resolves; the sink may keep it in flight behind the scenes.
    fn put(&mut self, buf: WriteBuffer) -> Future<()>;

    /// Make everything dispatched so far durable/visible.
    fn flush(&mut self) -> Future<()> {
        Future::ready(())
    }

    fn close(&mut self) -> Future<()>;
}

enum WriteBufferKind {
    Plain { buf: BytesMut, capacity: usize },
    Dma { buf: DmaBuffer, len: usize },
}

/// A sink-allocated accumulation buffer. File sinks hand out aligned DMA
/// buffers (zero-filled, so an unaligned tail is already padded); socket
/// sinks hand out plain ones.
pub struct WriteBuffer {
    kind: WriteBufferKind,
}

impl WriteBuffer {
    pub fn plain(capacity: usize) -> WriteBuffer {
        WriteBuffer {
            kind: WriteBufferKind::Plain {
                buf: BytesMut::with_capacity(capacity),
                capacity,
            },
        }
    }

    pub fn dma(buf: DmaBuffer) -> WriteBuffer {
        WriteBuffer {
            kind: WriteBufferKind::Dma { buf, len: 0 },
        }
    }

    /// Append up to the remaining capacity; returns how much was taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        match &mut self.kind {
            WriteBufferKind::Plain { buf, capacity } => {
                let n = data.len().min(*capacity - buf.len());
                buf.extend_from_slice(&data[..n]);
                n
            }
            WriteBufferKind::Dma { buf, len } => {
                let n = data.len().min(buf.capacity() - *len);
                buf.as_mut_slice()[*len..*len + n].copy_from_slice(&data[..n]);
                *len += n;
                n
            }
        }
    }

    pub fn len(&self) -> usize {
        match &self.kind {
            WriteBufferKind::Plain { buf, .. } => buf.len(),
            WriteBufferKind::Dma { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        match &self.kind {
            WriteBufferKind::Plain { capacity, .. } => *capacity,
            WriteBufferKind::Dma { buf, .. } => buf.capacity(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.len() == self.capacity()
    }

    /// The accumulated bytes, for plain sinks.
    pub fn take_plain(self) -> Bytes {
        match self.kind {
            WriteBufferKind::Plain { buf, .. } => buf.freeze(),
            WriteBufferKind::Dma { mut buf, len } => {
                buf.trim(len);
                Bytes::copy_from_slice(buf.as_slice())
            }
        }
    }

    /// The DMA buffer and logical length, for file sinks.
    pub fn take_dma(self) -> (DmaBuffer, usize) {
        match self.kind {
            WriteBufferKind::Dma { buf, len } => (buf, len),
            WriteBufferKind::Plain { .. } => {
                unreachable!("plain buffer handed to a dma sink")
            }
        }
    }
}

struct InputInner<S: Source> {
    source: S,
    buf: Bytes,
    eof: bool,
}

/// Buffered reader over a [`Source`].
pub struct InputStream<S: Source> {
    inner: Rc<RefCell<InputInner<S>>>,
}

impl<S: Source> Clone for InputStream<S> {
    fn clone(&self) -> Self {
        InputStream {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Source> InputStream<S> {
    pub fn new(source: S) -> InputStream<S> {
        InputStream {
            inner: Rc::new(RefCell::new(InputInner {
                source,
                buf: Bytes::new(),
                eof: false,
            })),
        }
    }

    /// The next chunk: buffered leftovers first, then whatever the
    /// source produces. Empty means end-of-stream.
    pub fn read(&self) -> Future<Bytes> {
        let mut st = self.inner.borrow_mut();
        if !st.buf.is_empty() {
            let b = std::mem::take(&mut st.buf);
            return Future::ready(b);
        }
        if st.eof {
            return Future::ready(Bytes::new());
        }
        let fut = st.source.get();
        drop(st);
        let inner = self.inner.clone();
        fut.then(move |data| {
            if data.is_empty() {
                inner.borrow_mut().eof = true;
            }
            Ok(data)
        })
    }

    /// Push bytes back to be returned by the next `read`.
    pub fn unread(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        let mut st = self.inner.borrow_mut();
        if st.buf.is_empty() {
            st.buf = data;
        } else {
            let mut joined = BytesMut::with_capacity(data.len() + st.buf.len());
            joined.extend_from_slice(&data);
            joined.extend_from_slice(&st.buf);
            st.buf = joined.freeze();
        }
    }

    /// Read exactly `n` bytes; a shorter buffer means the stream ended
    /// first.
    pub fn read_exactly(&self, n: usize) -> Future<Bytes> {
        let acc = Rc::new(RefCell::new(BytesMut::with_capacity(n)));
        let this = self.clone();
        let acc_loop = acc.clone();
        repeat(move || {
            if acc_loop.borrow().len() >= n {
                return Future::ready(StopIteration::Yes);
            }
            let acc = acc_loop.clone();
            let this2 = this.clone();
            this.read().then(move |chunk| {
                if chunk.is_empty() {
                    return Ok(StopIteration::Yes);
                }
                let mut a = acc.borrow_mut();
                let need = n - a.len();
                if chunk.len() > need {
                    a.extend_from_slice(&chunk[..need]);
                    this2.unread(chunk.slice(need..));
                } else {
                    a.extend_from_slice(&chunk);
                }
                Ok(if a.len() >= n {
                    StopIteration::Yes
                } else {
                    StopIteration::No
                })
            })
        })
        .then(move |()| Ok(acc.borrow_mut().split().freeze()))
    }

    /// Pull buffers through `consumer` until it returns `None` or the
    /// stream ends. A returned `Some(rem)` is prepended to the next read.
    pub fn consume<C, R>(&self, consumer: C) -> Future<()>
    where
        C: FnMut(Bytes) -> R + 'static,
        R: Futurize<Output = Option<Bytes>>,
    {
        let consumer = Rc::new(RefCell::new(consumer));
        let this = self.clone();
        repeat(move || {
            let consumer = consumer.clone();
            let this2 = this.clone();
            this.read().then(move |data| {
                let at_end = data.is_empty();
                let fut = (&mut *consumer.borrow_mut())(data).futurize();
                fut.then(move |rem| match rem {
                    None => Ok(StopIteration::Yes),
                    Some(rem) => {
                        this2.unread(rem);
                        Ok(if at_end {
                            StopIteration::Yes
                        } else {
                            StopIteration::No
                        })
                    }
                })
            })
        })
    }

    /// Close the source, draining any reads it still has in flight.
    pub fn close(&self) -> Future<()> {
        self.inner.borrow_mut().source.close()
    }
}

struct OutputInner<K: Sink> {
    sink: K,
    buf: Option<WriteBuffer>,
    buffer_size: usize,
    batch_flushes: bool,
}

/// Buffered writer over a [`Sink`].
pub struct OutputStream<K: Sink> {
    inner: Rc<RefCell<OutputInner<K>>>,
}

impl<K: Sink> Clone for OutputStream<K> {
    fn clone(&self) -> Self {
        OutputStream {
            inner: self.inner.clone(),
        }
    }
}

impl<K: Sink> OutputStream<K> {
    pub fn new(sink: K, buffer_size: usize) -> OutputStream<K> {
        OutputStream {
            inner: Rc::new(RefCell::new(OutputInner {
                sink,
                buf: None,
                buffer_size,
                batch_flushes: false,
            })),
        }
    }

    /// Defer explicit flushes to the reactor's batch-flush poller so
    /// flushes issued within one loop iteration coalesce.
    pub fn set_batch_flushes(&self, enable: bool) {
        self.inner.borrow_mut().batch_flushes = enable;
    }

    /// Append `data`, dispatching every buffer that fills.
    pub fn write(&self, data: &[u8]) -> Future<()> {
        let mut puts: Vec<Future<()>> = Vec::new();
        {
            let mut st = self.inner.borrow_mut();
            let mut data = data;
            while !data.is_empty() {
                if st.buf.is_none() {
                    let size = st.buffer_size;
                    st.buf = Some(st.sink.allocate(size));
                }
                let n = st.buf.as_mut().unwrap().push(data);
                data = &data[n..];
                if st.buf.as_ref().unwrap().is_full() {
                    let full = st.buf.take().unwrap();
                    puts.push(st.sink.put(full));
                }
            }
        }
        match puts.len() {
            0 => Future::ready(()),
            1 => puts.pop().unwrap(),
            _ => when_all(puts).then(|results| {
                for r in results {
                    r?;
                }
                Ok(())
            }),
        }
    }

    fn do_flush(&self) -> Future<()> {
        let mut st = self.inner.borrow_mut();
        let tail = st.buf.take().filter(|b| !b.is_empty());
        match tail {
            Some(tail) => {
                let put = st.sink.put(tail);
                drop(st);
                let inner = self.inner.clone();
                put.then(move |()| inner.borrow_mut().sink.flush())
            }
            None => st.sink.flush(),
        }
    }

    /// Dispatch the partial tail buffer and flush the sink.
    pub fn flush(&self) -> Future<()> {
        if !self.inner.borrow().batch_flushes {
            return self.do_flush();
        }
        let mut p = Promise::new();
        let fut = p.get_future();
        let this = self.clone();
        reactor::local().add_batch_flush(move || this.do_flush().forward_to(p));
        fut
    }

    /// Flush, then close the sink.
    pub fn close(&self) -> Future<()> {
        let this = self.clone();
        self.do_flush()
            .then(move |()| this.inner.borrow_mut().sink.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::reactor::task_queue::pump;
    use std::cell::Cell;
    use std::collections::VecDeque;

    struct ListSource {
        chunks: VecDeque<Bytes>,
    }

    impl ListSource {
        fn new(chunks: &[&[u8]]) -> ListSource {
            ListSource {
                chunks: chunks.iter().map(|c| Bytes::copy_from_slice(c)).collect(),
            }
        }
    }

    impl Source for ListSource {
        fn get(&mut self) -> Future<Bytes> {
            Future::ready(self.chunks.pop_front().unwrap_or_default())
        }
    }

    #[derive(Clone)]
    struct VecSink {
        data: Rc<RefCell<Vec<u8>>>,
        puts: Rc<Cell<usize>>,
        flushes: Rc<Cell<usize>>,
        closed: Rc<Cell<bool>>,
    }

    impl VecSink {
        fn new() -> VecSink {
            VecSink {
                data: Rc::new(RefCell::new(Vec::new())),
                puts: Rc::new(Cell::new(0)),
                flushes: Rc::new(Cell::new(0)),
                closed: Rc::new(Cell::new(false)),
            }
        }
    }

    impl Sink for VecSink {
        fn allocate(&mut self, size_hint: usize) -> WriteBuffer {
            WriteBuffer::plain(size_hint)
        }

        fn put(&mut self, buf: WriteBuffer) -> Future<()> {
            self.puts.set(self.puts.get() + 1);
            self.data.borrow_mut().extend_from_slice(&buf.take_plain());
            Future::ready(())
        }

        fn flush(&mut self) -> Future<()> {
            self.flushes.set(self.flushes.get() + 1);
            Future::ready(())
        }

        fn close(&mut self) -> Future<()> {
            self.closed.set(true);
            Future::ready(())
        }
    }

    #[test]
    fn read_stitches_chunks() {
        let r = pump::run_until(|| {
            let s = InputStream::new(ListSource::new(&[b"hel", b"lo"]));
            let s2 = s.clone();
            s.read().then(move |a| {
                assert_eq!(&a[..], b"hel");
                s2.read().then(|b| {
                    assert_eq!(&b[..], b"lo");
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
    }

    #[test]
    fn read_exactly_spans_chunks_and_unreads() {
        let r = pump::run_until(|| {
            let s = InputStream::new(ListSource::new(&[b"ab", b"cdef", b"gh"]));
            let s2 = s.clone();
            s.read_exactly(5).then(move |buf| {
                assert_eq!(&buf[..], b"abcde");
                s2.read_exactly(3).then(|buf| {
                    assert_eq!(&buf[..], b"fgh");
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
    }

    #[test]
    fn read_exactly_short_at_eof() {
        let r = pump::run_until(|| {
            let s = InputStream::new(ListSource::new(&[b"xy"]));
            s.read_exactly(5)
        });
        assert_eq!(&r.unwrap()[..], b"xy");
    }

    #[test]
    fn consume_stops_on_none() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s2 = seen.clone();
        let r = pump::run_until(move || {
            let s = InputStream::new(ListSource::new(&[b"one", b"two", b"three"]));
            let seen = s2.clone();
            s.consume(move |buf: Bytes| {
                seen.borrow_mut().push(buf.to_vec());
                // Stop after the second buffer.
                if seen.borrow().len() == 2 {
                    Ok(None)
                } else {
                    Ok(Some(Bytes::new()))
                }
            })
        });
        assert!(r.is_ok());
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    fn consume_remainder_prepends_to_next_read() {
        let r = pump::run_until(|| {
            let s = InputStream::new(ListSource::new(&[b"header|payload"]));
            let s2 = s.clone();
            s.consume(move |buf: Bytes| {
                // Consume up to '|', hand the rest back, and stop on the
                // next round by observing the prepended remainder.
                if let Some(idx) = buf.iter().position(|&b| b == b'|') {
                    Ok(Some(buf.slice(idx + 1..)))
                } else {
                    assert_eq!(&buf[..], b"payload");
                    Ok(None)
                }
            })
            .then(move |()| s2.read())
        });
        // The consumer swallowed everything.
        assert!(r.unwrap().is_empty());
    }

    #[test]
    fn consume_sees_eof_as_empty_buffer() {
        let got_empty = Rc::new(Cell::new(false));
        let g = got_empty.clone();
        let r = pump::run_until(move || {
            let s = InputStream::new(ListSource::new(&[b"x"]));
            let g = g.clone();
            s.consume(move |buf: Bytes| {
                if buf.is_empty() {
                    g.set(true);
                }
                Ok(Some(Bytes::new()))
            })
        });
        assert!(r.is_ok());
        assert!(got_empty.get());
    }

    #[test]
    fn write_buffers_until_full() {
        pump::drain(|| {
            let sink = VecSink::new();
            let puts = sink.puts.clone();
            let data = sink.data.clone();
            let os = OutputStream::new(sink, 4);
            os.write(b"ab").ignore();
            assert_eq!(puts.get(), 0, "partial buffer dispatched early");
            os.write(b"cdef").ignore();
            assert_eq!(puts.get(), 1);
            assert_eq!(&*data.borrow(), b"abcd");
        });
    }

    #[test]
    fn flush_dispatches_tail_and_flushes_sink() {
        let r = pump::run_until(|| {
            let sink = VecSink::new();
            let data = sink.data.clone();
            let flushes = sink.flushes.clone();
            let os = OutputStream::new(sink, 64);
            os.write(b"tail").then(move |()| {
                os.flush().then(move |()| {
                    assert_eq!(&*data.borrow(), b"tail");
                    assert_eq!(flushes.get(), 1);
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
    }

    #[test]
    fn close_flushes_then_closes() {
        let r = pump::run_until(|| {
            let sink = VecSink::new();
            let data = sink.data.clone();
            let closed = sink.closed.clone();
            let os = OutputStream::new(sink, 64);
            os.write(b"bye").then(move |()| {
                os.close().then(move |()| {
                    assert_eq!(&*data.borrow(), b"bye");
                    assert!(closed.get());
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
    }

    #[test]
    fn large_write_spans_buffers() {
        let r = pump::run_until(|| {
            let sink = VecSink::new();
            let data = sink.data.clone();
            let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
            let expect = payload.clone();
            let os = OutputStream::new(sink, 128);
            os.write(&payload).then(move |()| {
                os.close().then(move |()| {
                    assert_eq!(*data.borrow(), expect);
                    Ok(())
                })
            })
        });
        assert!(r.is_ok());
    }

    struct FailSink;
    impl Sink for FailSink {
        fn allocate(&mut self, size_hint: usize) -> WriteBuffer {
            WriteBuffer::plain(size_hint)
        }
        fn put(&mut self, _buf: WriteBuffer) -> Future<()> {
            Future::err(Error::message("disk on fire"))
        }
        fn close(&mut self) -> Future<()> {
            Future::ready(())
        }
    }

    #[test]
    fn put_failure_propagates_through_write() {
        let r = pump::run_until(|| {
            let os = OutputStream::new(FailSink, 2);
            os.write(b"abcd")
        });
        assert!(r.is_err());
    }
}
