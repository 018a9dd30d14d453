//! Socket API.
//!
//! Listening, accepting, connecting and the stream adapters over a
//! connected socket, all driven through the reactor's ring. Socket setup
//! (socket/bind/listen/setsockopt) is plain syscalls; data and accept
//! paths are asynchronous. There is no cancellation of individual
//! operations — instead `abort_accept` / `abort_reader` / `abort_writer`
//! deliver a caller-supplied error to whatever is pending.

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;

use bytes::Bytes;
use io_uring::{opcode, types};

use crate::error::Error;
use crate::future::Future;
use crate::reactor;
use crate::reactor::uring::{MsgBuf, OpRes, SockaddrBuf, check_len, check_zero};
use crate::stream::{InputStream, OutputStream, Sink, Source, WriteBuffer};

const RECV_BUFFER_SIZE: usize = 16384;
const SEND_BUFFER_SIZE: usize = 8192;
const UDP_BUFFER_SIZE: usize = 65536;

/// Convert a libc sockaddr_storage to a std SocketAddr.
fn sockaddr_to_socket_addr(addr: &libc::sockaddr_storage, len: u32) -> Option<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    match addr.ss_family as libc::c_int {
        libc::AF_INET if len >= std::mem::size_of::<libc::sockaddr_in>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            let port = u16::from_be(sa.sin_port);
            Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 if len >= std::mem::size_of::<libc::sockaddr_in6>() as u32 => {
            let sa = unsafe { &*(addr as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            let port = u16::from_be(sa.sin6_port);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Write a SocketAddr into a sockaddr_storage, return the address length.
fn socket_addr_to_sockaddr(addr: SocketAddr, storage: &mut libc::sockaddr_storage) -> u32 {
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

fn last_os_error() -> Error {
    Error::from(io::Error::last_os_error())
}

fn new_socket(addr: SocketAddr, ty: libc::c_int) -> Result<RawFd, Error> {
    let domain = if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    };
    let fd = unsafe { libc::socket(domain, ty | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(last_os_error());
    }
    Ok(fd)
}

/// Options for [`listen`].
#[derive(Clone, Copy)]
pub struct ListenOptions {
    pub reuse_address: bool,
    pub backlog: i32,
}

impl Default for ListenOptions {
    fn default() -> Self {
        ListenOptions {
            reuse_address: true,
            backlog: 1024,
        }
    }
}

struct ListenerState {
    fd: RawFd,
    accept_key: Cell<Option<u64>>,
    aborted: Cell<bool>,
}

impl Drop for ListenerState {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A listening socket producing connections through [`accept`]
/// (`ServerSocket::accept`).
#[derive(Clone)]
pub struct ServerSocket {
    state: Rc<ListenerState>,
}

/// Bind and listen on `addr`.
pub fn listen(addr: SocketAddr, opts: ListenOptions) -> Result<ServerSocket, Error> {
    let fd = new_socket(addr, libc::SOCK_STREAM)?;

    if opts.reuse_address {
        let optval: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }
    }

    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret =
        unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    let ret = unsafe { libc::listen(fd, opts.backlog) };
    if ret < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }

    Ok(ServerSocket {
        state: Rc::new(ListenerState {
            fd,
            accept_key: Cell::new(None),
            aborted: Cell::new(false),
        }),
    })
}

impl ServerSocket {
    /// Accept the next connection.
    pub fn accept(&self) -> Future<(ConnectedSocket, SocketAddr)> {
        if self.state.aborted.get() {
            return Future::err(Error::Aborted);
        }
        let fd = self.state.fd;
        let state_done = self.state.clone();

        let (key, fut) = reactor::local().ring.borrow_mut().submit_keyed(
            OpRes::Sockaddr(SockaddrBuf::new()),
            move |res| {
                let sa = res.sockaddr();
                opcode::Accept::new(
                    types::Fd(fd),
                    &mut sa.storage as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                    &mut sa.len,
                )
                .flags(libc::SOCK_CLOEXEC)
                .build()
            },
            move |ret, res| {
                state_done.accept_key.set(None);
                if ret == -libc::ECANCELED || state_done.aborted.get() {
                    return Err(Error::Aborted);
                }
                let conn_fd = check_len(ret)? as RawFd;
                let sa = res.into_sockaddr();
                let peer = sockaddr_to_socket_addr(&sa.storage, sa.len)
                    .ok_or_else(|| Error::message("unparseable peer address"))?;
                Ok((ConnectedSocket::from_fd(conn_fd), peer))
            },
        );
        self.state.accept_key.set(Some(key));
        fut
    }

    /// The address the listener is bound to (resolves port 0 binds).
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.state.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        sockaddr_to_socket_addr(&storage, len)
            .ok_or_else(|| Error::message("unparseable local address"))
    }

    /// Fail the pending (and any future) accept with
    /// [`Error::Aborted`].
    pub fn abort_accept(&self) {
        self.state.aborted.set(true);
        if let Some(key) = self.state.accept_key.take() {
            reactor::local().ring.borrow_mut().cancel(key);
        }
    }
}

struct SocketState {
    fd: RawFd,
    recv_key: Cell<Option<u64>>,
    abort_read: RefCell<Option<Error>>,
    abort_write: RefCell<Option<Error>>,
}

impl Drop for SocketState {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A connected TCP socket. Data moves through the [`input`]
/// (`ConnectedSocket::input`) and [`output`](`ConnectedSocket::output`)
/// streams.
#[derive(Clone)]
pub struct ConnectedSocket {
    state: Rc<SocketState>,
}

impl ConnectedSocket {
    fn from_fd(fd: RawFd) -> ConnectedSocket {
        ConnectedSocket {
            state: Rc::new(SocketState {
                fd,
                recv_key: Cell::new(None),
                abort_read: RefCell::new(None),
                abort_write: RefCell::new(None),
            }),
        }
    }

    /// Buffered reader over this socket.
    pub fn input(&self) -> InputStream<SocketSource> {
        InputStream::new(SocketSource {
            state: self.state.clone(),
        })
    }

    /// Buffered writer over this socket.
    pub fn output(&self) -> OutputStream<SocketSink> {
        OutputStream::new(
            SocketSink {
                state: self.state.clone(),
            },
            SEND_BUFFER_SIZE,
        )
    }

    /// Enable or disable Nagle's algorithm.
    pub fn set_nodelay(&self, enable: bool) -> Result<(), Error> {
        let optval: libc::c_int = enable as libc::c_int;
        let ret = unsafe {
            libc::setsockopt(
                self.state.fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &optval as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if ret < 0 { Err(last_os_error()) } else { Ok(()) }
    }

    /// Shut down the read half.
    pub fn shutdown_input(&self) {
        unsafe {
            libc::shutdown(self.state.fd, libc::SHUT_RD);
        }
    }

    /// Shut down the write half.
    pub fn shutdown_output(&self) {
        unsafe {
            libc::shutdown(self.state.fd, libc::SHUT_WR);
        }
    }

    /// Fail the pending and all future reads with `err`.
    pub fn abort_reader(&self, err: Error) {
        *self.state.abort_read.borrow_mut() = Some(err);
        if let Some(key) = self.state.recv_key.take() {
            reactor::local().ring.borrow_mut().cancel(key);
        }
    }

    /// Fail all future writes with `err`.
    pub fn abort_writer(&self, err: Error) {
        *self.state.abort_write.borrow_mut() = Some(err);
    }
}

/// Open a connection to `addr`.
pub fn connect(addr: SocketAddr) -> Future<ConnectedSocket> {
    let fd = match new_socket(addr, libc::SOCK_STREAM) {
        Ok(fd) => fd,
        Err(e) => return Future::err(e),
    };
    let mut sa = SockaddrBuf::new();
    sa.len = socket_addr_to_sockaddr(addr, &mut sa.storage);

    reactor::local().ring.borrow_mut().submit(
        OpRes::Sockaddr(sa),
        move |res| {
            let sa = res.sockaddr();
            opcode::Connect::new(
                types::Fd(fd),
                &sa.storage as *const libc::sockaddr_storage as *const libc::sockaddr,
                sa.len,
            )
            .build()
        },
        move |ret, _| {
            if ret < 0 {
                unsafe { libc::close(fd) };
                return Err(Error::from_errno(-ret));
            }
            Ok(ConnectedSocket::from_fd(fd))
        },
    )
}

/// Source half of a connected socket.
pub struct SocketSource {
    state: Rc<SocketState>,
}

impl Source for SocketSource {
    fn get(&mut self) -> Future<Bytes> {
        if let Some(err) = self.state.abort_read.borrow().clone() {
            return Future::err(err);
        }
        let fd = self.state.fd;
        let state = self.state.clone();
        let (key, fut) = reactor::local().ring.borrow_mut().submit_keyed(
            OpRes::Bytes(vec![0u8; RECV_BUFFER_SIZE]),
            move |res| {
                let buf = res.bytes();
                opcode::Recv::new(types::Fd(fd), buf.as_mut_ptr(), buf.len() as u32).build()
            },
            move |ret, res| {
                state.recv_key.set(None);
                if ret == -libc::ECANCELED
                    && let Some(err) = state.abort_read.borrow_mut().take()
                {
                    return Err(err);
                }
                let n = check_len(ret)?;
                if n == 0 {
                    return Ok(Bytes::new());
                }
                let mut buf = res.into_bytes();
                buf.truncate(n);
                Ok(Bytes::from(buf))
            },
        );
        self.state.recv_key.set(Some(key));
        fut
    }
}

/// Sink half of a connected socket. Writes through; `close` shuts down
/// the write side after the last byte.
pub struct SocketSink {
    state: Rc<SocketState>,
}

impl SocketSink {
    /// Send all of `data`, resubmitting on partial sends.
    fn send_all(state: Rc<SocketState>, data: Bytes) -> Future<()> {
        if data.is_empty() {
            return Future::ready(());
        }
        if let Some(err) = state.abort_write.borrow().clone() {
            return Future::err(err);
        }
        let fd = state.fd;
        let len = data.len();
        reactor::local()
            .ring
            .borrow_mut()
            .submit(
                OpRes::Shared(data),
                move |res| {
                    let b = res.shared();
                    opcode::Send::new(types::Fd(fd), b.as_ptr(), b.len() as u32)
                        .flags(libc::MSG_NOSIGNAL)
                        .build()
                },
                move |ret, res| {
                    let n = check_len(ret)?;
                    let data = match res {
                        OpRes::Shared(b) => b,
                        _ => unreachable!(),
                    };
                    Ok((n, data))
                },
            )
            .then(move |(n, data)| {
                if n >= len {
                    Future::ready(())
                } else {
                    SocketSink::send_all(state, data.slice(n..))
                }
            })
    }
}

impl Sink for SocketSink {
    fn allocate(&mut self, size_hint: usize) -> WriteBuffer {
        WriteBuffer::plain(size_hint)
    }

    fn put(&mut self, buf: WriteBuffer) -> Future<()> {
        SocketSink::send_all(self.state.clone(), buf.take_plain())
    }

    fn close(&mut self) -> Future<()> {
        unsafe {
            libc::shutdown(self.state.fd, libc::SHUT_WR);
        }
        Future::ready(())
    }
}

struct UdpState {
    fd: RawFd,
}

impl Drop for UdpState {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// A bound UDP socket with datagram send/receive.
#[derive(Clone)]
pub struct UdpChannel {
    state: Rc<UdpState>,
}

/// Bind a UDP socket on `addr`.
pub fn make_udp_channel(addr: SocketAddr) -> Result<UdpChannel, Error> {
    let fd = new_socket(addr, libc::SOCK_DGRAM)?;
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let addr_len = socket_addr_to_sockaddr(addr, &mut storage);
    let ret =
        unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, addr_len) };
    if ret < 0 {
        let err = last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(UdpChannel {
        state: Rc::new(UdpState { fd }),
    })
}

impl UdpChannel {
    /// The address the socket is bound to (resolves port 0 binds).
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let ret = unsafe {
            libc::getsockname(
                self.state.fd,
                &mut storage as *mut _ as *mut libc::sockaddr,
                &mut len,
            )
        };
        if ret < 0 {
            return Err(last_os_error());
        }
        sockaddr_to_socket_addr(&storage, len)
            .ok_or_else(|| Error::message("unparseable local address"))
    }

    /// Receive one datagram and its sender.
    pub fn recv_from(&self) -> Future<(Bytes, SocketAddr)> {
        let fd = self.state.fd;
        reactor::local().ring.borrow_mut().submit(
            OpRes::Msg(MsgBuf::new(vec![0u8; UDP_BUFFER_SIZE])),
            move |res| {
                let msg = res.msg();
                opcode::RecvMsg::new(types::Fd(fd), &mut msg.hdr).build()
            },
            |ret, res| {
                let n = check_len(ret)?;
                let msg = res.into_msg();
                let peer = sockaddr_to_socket_addr(&msg.addr, msg.hdr.msg_namelen)
                    .ok_or_else(|| Error::message("unparseable datagram source"))?;
                let mut buf = msg.buf;
                buf.truncate(n);
                Ok((Bytes::from(buf), peer))
            },
        )
    }

    /// Send one datagram to `addr`.
    pub fn send_to(&self, data: &[u8], addr: SocketAddr) -> Future<()> {
        let fd = self.state.fd;
        let mut msg = MsgBuf::new(data.to_vec());
        let addr_len = socket_addr_to_sockaddr(addr, &mut msg.addr);
        msg.hdr.msg_namelen = addr_len;
        reactor::local().ring.borrow_mut().submit(
            OpRes::Msg(msg),
            move |res| {
                let msg = res.msg();
                opcode::SendMsg::new(types::Fd(fd), &msg.hdr).build()
            },
            |ret, _| check_zero(ret),
        )
    }
}
