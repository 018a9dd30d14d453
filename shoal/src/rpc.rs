//! RPC client and server over shoal sockets.
//!
//! The wire format lives in the `rpc-proto` crate; this module drives it:
//! negotiation exchange and verification, per-connection msg_id
//! allocation (positive, monotonically increasing, rejected on reuse or
//! exhaustion), verb dispatch on the server, and out-of-order response
//! matching on the client. Responses are written as each handler
//! finishes, so a slow verb does not block replies to later requests.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;

use bytes::{Bytes, BytesMut};
use rpc_proto::{ExceptionBody, Negotiation, Request, Response};

use crate::error::Error;
use crate::future::iterate::{StopIteration, repeat, repeat_until_value};
use crate::future::{Future, Promise};
use crate::net::{ConnectedSocket, ServerSocket, SocketSink, SocketSource};
use crate::semaphore::Semaphore;
use crate::stream::{InputStream, OutputStream};

type ParseFn<T> = fn(&[u8]) -> Result<Option<(T, usize)>, rpc_proto::ParseError>;

fn protocol_error(e: rpc_proto::ParseError) -> Error {
    Error::Protocol(e.to_string().into())
}

/// Read one frame of type `T` from the stream. Resolves to `None` on a
/// clean end-of-stream at a frame boundary; a mid-frame end is an error.
fn read_frame<T: 'static>(
    input: InputStream<SocketSource>,
    parse: ParseFn<T>,
) -> Future<Option<T>> {
    let acc = Rc::new(RefCell::new(BytesMut::new()));
    repeat_until_value(move || {
        let parsed = parse(&acc.borrow()[..]);
        match parsed {
            Err(e) => return Future::err(protocol_error(e)),
            Ok(Some((frame, consumed))) => {
                let mut a = acc.borrow_mut();
                let leftover = a.split_off(consumed);
                input.unread(leftover.freeze());
                a.clear();
                return Future::ready(Some(Some(frame)));
            }
            Ok(None) => {}
        }
        let acc2 = acc.clone();
        input.read().then(move |chunk| {
            if chunk.is_empty() {
                if acc2.borrow().is_empty() {
                    Ok(Some(None))
                } else {
                    Err(Error::Protocol("connection closed mid-frame".into()))
                }
            } else {
                acc2.borrow_mut().extend_from_slice(&chunk);
                Ok(None)
            }
        })
    })
}

/// Serialize frame writes on one connection: responses from concurrent
/// handlers must not interleave bytes. Clones share the stream and lock.
#[derive(Clone)]
struct FrameWriter {
    out: OutputStream<SocketSink>,
    lock: Semaphore,
}

impl FrameWriter {
    fn new(out: OutputStream<SocketSink>) -> FrameWriter {
        FrameWriter {
            out,
            lock: Semaphore::new(1),
        }
    }

    fn write(&self, frame: Bytes) -> Future<()> {
        let out = self.out.clone();
        let lock = self.lock.clone();
        self.lock.wait().then(move |()| {
            let flusher = out.clone();
            out.write(&frame)
                .then(move |()| flusher.flush())
                .finally(move || {
                    lock.signal();
                    Ok(())
                })
        })
    }
}

/// A verb handler: payload in, payload out. An `Err` is shipped to the
/// caller as a user exception.
pub type Handler = Rc<dyn Fn(Bytes) -> Future<Bytes>>;

/// A verb table plus the feature bits negotiated on every connection.
pub struct Protocol {
    handlers: HashMap<u64, Handler>,
    required_features: u32,
    optional_features: u32,
}

impl Protocol {
    pub fn new(required_features: u32, optional_features: u32) -> Protocol {
        Protocol {
            handlers: HashMap::new(),
            required_features,
            optional_features,
        }
    }

    /// Register the handler for `verb`.
    pub fn register(&mut self, verb: u64, handler: impl Fn(Bytes) -> Future<Bytes> + 'static) {
        self.handlers.insert(verb, Rc::new(handler));
    }

    fn negotiation(&self) -> Negotiation {
        Negotiation {
            required_features: self.required_features,
            optional_features: self.optional_features,
            data: Bytes::new(),
        }
    }

    fn verify(&self, peer: &Negotiation) -> Result<(), Error> {
        if peer.required_features != self.required_features {
            return Err(Error::Protocol(
                format!(
                    "required-features mismatch: ours {:#x}, peer {:#x}",
                    self.required_features, peer.required_features
                )
                .into(),
            ));
        }
        Ok(())
    }
}

fn encode_response(resp: &Response) -> Bytes {
    let mut out = BytesMut::new();
    resp.encode(&mut out);
    out.freeze()
}

/// Serve `proto` on an accepted connection until the peer disconnects.
fn serve_connection(proto: Rc<Protocol>, socket: ConnectedSocket) -> Future<()> {
    let input = socket.input();
    let writer = FrameWriter::new(socket.output());

    // Negotiation first: send ours, verify theirs.
    let mut hello = BytesMut::new();
    proto.negotiation().encode(&mut hello);
    let proto2 = proto.clone();
    let writer2 = writer.clone();
    let input2 = input.clone();
    writer
        .write(hello.freeze())
        .then(move |()| read_frame(input2, Negotiation::parse))
        .then(move |peer| {
            let Some(peer) = peer else {
                return Future::ready(());
            };
            if let Err(e) = proto2.verify(&peer) {
                return Future::err(e);
            }
            let last_msg_id = Rc::new(Cell::new(0i64));
            let proto = proto2;
            let writer = writer2;
            repeat(move || {
                let proto = proto.clone();
                let writer = writer.clone();
                let last_msg_id = last_msg_id.clone();
                read_frame(input.clone(), Request::parse).then(move |req| {
                    let Some(req) = req else {
                        return Ok(StopIteration::Yes);
                    };
                    // msg_ids must never repeat; our clients allocate
                    // monotonically, so anything non-increasing is reuse.
                    if req.msg_id <= last_msg_id.get() {
                        return Err(Error::Protocol(
                            format!("msg_id {} reused", req.msg_id).into(),
                        ));
                    }
                    last_msg_id.set(req.msg_id);
                    dispatch_request(&proto, &writer, req);
                    Ok(StopIteration::No)
                })
            })
        })
}

/// Run the handler (if any) and ship the response when it resolves.
/// Detached: the read loop keeps accepting requests meanwhile, which is
/// what lets responses leave out of order.
fn dispatch_request(proto: &Rc<Protocol>, writer: &FrameWriter, req: Request) {
    let msg_id = req.msg_id;
    let writer = writer.clone();
    let result: Future<Bytes> = match proto.handlers.get(&req.verb) {
        Some(h) => h(req.payload),
        None => Future::err(Error::UnknownVerb(req.verb)),
    };
    result
        .then_wrapped(move |res| {
            let resp = match res {
                Ok(payload) => Response::success(msg_id, payload),
                Err(Error::UnknownVerb(v)) => {
                    Response::exception(msg_id, &ExceptionBody::UnknownVerb(v))
                }
                Err(e) => Response::exception(msg_id, &ExceptionBody::User(e.to_string())),
            };
            writer.write(encode_response(&resp))
        })
        .ignore();
}

/// Accept and serve connections until the listener is aborted.
pub fn serve(proto: Protocol, listener: ServerSocket) -> Future<()> {
    let proto = Rc::new(proto);
    repeat(move || {
        let proto = proto.clone();
        listener.accept().then_wrapped(move |res| match res {
            Ok((socket, _peer)) => {
                serve_connection(proto, socket).ignore();
                Ok(StopIteration::No)
            }
            Err(Error::Aborted) => Ok(StopIteration::Yes),
            Err(e) => Err(e),
        })
    })
}

struct ClientState {
    writer: FrameWriter,
    next_id: Cell<i64>,
    outstanding: RefCell<HashMap<i64, Promise<Bytes>>>,
    broken: RefCell<Option<Error>>,
}

/// Client half of a connection: issue [`call`](RpcClient::call)s, match
/// responses by msg_id in whatever order they return.
#[derive(Clone)]
pub struct RpcClient {
    state: Rc<ClientState>,
}

/// Connect, exchange negotiation frames, and start the response reader.
pub fn connect(addr: SocketAddr, required_features: u32) -> Future<RpcClient> {
    crate::net::connect(addr).then(move |socket| {
        let input = socket.input();
        let writer = FrameWriter::new(socket.output());

        let mut hello = BytesMut::new();
        Negotiation {
            required_features,
            optional_features: 0,
            data: Bytes::new(),
        }
        .encode(&mut hello);

        let input2 = input.clone();
        writer
            .write(hello.freeze())
            .then(move |()| read_frame(input2, Negotiation::parse))
            .then(move |peer| {
                let Some(peer) = peer else {
                    return Err(Error::Protocol("server closed during negotiation".into()));
                };
                if peer.required_features != required_features {
                    return Err(Error::Protocol(
                        format!(
                            "required-features mismatch: ours {required_features:#x}, peer {:#x}",
                            peer.required_features
                        )
                        .into(),
                    ));
                }
                let state = Rc::new(ClientState {
                    writer,
                    next_id: Cell::new(1),
                    outstanding: RefCell::new(HashMap::new()),
                    broken: RefCell::new(None),
                });
                spawn_response_reader(state.clone(), input);
                Ok(RpcClient { state })
            })
    })
}

/// Read responses until the connection drops; on any failure, every
/// outstanding call fails with it.
fn spawn_response_reader(state: Rc<ClientState>, input: InputStream<SocketSource>) {
    let loop_state = state.clone();
    repeat(move || {
        let state = loop_state.clone();
        read_frame(input.clone(), Response::parse).then(move |resp| {
            let Some(resp) = resp else {
                return Ok(StopIteration::Yes);
            };
            let waiter = state.outstanding.borrow_mut().remove(&resp.request_id());
            // Responses the client stopped waiting for are dropped; not
            // every request must be answered either.
            if let Some(p) = waiter {
                if resp.is_exception() {
                    let err = match ExceptionBody::parse(&resp.payload) {
                        Ok(ExceptionBody::User(msg)) => Error::Remote(msg.into()),
                        Ok(ExceptionBody::UnknownVerb(v)) => Error::UnknownVerb(v),
                        Err(e) => protocol_error(e),
                    };
                    p.set_error(err);
                } else {
                    p.set_value(resp.payload);
                }
            }
            Ok(StopIteration::No)
        })
    })
    .then_wrapped(move |res| {
        let err = match res {
            Ok(()) => Error::Protocol("connection closed".into()),
            Err(e) => e,
        };
        *state.broken.borrow_mut() = Some(err.clone());
        for (_, p) in state.outstanding.borrow_mut().drain() {
            p.set_error(err.clone());
        }
        Ok(())
    })
    .ignore();
}

impl RpcClient {
    /// Invoke `verb` with `payload`; resolves with the response payload
    /// or the remote exception.
    pub fn call(&self, verb: u64, payload: Bytes) -> Future<Bytes> {
        if let Some(err) = self.state.broken.borrow().clone() {
            return Future::err(err);
        }
        let id = self.state.next_id.get();
        if id == i64::MAX {
            // Never wrap: a wrapped id would eventually repeat, and ids
            // must not be reused for the life of the connection.
            return Future::err(Error::Protocol("msg_id space exhausted".into()));
        }
        self.state.next_id.set(id + 1);

        let mut p = Promise::new();
        let fut = p.get_future();
        self.state.outstanding.borrow_mut().insert(id, p);

        let mut out = BytesMut::new();
        Request {
            verb,
            msg_id: id,
            payload,
        }
        .encode(&mut out);

        let state = self.state.clone();
        self.state
            .writer
            .write(out.freeze())
            .then_wrapped(move |res| {
                if let Err(e) = res
                    && let Some(p) = state.outstanding.borrow_mut().remove(&id)
                {
                    p.set_error(e);
                }
                Ok(())
            })
            .ignore();
        fut
    }
}
