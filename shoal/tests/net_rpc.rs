//! Socket layer and the RPC protocol over loopback.

mod common;

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::Duration;

use bytes::Bytes;
use shoal::rpc;
use shoal::{
    AsyncResult, Error, ListenOptions, async_run, connect, listen, make_udp_channel, sleep,
};

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

#[test]
fn tcp_echo_round_trip() {
    common::run(1, || {
        let server = listen(loopback(), ListenOptions::default()).unwrap();
        let addr = server.local_addr().unwrap();

        // Server side: accept one connection and echo everything back.
        server
            .accept()
            .then(|(socket, _peer)| {
                let input = socket.input();
                let output = socket.output();
                input.consume(move |data: Bytes| {
                    if data.is_empty() {
                        return shoal::Future::ready(None);
                    }
                    output
                        .write(&data)
                        .then({
                            let output = output.clone();
                            move |()| output.flush()
                        })
                        .then(|()| Ok(Some(Bytes::new())))
                })
            })
            .ignore();

        // Client side, blocking style.
        async_run(move || -> AsyncResult<()> {
            let socket = connect(addr).get()?;
            socket.set_nodelay(true)?;
            let input = socket.input();
            let output = socket.output();

            output.write(b"hello over loopback").get()?;
            output.flush().get()?;
            let echoed = input.read_exactly(19).get()?;
            assert_eq!(&echoed[..], b"hello over loopback");

            socket.shutdown_output();
            Ok(())
        })
        .then(|r| r)
    });
}

#[test]
fn abort_accept_fails_pending_accept() {
    common::run(1, || {
        let server = listen(loopback(), ListenOptions::default()).unwrap();
        let server2 = server.clone();
        let pending = server.accept().then_wrapped(|res| match res {
            Err(Error::Aborted) => Ok(()),
            Ok(_) => Err(Error::message("accept unexpectedly succeeded")),
            Err(e) => Err(e),
        });
        sleep(Duration::from_millis(20)).then(move |()| {
            server2.abort_accept();
            pending
        })
    });
}

#[test]
fn udp_datagram_round_trip() {
    common::run(1, || {
        async_run(move || -> AsyncResult<()> {
            let a = make_udp_channel(loopback()).unwrap();
            let b = make_udp_channel(loopback()).unwrap();
            let a_addr = a.local_addr()?;

            b.send_to(b"marco", a_addr).get()?;
            let (data, from_b) = a.recv_from().get()?;
            assert_eq!(&data[..], b"marco");

            a.send_to(b"polo", from_b).get()?;
            let (data, from_a) = b.recv_from().get()?;
            assert_eq!(&data[..], b"polo");
            assert_eq!(from_a, a_addr);
            Ok(())
        })
        .then(|r| r)
    });
}

#[test]
fn rpc_echo_and_exceptions() {
    const ECHO: u64 = 1;
    const FAIL: u64 = 2;
    const UNKNOWN: u64 = 77;

    common::run(1, || {
        let mut proto = rpc::Protocol::new(0x2A, 0);
        proto.register(ECHO, |payload| shoal::Future::ready(payload));
        proto.register(FAIL, |_| {
            shoal::Future::err(Error::message("handler exploded"))
        });

        let listener = listen(loopback(), ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stopper = listener.clone();
        rpc::serve(proto, listener).ignore();

        rpc::connect(addr, 0x2A).then(move |client| {
            let c2 = client.clone();
            let c3 = client.clone();
            client
                .call(ECHO, Bytes::from_static(b"ping"))
                .then(move |reply| {
                    assert_eq!(&reply[..], b"ping");
                    c2.call(FAIL, Bytes::new()).then_wrapped(|res| match res {
                        Err(Error::Remote(msg)) => {
                            assert!(msg.contains("handler exploded"));
                            Ok(())
                        }
                        other => panic!("expected a remote error, got {other:?}"),
                    })
                })
                .then(move |()| {
                    c3.call(UNKNOWN, Bytes::new()).then_wrapped(|res| match res {
                        Err(Error::UnknownVerb(v)) => {
                            assert_eq!(v, UNKNOWN);
                            Ok(())
                        }
                        other => panic!("expected unknown-verb, got {other:?}"),
                    })
                })
                .then(move |()| {
                    stopper.abort_accept();
                    Ok(())
                })
        })
    });
}

#[test]
fn rpc_responses_arrive_out_of_order() {
    const FAST: u64 = 1;
    const SLOW: u64 = 2;

    common::run(1, || {
        let mut proto = rpc::Protocol::new(0, 0);
        proto.register(FAST, |payload| shoal::Future::ready(payload));
        proto.register(SLOW, |payload| {
            sleep(Duration::from_millis(100)).then(move |()| Ok(payload))
        });

        let listener = listen(loopback(), ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stopper = listener.clone();
        rpc::serve(proto, listener).ignore();

        rpc::connect(addr, 0).then(move |client| {
            let order: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));

            let o1 = order.clone();
            let slow = client
                .call(SLOW, Bytes::from_static(b"slow"))
                .then(move |reply| {
                    assert_eq!(&reply[..], b"slow");
                    o1.borrow_mut().push("slow");
                    Ok(())
                });
            let o2 = order.clone();
            let fast = client
                .call(FAST, Bytes::from_static(b"fast"))
                .then(move |reply| {
                    assert_eq!(&reply[..], b"fast");
                    o2.borrow_mut().push("fast");
                    Ok(())
                });

            shoal::join(slow, fast).then(move |(rs, rf)| {
                rs.unwrap();
                rf.unwrap();
                assert_eq!(
                    *order.borrow(),
                    vec!["fast", "slow"],
                    "the slow verb blocked the fast one"
                );
                stopper.abort_accept();
                Ok(())
            })
        })
    });
}

#[test]
fn rpc_feature_mismatch_disconnects() {
    common::run(1, || {
        let proto = rpc::Protocol::new(1, 0);
        let listener = listen(loopback(), ListenOptions::default()).unwrap();
        let addr = listener.local_addr().unwrap();
        let stopper = listener.clone();
        rpc::serve(proto, listener).ignore();

        rpc::connect(addr, 2).then_wrapped(move |res| {
            match res {
                Err(Error::Protocol(_)) => {}
                Ok(client) => {
                    // The server may drop us before or after our verify;
                    // either way a call must not succeed.
                    client
                        .call(1, Bytes::new())
                        .then_wrapped(|res| {
                            assert!(res.is_err());
                            Ok(())
                        })
                        .ignore();
                }
                Err(e) => panic!("unexpected error kind: {e}"),
            }
            stopper.abort_accept();
            Ok(())
        })
    });
}
