//! Descriptor handoff between loops running on different threads.

use relay::dev_tracing::init_tracing;
use relay::event::{Accept, Close, Connect, Read, Timeout, Write};
use relay::{Buffer, Loop, Pipe, PipeKind, Tcp, TcpKind, Timer};
use std::io::{Read as _, Write as _};
use std::net::TcpStream;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("relay-handoff-{}-{tag}.sock", std::process::id()))
}

/// Close everything on the loop if a scenario stalls.
fn watchdog(lp: &Loop) -> Timer {
    let timer = Timer::create(lp).unwrap();
    timer.on::<Timeout>(|_, timer| timer.event_loop().close_all());
    timer.start(Duration::from_secs(10), Duration::ZERO).unwrap();
    timer
}

#[test]
fn test_listening_socket_moves_between_loops() {
    init_tracing();
    let path = socket_path("listener");
    let x_accepts = Arc::new(AtomicUsize::new(0));
    let y_accepts = Arc::new(AtomicUsize::new(0));
    let (y_ready_tx, y_ready_rx) = flume::bounded::<()>(1);
    let (listening_tx, listening_rx) = flume::bounded::<()>(1);
    let (addr_tx, addr_rx) = flume::bounded(1);

    // Y: receives the listening socket and keeps accepting on it
    let y = {
        let path = path.clone();
        let y_accepts = y_accepts.clone();
        thread::Builder::new()
            .name("loop-y".into())
            .spawn(move || {
                let lp = Loop::new().unwrap();
                let _watchdog = watchdog(&lp);
                let rendezvous = Pipe::create_with(&lp, PipeKind::cross_process()).unwrap();
                rendezvous.bind(&path).unwrap();
                rendezvous.listen_default().unwrap();
                rendezvous.on::<Accept<PipeKind>>(move |accept, _| {
                    let channel = Rc::new(accept.take().expect("channel"));
                    assert!(channel.is_cross_process());
                    let y_accepts = y_accepts.clone();
                    let listening_tx = listening_tx.clone();
                    channel.on::<Accept<TcpKind>>(move |accept, _| {
                        let listener = Rc::new(accept.take().expect("listener"));
                        let y_accepts = y_accepts.clone();
                        listener.on::<Accept<TcpKind>>(move |accept, listener| {
                            drop(accept.take());
                            if y_accepts.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                                listener.event_loop().close_all();
                            }
                        });
                        listener.listen_default().unwrap();
                        listener.ref_until::<Close>();
                        let _ = listening_tx.send(());
                    });
                    channel.read_start().unwrap();
                    channel.ref_until::<Close>();
                });
                y_ready_tx.send(()).unwrap();
                lp.run();
            })
            .unwrap()
    };
    y_ready_rx.recv().unwrap();

    // X: owns the listener first, then hands it to Y and closes its copy
    let x = {
        let x_accepts = x_accepts.clone();
        thread::Builder::new()
            .name("loop-x".into())
            .spawn(move || {
                let lp = Loop::new().unwrap();
                let listener = Rc::new(Tcp::create(&lp).unwrap());
                listener.bind_str("127.0.0.1:0").unwrap();
                listener.listen_default().unwrap();
                listener.on::<Accept<TcpKind>>(move |_, _| {
                    x_accepts.fetch_add(1, Ordering::SeqCst);
                });
                addr_tx.send(listener.local_addr().unwrap()).unwrap();

                let channel = Pipe::create_with(&lp, PipeKind::cross_process()).unwrap();
                let outgoing = listener.clone();
                channel.on::<Connect>(move |_, channel| {
                    channel.send_tcp_handle(&outgoing).unwrap();
                });
                let ours = listener.clone();
                channel.on::<Write>(move |_, channel| {
                    ours.close();
                    channel.close();
                });
                channel.connect(&path).unwrap();
                lp.run();
            })
            .unwrap()
    };

    // X's loop has exited and dropped its copy before anyone connects
    let addr = addr_rx.recv().unwrap();
    x.join().unwrap();
    listening_rx.recv().unwrap();

    for _ in 0..2 {
        let _stream = TcpStream::connect(addr).unwrap();
    }
    y.join().unwrap();
    assert_eq!(x_accepts.load(Ordering::SeqCst), 0);
    assert_eq!(y_accepts.load(Ordering::SeqCst), 2);
}

#[test]
fn test_accepted_connection_moves_with_its_peer() {
    init_tracing();
    let (addr_tx, addr_rx) = flume::bounded(1);
    let (ready_tx, ready_rx) = flume::bounded::<()>(1);
    let (left, right) =
        socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();

    // worker loop: answers on whatever connection it is handed
    let worker = thread::Builder::new()
        .name("worker".into())
        .spawn(move || {
            let lp = Loop::new().unwrap();
            let _watchdog = watchdog(&lp);
            let channel = Pipe::create_with(&lp, PipeKind::cross_process()).unwrap();
            channel.open(right).unwrap();
            channel.on::<Accept<TcpKind>>(|accept, channel| {
                let conn = Rc::new(accept.take().expect("connection"));
                conn.on::<Read>(|read, conn| {
                    let mut reply = b"worker:".to_vec();
                    reply.extend_from_slice(&read.data);
                    conn.write_async(Buffer::from(reply)).unwrap();
                });
                conn.on::<Write>(|_, conn| conn.event_loop().close_all());
                conn.read_start().unwrap();
                conn.ref_until::<Close>();
                channel.close();
            });
            channel.read_start().unwrap();
            lp.run();
        })
        .unwrap();

    // front loop: accepts, then passes the connection on
    let front = thread::Builder::new()
        .name("front".into())
        .spawn(move || {
            let lp = Loop::new().unwrap();
            let channel = Rc::new(Pipe::create_with(&lp, PipeKind::cross_process()).unwrap());
            channel.open(left).unwrap();
            let server = Tcp::create(&lp).unwrap();
            server.bind_str("127.0.0.1:0").unwrap();
            server.listen_default().unwrap();
            addr_tx.send(server.local_addr().unwrap()).unwrap();

            let outgoing = channel.clone();
            server.on::<Accept<TcpKind>>(move |accept, server| {
                let conn = accept.take().expect("connection");
                outgoing.send_tcp_handle(&conn).unwrap();
                // our copy goes away with `conn`; the worker's stays open
                server.close();
            });
            channel.on::<Write>(|_, channel| channel.close());
            ready_tx.send(()).unwrap();
            lp.run();
        })
        .unwrap();

    let addr = addr_rx.recv().unwrap();
    ready_rx.recv().unwrap();
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(b"ping").unwrap();
    let mut reply = Vec::new();
    stream.read_to_end(&mut reply).unwrap();
    assert_eq!(reply, b"worker:ping");

    front.join().unwrap();
    worker.join().unwrap();
}
