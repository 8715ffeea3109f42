//! Local-channel scenarios on a single loop.

use relay::dev_tracing::init_tracing;
use relay::event::{Accept, BufferRecycled, Close, Connect, Destroy, Read, Timeout, Write};
use relay::{Buffer, Loop, Pipe, PipeKind, RelayError, Timer};
use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

fn socket_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("relay-it-{}-{tag}.sock", std::process::id()))
}

fn bump(counter: &Rc<Cell<u32>>) -> impl FnMut(&Destroy, &Pipe) + 'static {
    let counter = counter.clone();
    move |_, _| counter.set(counter.get() + 1)
}

#[test]
fn test_greeting_exchange() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let path = socket_path("greet");
    let destroys = Rc::new(Cell::new(0));
    let client_writes = Rc::new(Cell::new(0));
    let server_got = Rc::new(RefCell::new(Vec::new()));
    let client_got = Rc::new(RefCell::new(Vec::new()));

    let server = Pipe::create(&lp).unwrap();
    server.on::<Destroy>(bump(&destroys));
    server.bind(&path).unwrap();
    server.listen_default().unwrap();
    {
        let destroys = destroys.clone();
        let server_got = server_got.clone();
        server.on::<Accept<PipeKind>>(move |accept, server| {
            let peer = Rc::new(accept.take().expect("peer"));
            peer.on::<Destroy>(bump(&destroys));
            let got = server_got.clone();
            peer.on::<Read>(move |read, _| got.borrow_mut().extend_from_slice(&read.data));

            peer.write_async(Buffer::from_slice(b"greet-from-server!")).unwrap();
            peer.shutdown().unwrap();
            peer.read_start().unwrap();
            peer.ref_until::<Close>();
            server.close();
        });
    }

    let client = Rc::new(Pipe::create(&lp).unwrap());
    client.on::<Destroy>(bump(&destroys));
    client.on::<Connect>(|_, client| {
        client.write_async(Buffer::from_slice(b"greet-from-client!")).unwrap();
        client.read_start().unwrap();
    });
    {
        let writes = client_writes.clone();
        client.on::<Write>(move |_, _| writes.set(writes.get() + 1));
        let got = client_got.clone();
        client.on::<Read>(move |read, _| got.borrow_mut().extend_from_slice(&read.data));
    }
    client.connect(&path).unwrap();
    client.ref_until::<Close>();
    drop(client);

    lp.run();
    drop(server);

    assert_eq!(&client_got.borrow()[..], b"greet-from-server!");
    assert_eq!(&server_got.borrow()[..], b"greet-from-client!");
    assert_eq!(client_writes.get(), 1);
    assert_eq!(destroys.get(), 3);
}

#[test]
fn test_immediate_close_still_delivers() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let path = socket_path("immediate");
    let received = Rc::new(RefCell::new(Vec::new()));
    let recycled_capacity = Rc::new(Cell::new(None));

    let server = Pipe::create(&lp).unwrap();
    server.bind(&path).unwrap();
    server.listen_default().unwrap();
    {
        let received = received.clone();
        server.on::<Accept<PipeKind>>(move |accept, server| {
            let peer = Rc::new(accept.take().expect("peer"));
            let got = received.clone();
            peer.on::<Read>(move |read, _| got.borrow_mut().extend_from_slice(&read.data));
            peer.read_start().unwrap();
            peer.ref_until::<Close>();
            server.close();
        });
    }

    let client = Rc::new(Pipe::create(&lp).unwrap());
    {
        let capacity = recycled_capacity.clone();
        client.on::<BufferRecycled>(move |recycled, _| capacity.set(recycled.capacity()));
    }
    client.on::<Connect>(|_, client| {
        let mut buffer = Buffer::with_capacity(1);
        buffer.assign(b"!");
        client.write_async(buffer).unwrap();
        client.close();
    });
    client.connect(&path).unwrap();
    client.ref_until::<Close>();
    drop(client);

    lp.run();
    assert_eq!(&received.borrow()[..], b"!");
    assert_eq!(recycled_capacity.get(), Some(1));
}

#[test]
fn test_write_after_close_rejected_without_events() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let (left, _right) = socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();
    let pipe = Pipe::create(&lp).unwrap();
    pipe.open(left).unwrap();

    let events = Rc::new(Cell::new(0));
    {
        let e = events.clone();
        pipe.on::<Write>(move |_, _| e.set(e.get() + 1));
        let e = events.clone();
        pipe.on::<BufferRecycled>(move |_, _| e.set(e.get() + 1));
    }

    pipe.close();
    let rejected = pipe.write_async(Buffer::from_slice(b"late")).unwrap_err();
    assert!(matches!(rejected.reason, RelayError::Closed));
    lp.run();
    assert_eq!(events.get(), 0);
}

#[test]
fn test_double_close_in_one_tick() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let pipe = Pipe::create(&lp).unwrap();
    let closes = Rc::new(Cell::new(0));
    let c = closes.clone();
    pipe.on::<Close>(move |_, _| c.set(c.get() + 1));

    pipe.close();
    pipe.close();
    lp.run();
    assert_eq!(closes.get(), 1);
}

#[test]
fn test_shared_handle_lives_until_close() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let destroys = Rc::new(Cell::new(0));
    let pipe = Pipe::create_shared(&lp).unwrap();
    pipe.on::<Destroy>(bump(&destroys));
    pipe.ref_until::<Close>();
    let weak = Rc::downgrade(&pipe);
    drop(pipe);

    assert!(weak.upgrade().is_some());
    if let Some(pipe) = weak.upgrade() {
        pipe.close();
    }
    assert_eq!(destroys.get(), 0);
    lp.run();
    assert!(weak.upgrade().is_none());
    assert_eq!(destroys.get(), 1);
}

/// Counters for the events a writer's buffers produce.
#[derive(Default)]
struct WriteTally {
    recycled: Cell<u32>,
    closes: Cell<u32>,
    destroys: Cell<u32>,
}

fn tally(pipe: &Pipe) -> Rc<WriteTally> {
    let tally = Rc::new(WriteTally::default());
    let t = tally.clone();
    pipe.on::<BufferRecycled>(move |_, _| t.recycled.set(t.recycled.get() + 1));
    let t = tally.clone();
    pipe.on::<Close>(move |_, _| t.closes.set(t.closes.get() + 1));
    let t = tally.clone();
    pipe.on::<Destroy>(move |_, _| t.destroys.set(t.destroys.get() + 1));
    tally
}

/// A pipe whose peer never reads, with one write too large to finish.
fn blocked_writer(lp: &Loop) -> (Pipe, socket2::Socket, Rc<WriteTally>) {
    let (left, right) = socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();
    let pipe = Pipe::create(lp).unwrap();
    pipe.open(left).unwrap();
    let tally = tally(&pipe);
    pipe.write_async(Buffer::from(vec![7_u8; 16 << 20])).unwrap();
    assert_eq!(pipe.write_queue_size(), 1);
    (pipe, right, tally)
}

fn after(lp: &Loop, delay: Duration, action: impl FnOnce() + 'static) -> Timer {
    let timer = Timer::create(lp).unwrap();
    timer.once::<Timeout>(move |_, _| action());
    timer.start(delay, Duration::ZERO).unwrap();
    timer
}

#[test]
fn test_close_recycles_blocked_write() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let (pipe, _peer, tally) = blocked_writer(&lp);
    let pipe = Rc::new(pipe);
    let closing = pipe.clone();
    let _timer = after(&lp, Duration::from_millis(50), move || closing.close());
    lp.run();

    assert_eq!(tally.recycled.get(), 1);
    assert_eq!(tally.closes.get(), 1);
    assert_eq!(pipe.write_queue_size(), 0);
}

#[test]
fn test_close_then_drop_recycles_blocked_write() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let (pipe, _peer, tally) = blocked_writer(&lp);
    let owner = Rc::new(RefCell::new(Some(pipe)));
    let slot = owner.clone();
    let _timer = after(&lp, Duration::from_millis(50), move || {
        let pipe = slot.borrow_mut().take();
        if let Some(pipe) = pipe {
            pipe.close();
            drop(pipe);
        }
    });
    lp.run();

    assert!(owner.borrow().is_none());
    assert_eq!(tally.recycled.get(), 1);
    assert_eq!(tally.closes.get(), 1);
    assert_eq!(tally.destroys.get(), 1);
}

#[test]
fn test_drop_from_recycle_handler_recycles_every_buffer() {
    init_tracing();
    let lp = Loop::new().unwrap();
    let (left, _right) = socket2::Socket::pair(socket2::Domain::UNIX, socket2::Type::STREAM, None).unwrap();
    let pipe = Pipe::create(&lp).unwrap();
    pipe.open(left).unwrap();
    let destroys = Rc::new(Cell::new(0));
    pipe.on::<Destroy>(bump(&destroys));

    let owner = Rc::new(RefCell::new(None::<Pipe>));
    let recycled = Rc::new(Cell::new(0));
    {
        let owner = owner.clone();
        let recycled = recycled.clone();
        pipe.on::<BufferRecycled>(move |_, _| {
            recycled.set(recycled.get() + 1);
            let last = owner.borrow_mut().take();
            drop(last);
        });
    }
    for chunk in [&b"one"[..], b"two", b"three"] {
        pipe.write_async(Buffer::from_slice(chunk)).unwrap();
    }
    *owner.borrow_mut() = Some(pipe);
    lp.run();

    assert!(owner.borrow().is_none());
    assert_eq!(recycled.get(), 3);
    assert_eq!(destroys.get(), 1);
}
