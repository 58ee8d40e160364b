//! TCP channel integration: echo, framing across reads, backpressure,
//! close semantics, and poisoned-stream handling.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use manifold::channels;
use manifold::error::ChannelError;
use manifold::pool::SelectorPool;
use manifold::{MessageChannel, ServerChannel};
use manifold_core::codec;
use manifold_core::codec::{CodecError, MessageCodec};
use parking_lot::Mutex;

fn echo_server(server: &ServerChannel) {
    server.on_accept(|_peer, mut channel: MessageChannel| {
        thread::spawn(move || {
            while let Ok(msg) = channel.recv() {
                if channel.send(&msg).is_err() {
                    break;
                }
            }
        });
    });
}

#[test]
fn tcp_echo_hello_world() {
    manifold::trace::init();
    let pool = SelectorPool::open("echo", 2).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);
    server
        .bind_future()
        .wait_timeout(Duration::from_secs(5))
        .expect("bind should complete")
        .unwrap();

    let mut client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    client.send(b"hello world").unwrap();
    assert_eq!(client.recv().unwrap(), b"hello world");

    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("close should complete")
        .unwrap();
    pool.close();
}

#[test]
fn three_frames_cross_intact() {
    let pool = SelectorPool::open("frames", 1).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let mut client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    let bodies: Vec<Vec<u8>> = (0..3u8).map(|i| vec![i; 300]).collect();
    for body in &bodies {
        client.send(body).unwrap();
    }
    for body in &bodies {
        assert_eq!(&client.recv().unwrap(), body);
    }

    pool.close();
}

#[test]
fn ring_buffer_echo() {
    let pool = SelectorPool::open("ring", 1).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(512))
        .use_ring_buffer()
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let mut client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(512))
        .use_ring_buffer()
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    client.send(b"over the ring").unwrap();
    assert_eq!(client.recv().unwrap(), b"over the ring");
    pool.close();
}

#[test]
fn backpressure_loses_nothing() {
    let pool = SelectorPool::open("bp", 2).unwrap();
    const MESSAGES: usize = 200;

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_buffer_capacity(8)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let mut client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_buffer_capacity(8)
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    // Saturate the tiny queues from a dedicated thread; the slow
    // consumer below forces the full backpressure path.
    let mut output = client.take_output().unwrap();
    let sender = thread::spawn(move || {
        for i in 0..MESSAGES {
            let slot = output.claim().unwrap();
            let mut body = [0u8; 256];
            body[..4].copy_from_slice(&(i as u32).to_be_bytes());
            slot.set_from(&body).unwrap();
            output.publish();
        }
    });

    for i in 0..MESSAGES {
        thread::sleep(Duration::from_millis(1));
        let msg = client.recv().unwrap();
        assert_eq!(msg.len(), 256);
        assert_eq!(&msg[..4], &(i as u32).to_be_bytes(), "messages must stay ordered");
    }
    sender.join().unwrap();
    pool.close();
}

#[test]
fn single_input_buffer_fans_in() {
    let pool = SelectorPool::open("fanin", 2).unwrap();

    let mut server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .use_single_input_buffer()
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    // Accepted channels are send-only handles here; receiving goes
    // through the shared buffer.
    server.on_accept(|_peer, _channel| {});
    let addr = server.local_addr();

    let mut first = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .connect(addr)
        .unwrap();
    let mut second = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .connect(addr)
        .unwrap();
    first.wait_connected().unwrap();
    second.wait_connected().unwrap();

    first.send(b"from-first").unwrap();
    second.send(b"from-second").unwrap();

    let shared = server.input().expect("single input buffer mode");
    let mut received = Vec::new();
    for _ in 0..2 {
        let slot = shared.acquire().unwrap();
        received.push(slot.as_slice().to_vec());
        shared.release();
    }
    received.sort();
    assert_eq!(received, vec![b"from-first".to_vec(), b"from-second".to_vec()]);
    pool.close();
}

#[test]
fn close_is_idempotent() {
    let pool = SelectorPool::open("close", 1).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    let completions = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&completions);
    client.on_close(move |_cause| {
        count.fetch_add(1, Ordering::SeqCst);
    });

    let first = client.close();
    let second = client.close();
    first
        .wait_timeout(Duration::from_secs(5))
        .expect("close should complete")
        .unwrap();
    assert!(second.is_done(), "second close observes the completed future");

    thread::sleep(Duration::from_millis(100));
    assert_eq!(completions.load(Ordering::SeqCst), 1);
    pool.close();
}

#[test]
fn connect_to_dead_port_fails() {
    let pool = SelectorPool::open("refused", 1).unwrap();

    // Bind-then-drop to get a port nothing listens on.
    let port = {
        let sock = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        sock.local_addr().unwrap().port()
    };
    let client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .connect(format!("127.0.0.1:{port}").parse().unwrap())
        .unwrap();

    let result = client
        .connect_future()
        .wait_timeout(Duration::from_secs(5))
        .expect("connect must resolve");
    assert!(result.is_err(), "connect to a dead port must fail");
    pool.close();
}

/// Write raw corrupted bytes at a checksum-codec server and watch the
/// channel die with `InvalidEncoding`, exactly once.
#[test]
fn checksum_corruption_closes_channel() {
    let pool = SelectorPool::open("crc", 1).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::crc32(1024))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    server.on_accept(|_peer, _channel| {});

    let close_count = Arc::new(AtomicUsize::new(0));
    let close_cause = Arc::new(Mutex::new(None));
    let count = Arc::clone(&close_count);
    let cause_slot = Arc::clone(&close_cause);
    server.on_close(move |_peer, cause| {
        count.fetch_add(1, Ordering::SeqCst);
        *cause_slot.lock() = cause;
    });

    // A well-formed CRC32 frame with one payload bit flipped on the wire.
    let mut wire = bytes::BytesMut::new();
    codec::crc32(1024).put(b"hello world", &mut wire).unwrap();
    wire[4 + 3] ^= 0x01;

    let mut raw = std::net::TcpStream::connect(server.local_addr()).unwrap();
    raw.write_all(&wire).unwrap();
    raw.flush().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while close_count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(close_count.load(Ordering::SeqCst), 1, "close listener fires once");
    let cause = close_cause.lock().clone().expect("close must carry a cause");
    assert!(
        matches!(
            &*cause,
            ChannelError::Codec(CodecError::InvalidEncoding(_))
        ),
        "cause should be InvalidEncoding, got {cause}"
    );
    pool.close();
}

/// A length header beyond the configured body length closes the channel
/// with `InvalidLength` before any partial message is delivered.
#[test]
fn oversize_length_header_closes_channel() {
    let pool = SelectorPool::open("len", 1).unwrap();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(64))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    let delivered = Arc::new(AtomicUsize::new(0));
    let delivered_in_handler = Arc::clone(&delivered);
    server.on_accept(move |_peer, mut channel| {
        let delivered = Arc::clone(&delivered_in_handler);
        thread::spawn(move || {
            while channel.recv().is_ok() {
                delivered.fetch_add(1, Ordering::SeqCst);
            }
        });
    });

    let close_cause = Arc::new(Mutex::new(None));
    let cause_slot = Arc::clone(&close_cause);
    server.on_close(move |_peer, cause| {
        *cause_slot.lock() = cause;
    });

    let mut raw = std::net::TcpStream::connect(server.local_addr()).unwrap();
    // Claims 1000 bytes of body against a 64-byte codec.
    raw.write_all(&1000u16.to_be_bytes()).unwrap();
    raw.write_all(&[0u8; 32]).unwrap();
    raw.flush().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while close_cause.lock().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    let cause = close_cause.lock().clone().expect("channel must close");
    assert!(matches!(
        &*cause,
        ChannelError::Codec(CodecError::InvalidLength { length: 1000, .. })
    ));
    assert_eq!(delivered.load(Ordering::SeqCst), 0, "no partial message is enqueued");
    pool.close();
}

#[test]
fn monitor_reports_lifecycle() {
    let pool = SelectorPool::open("mon", 1).unwrap();
    let (events, monitor) = manifold::create_monitor();

    let server = channels::tcp_server()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let client = channels::tcp()
        .with_pool(&pool)
        .with_codec(codec::short(128))
        .with_monitor(events)
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();
    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("close should complete")
        .unwrap();

    let connected = monitor.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(connected, manifold::SocketEvent::Connected(_)));
    let closed = monitor.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(closed, manifold::SocketEvent::Closed { cause: None, .. }));
    pool.close();
}
