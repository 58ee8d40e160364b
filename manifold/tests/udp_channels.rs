//! UDP channel integration: per-datagram framing, drop accounting, and
//! loss tolerance on the receive path.

use std::thread;
use std::time::{Duration, Instant};

use manifold::channels;
use manifold::pool::SelectorPool;
use manifold_core::codec;
use manifold_core::codec::MessageCodec;

#[test]
fn datagrams_deliver_and_decode() {
    manifold::trace::init();
    let pool = SelectorPool::open("udp", 2).unwrap();
    const MESSAGES: u32 = 100;

    let mut receiver = channels::udp()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    receiver.wait_connected().unwrap();
    let addr = receiver.local_addr().expect("bound socket has an address");

    let mut sender = channels::udp()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .connect(addr)
        .unwrap();
    sender.wait_connected().unwrap();

    for i in 0..MESSAGES {
        let mut body = [0u8; 32];
        body[..4].copy_from_slice(&i.to_be_bytes());
        sender.send(&body).unwrap();
    }

    // Datagram delivery is best-effort even on loopback; accept loss,
    // reject corruption.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut received = 0u32;
    while received < MESSAGES && Instant::now() < deadline {
        match receiver.try_recv().unwrap() {
            Some(msg) => {
                assert_eq!(msg.len(), 32, "delivered datagrams decode whole");
                received += 1;
            }
            None => thread::sleep(Duration::from_millis(5)),
        }
    }
    assert!(
        received >= MESSAGES / 2,
        "loopback delivery collapsed: {received}/{MESSAGES}"
    );
    assert_eq!(
        receiver.dropped_datagrams(),
        0,
        "well-formed datagrams must not be dropped"
    );
    pool.close();
}

#[test]
fn garbage_datagrams_are_counted_not_fatal() {
    let pool = SelectorPool::open("udp-drop", 1).unwrap();

    let mut receiver = channels::udp()
        .with_pool(&pool)
        .with_codec(codec::short(64))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    receiver.wait_connected().unwrap();
    let addr = receiver.local_addr().unwrap();

    let raw = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    // Truncated frame: header claims more than the datagram carries.
    raw.send_to(&[0x00, 0x20, 0xAA, 0xBB], addr).unwrap();
    // Oversize frame: length beyond the codec limit.
    raw.send_to(&[0xFF, 0xFF, 0x00], addr).unwrap();
    // One well-formed frame afterwards.
    let mut wire = bytes::BytesMut::new();
    codec::short(64).put(b"still alive", &mut wire).unwrap();
    raw.send_to(&wire, addr).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let msg = loop {
        if let Some(msg) = receiver.try_recv().unwrap() {
            break msg;
        }
        assert!(Instant::now() < deadline, "valid datagram never arrived");
        thread::sleep(Duration::from_millis(5));
    };
    assert_eq!(msg, b"still alive");
    assert_eq!(receiver.dropped_datagrams(), 2, "both bad datagrams are counted");
    pool.close();
}

#[test]
fn udp_send_respects_rate_limit() {
    use manifold_core::limit::RateUnit;
    let pool = SelectorPool::open("udp-rate", 2).unwrap();
    const MESSAGES: u32 = 12;
    const BODY: usize = 1024;
    const RATE: u64 = 4 * 1024;

    let mut receiver = channels::udp()
        .with_pool(&pool)
        .with_codec(codec::short(BODY))
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    receiver.wait_connected().unwrap();
    let addr = receiver.local_addr().unwrap();

    let mut sender = channels::udp()
        .with_pool(&pool)
        .with_codec(codec::short(BODY))
        .with_rate_limit(RATE, RateUnit::BytesPerSecond)
        .connect(addr)
        .unwrap();
    sender.wait_connected().unwrap();

    let started = Instant::now();
    let body = vec![7u8; BODY];
    for _ in 0..MESSAGES {
        sender.send(&body).unwrap();
    }
    // Drain until the pacing finishes delivering.
    let deadline = Instant::now() + Duration::from_secs(20);
    let mut received = 0;
    while received < MESSAGES && Instant::now() < deadline {
        match receiver.try_recv().unwrap() {
            Some(_) => received += 1,
            None => thread::sleep(Duration::from_millis(10)),
        }
    }
    let elapsed = started.elapsed();

    // 12 KiB on a 4 KiB/s bucket with a one-second burst: at least one
    // second of pacing before the tail goes out.
    assert!(received >= MESSAGES / 2, "pacing lost datagrams: {received}");
    assert!(
        elapsed >= Duration::from_millis(900),
        "sends outran the bucket: {elapsed:?}"
    );
    pool.close();
}
