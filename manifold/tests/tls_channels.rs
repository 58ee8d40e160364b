//! TLS channel integration: handshake, data transfer, and the clean
//! close-notify exchange, over rcgen-generated certificate material.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use manifold::channels;
use manifold::pool::SelectorPool;
use manifold::{MessageChannel, ServerChannel};
use manifold_core::codec;
use parking_lot::Mutex;
use rustls::pki_types::PrivateKeyDer;

struct TlsMaterial {
    server: Arc<rustls::ServerConfig>,
    client: Arc<rustls::ClientConfig>,
}

fn self_signed() -> TlsMaterial {
    let certified = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
    let cert_der = certified.cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(certified.key_pair.serialize_der().into());

    let server = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TlsMaterial {
        server: Arc::new(server),
        client: Arc::new(client),
    }
}

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
fn tls_handshake_and_echo() {
    manifold::trace::init();
    let pool = SelectorPool::open("tls", 2).unwrap();
    let material = self_signed();

    let server = channels::tls_server()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .with_context(material.server)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let mut client = channels::tls()
        .with_pool(&pool)
        .with_codec(codec::short(1024))
        .with_context(material.client)
        .with_server_name("localhost")
        .connect(server.local_addr())
        .unwrap();

    // The connect future resolves only after the handshake finished.
    client
        .connect_future()
        .wait_timeout(Duration::from_secs(10))
        .expect("handshake should finish")
        .unwrap();

    client.send(b"hello world").unwrap();
    assert_eq!(client.recv().unwrap(), b"hello world");
    pool.close();
}

#[test]
fn tls_clean_close_notify() {
    let pool = SelectorPool::open("tls-close", 2).unwrap();
    let material = self_signed();

    let server = channels::tls_server()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_context(material.server)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    echo_server(&server);

    let server_close = Arc::new(Mutex::new(None));
    let observed = Arc::clone(&server_close);
    server.on_close(move |_peer, cause| {
        *observed.lock() = Some(cause);
    });

    let mut client = channels::tls()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_context(material.client)
        .with_server_name("localhost")
        .connect(server.local_addr())
        .unwrap();
    client.wait_connected().unwrap();

    client.send(b"goodbye").unwrap();
    assert_eq!(client.recv().unwrap(), b"goodbye");

    // Client-initiated close sends close-notify; the server side must
    // observe a clean closure, not a TLS or I/O failure.
    client
        .close()
        .wait_timeout(Duration::from_secs(5))
        .expect("client close should complete")
        .unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(cause) = server_close.lock().clone() {
            assert!(cause.is_none(), "server close must be clean, got {cause:?}");
            break;
        }
        assert!(std::time::Instant::now() < deadline, "server never closed");
        thread::sleep(Duration::from_millis(10));
    }
    pool.close();
}

#[test]
fn tls_rejects_untrusted_server() {
    let pool = SelectorPool::open("tls-bad", 1).unwrap();
    let material = self_signed();
    // Separate material: the client trusts nobody who signed this server.
    let stranger = self_signed();

    let server = channels::tls_server()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_context(stranger.server)
        .bind("127.0.0.1:0".parse().unwrap())
        .unwrap();
    server.on_accept(|_peer, _channel| {});

    let client = channels::tls()
        .with_pool(&pool)
        .with_codec(codec::short(256))
        .with_context(material.client)
        .with_server_name("localhost")
        .connect(server.local_addr())
        .unwrap();

    let result = client
        .connect_future()
        .wait_timeout(Duration::from_secs(10))
        .expect("handshake must resolve");
    assert!(result.is_err(), "untrusted certificate must fail the handshake");
    pool.close();
}
