//! Request pipelining against a notifier that counts arms.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use portgate_aio::{
    AsyncSocket, Interest, IoCallback, IoNotifier, ReactorNotifier, SocketId, READ_CHUNK_SIZE,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

/// Wraps the reactor notifier and records how many arms are pending per
/// socket and direction.
struct CountingNotifier {
    inner: ReactorNotifier,
    armed: Arc<Mutex<HashMap<(SocketId, Interest), usize>>>,
    peak: Arc<AtomicUsize>,
}

impl CountingNotifier {
    fn new() -> Self {
        Self {
            inner: ReactorNotifier::current().unwrap(),
            armed: Arc::new(Mutex::new(HashMap::new())),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn wrap(&self, id: SocketId, interest: Interest, callback: IoCallback) -> IoCallback {
        {
            let mut armed = self.armed.lock();
            let count = armed.entry((id, interest)).or_insert(0);
            *count += 1;
            self.peak.fetch_max(*count, Ordering::SeqCst);
        }
        let armed = Arc::clone(&self.armed);
        Box::new(move || {
            if let Some(count) = armed.lock().get_mut(&(id, interest)) {
                *count -= 1;
            }
            callback();
        })
    }
}

impl IoNotifier for CountingNotifier {
    fn runtime(&self) -> &Handle {
        self.inner.runtime()
    }

    fn track(&self, id: SocketId, stream: Weak<TcpStream>) {
        self.inner.track(id, stream);
    }

    fn untrack(&self, id: SocketId) {
        self.inner.untrack(id);
    }

    fn set_readable_callback(&self, id: SocketId, callback: IoCallback) {
        let callback = self.wrap(id, Interest::Readable, callback);
        self.inner.set_readable_callback(id, callback);
    }

    fn set_writable_callback(&self, id: SocketId, callback: IoCallback) {
        let callback = self.wrap(id, Interest::Writable, callback);
        self.inner.set_writable_callback(id, callback);
    }

    fn wait_for_removal(&self, id: SocketId) {
        self.inner.wait_for_removal(id);
    }
}

async fn connected(notifier: Arc<dyn IoNotifier>) -> (AsyncSocket, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let socket = AsyncSocket::new(notifier);
    let (connected, accepted) = tokio::join!(
        async { socket.connect("127.0.0.1", port, Duration::from_secs(1)) },
        listener.accept()
    );
    connected.unwrap();
    (socket, accepted.unwrap().0)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn queued_requests_keep_one_operation_in_flight() {
    let counting = Arc::new(CountingNotifier::new());
    let peak = Arc::clone(&counting.peak);
    let (socket, mut peer) = connected(counting).await;

    let (read_tx, mut read_rx) = mpsc::unbounded_channel();
    for i in 0..8 {
        let tx = read_tx.clone();
        socket.async_read(4, move |result| {
            let _ = tx.send((i, result));
        });
    }

    let (write_tx, mut write_rx) = mpsc::unbounded_channel();
    for i in 0..8u8 {
        let tx = write_tx.clone();
        socket.async_write(Bytes::from(vec![i; 64 * 1024]), move |result| {
            let _ = tx.send((i, result));
        });
    }

    let in_flight = socket.in_flight();
    assert!(in_flight.queued_reads <= 8);
    assert!(in_flight.queued_writes <= 8);

    // Drain the writes on the peer while feeding the reads.
    let drain = tokio::spawn(async move {
        let mut received = vec![0u8; 8 * 64 * 1024];
        peer.read_exact(&mut received).await.unwrap();
        for (i, chunk) in received.chunks(64 * 1024).enumerate() {
            assert!(chunk.iter().all(|b| *b == i as u8), "write {i} out of order");
        }
        for i in 0..8u8 {
            peer.write_all(&[i; 4]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        peer
    });

    for expected in 0..8u8 {
        let (i, result) = timeout(WAIT, write_rx.recv()).await.unwrap().unwrap();
        assert_eq!(i, expected);
        assert!(result.success);
        assert_eq!(result.size, 64 * 1024);
    }
    for expected in 0..8 {
        let (i, result) = timeout(WAIT, read_rx.recv()).await.unwrap().unwrap();
        assert_eq!(i, expected);
        assert!(result.success);
        assert!(!result.buffer.is_empty());
    }

    let _peer = drain.await.unwrap();
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(socket.in_flight(), Default::default());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn dropping_socket_waits_for_pending_arms() {
    let counting = Arc::new(CountingNotifier::new());
    let armed = Arc::clone(&counting.armed);
    let (socket, _peer) = connected(counting).await;

    socket.async_read(READ_CHUNK_SIZE, |_| {});
    socket.async_write(Bytes::from_static(b"x"), |_| {});
    let id = socket.id();

    tokio::task::spawn_blocking(move || drop(socket))
        .await
        .unwrap();

    let armed = armed.lock();
    assert_eq!(armed.get(&(id, Interest::Readable)).copied().unwrap_or(0), 0);
    assert_eq!(armed.get(&(id, Interest::Writable)).copied().unwrap_or(0), 0);
}

mod ordering {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // Writes queued back to back arrive at the peer in queue order and
        // in full, whatever the mix of buffer sizes.
        #[test]
        fn prop_writes_arrive_in_order(sizes in proptest::collection::vec(1usize..200_000, 1..12)) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            let (expected, received) = rt.block_on(async {
                let notifier: Arc<dyn IoNotifier> = Arc::new(ReactorNotifier::current().unwrap());
                let (socket, mut peer) = connected(notifier).await;

                let mut expected = Vec::new();
                for (i, size) in sizes.iter().enumerate() {
                    let chunk = vec![i as u8; *size];
                    expected.extend_from_slice(&chunk);
                    socket.async_write(Bytes::from(chunk), |_| {});
                }

                let mut received = vec![0u8; expected.len()];
                timeout(WAIT, peer.read_exact(&mut received))
                    .await
                    .unwrap()
                    .unwrap();
                (expected, received)
            });

            prop_assert!(received == expected);
        }
    }
}
