//! I/O notifier.
//!
//! The notifier answers "is this socket ready?" on behalf of the sockets it
//! tracks. A socket arms it for one readable or one writable event at a time
//! and gets a callback on a runtime worker thread when that event fires.
//!
//! Every arm produces exactly one dispatch: either the socket became ready,
//! or the socket was untracked and the pending arm is flushed so that its
//! owner observes the close. Socket bookkeeping (in-flight flags) relies on
//! this.
//!
//! The notifier's registry holds only a [`Weak`] reference to a tracked
//! stream. A pending arm upgrades it for as long as it waits, so the file
//! descriptor outlives the socket's own handle until that arm is dispatched;
//! sockets therefore shut the stream down explicitly when they release it.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};
use tokio::net::TcpStream;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::watch;
use tracing::trace;

use crate::error::SocketError;

/// Process-unique identity of a socket handle.
pub type SocketId = u64;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a fresh socket identity.
pub fn next_socket_id() -> SocketId {
    NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed)
}

/// One-shot callback run when an armed event is dispatched.
pub type IoCallback = Box<dyn FnOnce() + Send + 'static>;

/// Readiness direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interest {
    Readable,
    Writable,
}

/// Event-multiplexing service consumed by [`AsyncSocket`](crate::AsyncSocket).
pub trait IoNotifier: Send + Sync + 'static {
    /// Runtime that new streams are registered with.
    fn runtime(&self) -> &Handle;

    /// Start watching a stream.
    fn track(&self, id: SocketId, stream: Weak<TcpStream>);

    /// Stop watching a stream. Pending arms are flushed promptly.
    fn untrack(&self, id: SocketId);

    /// Arm a single readable dispatch.
    fn set_readable_callback(&self, id: SocketId, callback: IoCallback);

    /// Arm a single writable dispatch.
    fn set_writable_callback(&self, id: SocketId, callback: IoCallback);

    /// Untrack and block until no callback for `id` is armed or running.
    ///
    /// A dispatch of `id` on the calling thread does not count, so a socket
    /// may be released from inside its own callback.
    fn wait_for_removal(&self, id: SocketId);
}

thread_local! {
    static DISPATCHING: RefCell<Vec<SocketId>> = const { RefCell::new(Vec::new()) };
}

/// Run a blocking section from whatever thread we are on.
///
/// On a multi-thread runtime worker the worker core is handed off first so
/// queued tasks keep running while we block.
pub fn blocking_section<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    match Handle::try_current() {
        Ok(handle) if matches!(handle.runtime_flavor(), RuntimeFlavor::MultiThread) => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// Notifier backed by the tokio reactor.
///
/// Each arm is a spawned task waiting for readiness or untrack; tokio worker
/// threads are the I/O worker threads that run socket callbacks.
#[derive(Clone)]
pub struct ReactorNotifier {
    inner: Arc<Inner>,
}

struct Inner {
    runtime: Handle,
    state: Mutex<Registry>,
    drained: Condvar,
}

#[derive(Default)]
struct Registry {
    tracked: HashMap<SocketId, Tracked>,
    /// Armed plus running dispatches per socket.
    outstanding: HashMap<SocketId, usize>,
}

struct Tracked {
    stream: Weak<TcpStream>,
    /// Dropping the sender wakes every pending arm.
    alive: watch::Sender<()>,
}

impl ReactorNotifier {
    /// Create a notifier on the given runtime.
    pub fn new(runtime: Handle) -> Result<Self, SocketError> {
        if !matches!(runtime.runtime_flavor(), RuntimeFlavor::MultiThread) {
            return Err(SocketError::UnsupportedRuntime(
                "reactor notifier requires the multi-thread runtime",
            ));
        }

        Ok(Self {
            inner: Arc::new(Inner {
                runtime,
                state: Mutex::new(Registry::default()),
                drained: Condvar::new(),
            }),
        })
    }

    /// Create a notifier on the runtime of the calling thread.
    pub fn current() -> Result<Self, SocketError> {
        let handle = Handle::try_current()
            .map_err(|_| SocketError::UnsupportedRuntime("no tokio runtime on this thread"))?;
        Self::new(handle)
    }

    /// Number of streams currently tracked.
    pub fn tracked_count(&self) -> usize {
        self.inner.state.lock().tracked.len()
    }

    /// Armed plus running dispatches for a socket.
    pub fn outstanding(&self, id: SocketId) -> usize {
        self.inner
            .state
            .lock()
            .outstanding
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    fn arm(&self, id: SocketId, interest: Interest, callback: IoCallback) {
        let waiter = {
            let mut state = self.inner.state.lock();
            *state.outstanding.entry(id).or_insert(0) += 1;
            state
                .tracked
                .get(&id)
                .and_then(|t| t.stream.upgrade().map(|s| (s, t.alive.subscribe())))
        };

        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            if let Some((stream, mut alive)) = waiter {
                tokio::select! {
                    _ = wait_ready(&stream, interest) => {}
                    _ = alive.changed() => {}
                }
            }
            inner.dispatch(id, interest, callback);
        });
    }
}

async fn wait_ready(stream: &TcpStream, interest: Interest) {
    // Errors surface on the next try_read/try_write.
    let _ = match interest {
        Interest::Readable => stream.readable().await,
        Interest::Writable => stream.writable().await,
    };
}

impl Inner {
    fn dispatch(&self, id: SocketId, interest: Interest, callback: IoCallback) {
        trace!(socket_id = id, ?interest, "Dispatching io callback");
        let _guard = DispatchGuard::enter(self, id);
        callback();
    }

    fn release(&self, id: SocketId) {
        let mut state = self.state.lock();
        if let Some(count) = state.outstanding.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                state.outstanding.remove(&id);
            }
        }
        self.drained.notify_all();
    }
}

struct DispatchGuard<'a> {
    inner: &'a Inner,
    id: SocketId,
}

impl<'a> DispatchGuard<'a> {
    fn enter(inner: &'a Inner, id: SocketId) -> Self {
        DISPATCHING.with(|d| d.borrow_mut().push(id));
        Self { inner, id }
    }
}

impl Drop for DispatchGuard<'_> {
    fn drop(&mut self) {
        DISPATCHING.with(|d| {
            let mut d = d.borrow_mut();
            if let Some(pos) = d.iter().rposition(|x| *x == self.id) {
                d.remove(pos);
            }
        });
        self.inner.release(self.id);
    }
}

impl IoNotifier for ReactorNotifier {
    fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    fn track(&self, id: SocketId, stream: Weak<TcpStream>) {
        let (alive, _) = watch::channel(());
        let previous = self
            .inner
            .state
            .lock()
            .tracked
            .insert(id, Tracked { stream, alive });
        drop(previous);
        trace!(socket_id = id, "Tracking socket");
    }

    fn untrack(&self, id: SocketId) {
        let removed = self.inner.state.lock().tracked.remove(&id);
        if removed.is_some() {
            trace!(socket_id = id, "Untracked socket");
        }
        // Dropped outside the lock; this wakes the pending arms.
        drop(removed);
    }

    fn set_readable_callback(&self, id: SocketId, callback: IoCallback) {
        self.arm(id, Interest::Readable, callback);
    }

    fn set_writable_callback(&self, id: SocketId, callback: IoCallback) {
        self.arm(id, Interest::Writable, callback);
    }

    fn wait_for_removal(&self, id: SocketId) {
        self.untrack(id);

        let own = DISPATCHING.with(|d| d.borrow().iter().filter(|x| **x == id).count());
        blocking_section(|| {
            let mut state = self.inner.state.lock();
            while state.outstanding.get(&id).copied().unwrap_or(0) > own {
                self.inner.drained.wait(&mut state);
            }
        });
    }
}
