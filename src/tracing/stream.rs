//! Loopback TCP server broadcasting the live event stream.
//!
//! Framing is one UTF-8 JSON object per `\n`-terminated line, so `nc
//! 127.0.0.1 <port>` is a valid reference consumer. Each subscriber gets the
//! current registry snapshot on connect and every event emitted afterwards.
//! Emission never blocks the instrumentor: events go through a bounded
//! per-subscriber queue and a dedicated writer thread, and a slow subscriber
//! either loses events or its connection, per the configured policy.

use super::config::BackpressurePolicy;
use super::types::TraceEvent;
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Queued lines per subscriber before the back-pressure policy applies.
const SEND_QUEUE_CAPACITY: usize = 1024;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const IO_TIMEOUT: Duration = Duration::from_millis(500);
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Builds the registry-snapshot event sent to a subscriber on connect.
pub(crate) type RegistrySource = Arc<dyn Fn() -> TraceEvent + Send + Sync>;

/// Invoked when a subscriber sends a `finalize` control message.
pub(crate) type FinalizeHook = Arc<dyn Fn() + Send + Sync>;

/// The trace stream fan-out server.
pub struct StreamServer {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    accept_handle: Option<JoinHandle<()>>,
}

struct Shared {
    subscribers: Mutex<Vec<Subscriber>>,
    shutdown: AtomicBool,
    policy: BackpressurePolicy,
    dropped_events: AtomicU64,
    disconnects: AtomicU64,
    next_subscriber_id: AtomicU64,
    registry_source: RegistrySource,
    finalize_hook: FinalizeHook,
}

struct Subscriber {
    id: u64,
    tx: Sender<Arc<str>>,
    paused: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    stream: TcpStream,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl StreamServer {
    /// Binds the loopback listener and starts the accept loop.
    ///
    /// Port 0 binds an ephemeral port; the bound address is available via
    /// [`Self::local_addr`].
    pub(crate) fn start(
        port: u16,
        policy: BackpressurePolicy,
        registry_source: RegistrySource,
        finalize_hook: FinalizeHook,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            subscribers: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            policy,
            dropped_events: AtomicU64::new(0),
            disconnects: AtomicU64::new(0),
            next_subscriber_id: AtomicU64::new(0),
            registry_source,
            finalize_hook,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_handle = thread::Builder::new()
            .name("flowtrace-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        log::debug!("trace stream server listening on {local_addr}");
        Ok(Self { shared, local_addr, accept_handle: Some(accept_handle) })
    }

    /// Returns the bound listener address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.lock().iter().filter(|s| s.alive.load(Ordering::Relaxed)).count()
    }

    /// Events dropped for slow subscribers under the drop policy.
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Subscribers disconnected for cause (slow, dead, timed out).
    pub fn disconnects(&self) -> u64 {
        self.shared.disconnects.load(Ordering::Relaxed)
    }

    /// Relays one event line to every live subscriber without blocking.
    pub(crate) fn broadcast(&self, line: &Arc<str>) {
        let mut subscribers = self.shared.subscribers.lock();
        for subscriber in subscribers.iter() {
            if !subscriber.alive.load(Ordering::Relaxed)
                || subscriber.paused.load(Ordering::Relaxed)
            {
                continue;
            }
            match subscriber.tx.try_send(Arc::clone(line)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => match self.shared.policy {
                    BackpressurePolicy::DropEvents => {
                        self.shared.dropped_events.fetch_add(1, Ordering::Relaxed);
                    }
                    BackpressurePolicy::Disconnect => {
                        self.shared.disconnect(subscriber);
                    }
                },
                Err(TrySendError::Disconnected(_)) => {
                    subscriber.alive.store(false, Ordering::Relaxed);
                }
            }
        }
        // reap dead handlers; their threads exit on their own once the
        // sender is gone, so emission never waits on a join
        subscribers.retain(|subscriber| subscriber.alive.load(Ordering::Relaxed));
    }

    /// Stops accepting, disconnects every subscriber and joins all handler
    /// threads. Subscribers observe a clean EOF.
    pub(crate) fn close(&mut self) {
        self.shared.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.join();
        }

        let mut subscribers = std::mem::take(&mut *self.shared.subscribers.lock());
        for subscriber in &mut subscribers {
            subscriber.alive.store(false, Ordering::Relaxed);
            let _ = subscriber.stream.shutdown(Shutdown::Both);
        }
        for mut subscriber in subscribers {
            subscriber.join_threads();
        }
        log::debug!("trace stream server on {} closed", self.local_addr);
    }
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("local_addr", &self.local_addr)
            .field("subscribers", &self.shared.subscribers.lock().len())
            .finish()
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if self.accept_handle.is_some() {
            self.close();
        }
    }
}

impl Shared {
    fn disconnect(&self, subscriber: &Subscriber) {
        if !subscriber.alive.swap(false, Ordering::Relaxed) {
            return;
        }
        let _ = subscriber.stream.shutdown(Shutdown::Both);
        self.disconnects.fetch_add(1, Ordering::Relaxed);
        log::debug!("trace stream subscriber {} disconnected", subscriber.id);
    }
}

impl Subscriber {
    fn join_threads(&mut self) {
        // both loops watch the alive flag, already cleared by the caller
        if let Some(handle) = self.writer.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while !shared.shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                if let Err(err) = register_subscriber(stream, &shared) {
                    log::warn!("trace stream subscriber {peer} rejected: {err}");
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                log::warn!("trace stream accept failed: {err}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn register_subscriber(stream: TcpStream, shared: &Arc<Shared>) -> std::io::Result<()> {
    stream.set_nodelay(true)?;
    stream.set_write_timeout(Some(IO_TIMEOUT))?;
    stream.set_read_timeout(Some(IO_TIMEOUT))?;
    SockRef::from(&stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(KEEPALIVE_TIME))?;

    let id = shared.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = bounded::<Arc<str>>(SEND_QUEUE_CAPACITY);
    let paused = Arc::new(AtomicBool::new(false));
    let alive = Arc::new(AtomicBool::new(true));

    // snapshot first, so it precedes any live event queued for this
    // subscriber; it is not synchronized with the stream at large
    let snapshot: Arc<str> = (shared.registry_source)().to_line().into();
    let _ = tx.try_send(snapshot);

    let writer = {
        let stream = stream.try_clone()?;
        let alive = Arc::clone(&alive);
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("flowtrace-sub-{id}-w"))
            .spawn(move || writer_loop(stream, rx, alive, shared))?
    };
    let reader = {
        let stream = stream.try_clone()?;
        let tx = tx.clone();
        let paused = Arc::clone(&paused);
        let alive = Arc::clone(&alive);
        let shared = Arc::clone(shared);
        thread::Builder::new()
            .name(format!("flowtrace-sub-{id}-r"))
            .spawn(move || reader_loop(stream, tx, paused, alive, shared))?
    };

    log::debug!("trace stream subscriber {id} connected");
    shared.subscribers.lock().push(Subscriber {
        id,
        tx,
        paused,
        alive,
        stream,
        writer: Some(writer),
        reader: Some(reader),
    });
    Ok(())
}

fn writer_loop(
    mut stream: TcpStream,
    rx: crossbeam_channel::Receiver<Arc<str>>,
    alive: Arc<AtomicBool>,
    shared: Arc<Shared>,
) {
    while alive.load(Ordering::Relaxed) {
        let line = match rx.recv_timeout(IO_TIMEOUT) {
            Ok(line) => line,
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        };
        if stream.write_all(line.as_bytes()).and_then(|()| stream.write_all(b"\n")).is_err() {
            if alive.swap(false, Ordering::Relaxed) {
                shared.disconnects.fetch_add(1, Ordering::Relaxed);
            }
            break;
        }
    }
}

fn reader_loop(
    stream: TcpStream,
    tx: Sender<Arc<str>>,
    paused: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    shared: Arc<Shared>,
) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    while alive.load(Ordering::Relaxed) && !shared.shutdown.load(Ordering::Relaxed) {
        match reader.read_line(&mut line) {
            Ok(0) => {
                alive.store(false, Ordering::Relaxed);
                break;
            }
            Ok(_) => {
                handle_control(line.trim(), &tx, &paused, &shared);
                line.clear();
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock || err.kind() == ErrorKind::TimedOut => {
                // partial input stays in `line` until the newline arrives
            }
            Err(_) => {
                alive.store(false, Ordering::Relaxed);
                break;
            }
        }
    }
}

/// Applies one subscriber control message. Unrecognized input is ignored.
fn handle_control(raw: &str, tx: &Sender<Arc<str>>, paused: &AtomicBool, shared: &Arc<Shared>) {
    if raw.is_empty() {
        return;
    }
    let Ok(message) = serde_json::from_str::<serde_json::Value>(raw) else { return };
    match message.get("type").and_then(|t| t.as_str()) {
        Some("pause") => paused.store(true, Ordering::Relaxed),
        Some("resume") => paused.store(false, Ordering::Relaxed),
        Some("get_registry") => {
            let snapshot: Arc<str> = (shared.registry_source)().to_line().into();
            let _ = tx.try_send(snapshot);
        }
        Some("finalize") => (shared.finalize_hook)(),
        _ => {}
    }
}
