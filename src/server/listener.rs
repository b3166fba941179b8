use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::http::connection::{Connection, ConnectionContext, Next, WriteStatus};
use crate::server::pool::{Rejected, WorkerPool};
use crate::server::reactor::{Epoll, Event, Token, Waker};

const LISTENER: Token = Token(usize::MAX);
const WAKER: Token = Token(usize::MAX - 1);
const MAX_EVENTS: usize = 1024;
/// Upper bound on how long a shutdown request goes unnoticed.
const WAIT_TIMEOUT_MS: i32 = 100;

type Conn = Box<Connection<TcpStream>>;

/// Who currently owns the connection behind a token.
enum Slot {
    Vacant,
    /// Parked on the reactor thread, waiting for readiness.
    Idle(Conn),
    /// Queued or being processed by a worker.
    InFlight,
}

/// A connection handed back by a worker, with what to do next.
struct Processed {
    conn: Conn,
    next: Next,
}

/// Binds the configured address and serves until `shutdown` is set.
pub fn run(cfg: &Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    let addr = cfg.listen_addr()?;
    let listener = TcpListener::bind(addr).with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    serve(listener, cfg, shutdown)
}

/// Serves connections accepted from an already bound `listener`.
pub fn serve(listener: TcpListener, cfg: &Config, shutdown: Arc<AtomicBool>) -> Result<()> {
    listener
        .set_nonblocking(true)
        .context("failed to make listener non-blocking")?;

    let epoll = Arc::new(Epoll::new().context("failed to create epoll instance")?);
    let waker = Arc::new(Waker::new().context("failed to create waker")?);
    epoll
        .watch(listener.as_raw_fd(), LISTENER)
        .context("failed to register listener")?;
    epoll
        .watch(waker.fd(), WAKER)
        .context("failed to register waker")?;

    let ctx = Arc::new(ConnectionContext::new(cfg, epoll.clone()));

    let (tx, returned) = mpsc::channel::<Processed>();
    let worker_waker = Arc::clone(&waker);
    let pool = WorkerPool::new(
        cfg.workers.threads,
        cfg.workers.queue_capacity,
        move |mut conn: Conn| {
            let next = conn.process();
            // Only fails once the event loop is gone; dropping closes the
            // connection.
            if tx.send(Processed { conn, next }).is_ok() {
                if let Err(e) = worker_waker.wake() {
                    warn!(error = %e, "failed to wake event loop");
                }
            }
        },
    )
    .context("failed to start worker pool")?;

    let mut event_loop = EventLoop {
        epoll,
        waker,
        listener,
        ctx,
        pool,
        returned,
        slots: Vec::new(),
        free: Vec::new(),
        max_connections: cfg.server.max_connections,
    };
    event_loop.run(&shutdown)
}

struct EventLoop {
    epoll: Arc<Epoll>,
    waker: Arc<Waker>,
    listener: TcpListener,
    ctx: Arc<ConnectionContext>,
    pool: WorkerPool<Conn>,
    returned: Receiver<Processed>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    max_connections: usize,
}

impl EventLoop {
    fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];

        while !shutdown.load(Ordering::Acquire) {
            let n = self
                .epoll
                .wait(&mut events, WAIT_TIMEOUT_MS)
                .context("epoll_wait failed")?;

            // Reset before draining so a wakeup sent mid-drain is not lost.
            self.waker.reset();
            self.drain_returned();

            for raw in &events[..n] {
                let event = Event::from_raw(*raw);
                match event.token {
                    LISTENER => self.accept(),
                    WAKER => {}
                    _ => self.dispatch(event),
                }
            }
        }

        info!("Shutdown signal received");
        self.shutdown();
        Ok(())
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => self.open(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn open(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.ctx.live.get() >= self.max_connections {
            warn!(peer = %peer, limit = self.max_connections, "connection limit reached, dropping");
            return;
        }
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(peer = %peer, error = %e, "failed to make socket non-blocking");
            return;
        }
        info!("Accepted connection from {}", peer);

        let index = match self.free.pop() {
            Some(index) => index,
            None => {
                self.slots.push(Slot::Vacant);
                self.slots.len() - 1
            }
        };

        match Connection::open(stream, peer, Token(index), Arc::clone(&self.ctx)) {
            Ok(conn) => self.slots[index] = Slot::Idle(Box::new(conn)),
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to register connection");
                self.free.push(index);
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let index = event.token.0;
        let Some(slot) = self.slots.get_mut(index) else {
            warn!(token = index, "event for unknown token");
            return;
        };

        let mut conn = match mem::replace(slot, Slot::InFlight) {
            Slot::Idle(conn) => conn,
            Slot::InFlight => {
                warn!(token = index, "readiness reported for a connection in flight");
                return;
            }
            Slot::Vacant => {
                *slot = Slot::Vacant;
                debug!(token = index, "event for a closed connection");
                return;
            }
        };

        if event.hangup {
            debug!(peer = %conn.peer(), "peer hung up");
            self.release(index, conn);
        } else if event.writable {
            match conn.write() {
                WriteStatus::Complete | WriteStatus::Pending => self.slots[index] = Slot::Idle(conn),
                WriteStatus::Close => self.release(index, conn),
            }
        } else if event.readable {
            if let Err(e) = conn.read() {
                debug!(peer = %conn.peer(), error = %e, "closing connection");
                self.release(index, conn);
                return;
            }
            // The slot stays in flight until a worker hands the connection back.
            if let Err(Rejected { item, reason }) = self.pool.submit(conn) {
                warn!(peer = %item.peer(), ?reason, "work queue rejected connection");
                self.release(index, item);
            }
        } else {
            self.slots[index] = Slot::Idle(conn);
        }
    }

    /// Parks connections returned by workers and re-arms them.
    fn drain_returned(&mut self) {
        while let Ok(Processed { conn, next }) = self.returned.try_recv() {
            let index = conn.token().0;
            match next {
                Next::Rearm(interest) => match conn.rearm(interest) {
                    Ok(()) => self.slots[index] = Slot::Idle(conn),
                    Err(e) => {
                        warn!(peer = %conn.peer(), error = %e, "rearm failed");
                        self.release(index, conn);
                    }
                },
                Next::Close => self.release(index, conn),
            }
        }
    }

    fn release(&mut self, index: usize, mut conn: Conn) {
        conn.close();
        self.slots[index] = Slot::Vacant;
        self.free.push(index);
    }

    fn shutdown(&mut self) {
        // Workers finish what is queued; their connections come back through
        // the channel and are closed with the rest.
        self.pool.shutdown();
        while let Ok(Processed { mut conn, .. }) = self.returned.try_recv() {
            conn.close();
        }

        info!(open = self.ctx.live.get(), "closing connections");
        for slot in &mut self.slots {
            if let Slot::Idle(mut conn) = mem::replace(slot, Slot::Vacant) {
                conn.close();
            }
        }
        self.slots.clear();
        self.free.clear();
    }
}
