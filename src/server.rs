//! Single-task server dispatcher (spec §4.4/§5).
//!
//! One `tokio::select!` loop multiplexes the well-known listening socket and
//! every open session's ephemeral socket — `FuturesUnordered` turns the
//! dynamic set of per-session `recv_from` futures into one pollable stream,
//! mirroring the Python original's `select.select(inputlist, ...)` loop.
//! No session ever gets its own task: the dispatcher owns a
//! `HashMap<SocketAddr, Session>` keyed by peer TID, and sessions never hold
//! a back-reference to it (the "arena+index" design note).

use super::error::Error;
use super::file;
use super::options::Options;
use super::packet::{self, Packet};
use super::session::{Data, Role, Session, State};
use super::{ErrorCode, Observer};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use log::{error, info, trace, warn};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;

/// A caller-supplied source for RRQ targets that are not present on disk.
pub type DynFileFunc = Arc<dyn Fn(&str) -> Option<Box<dyn std::io::Read + Send>> + Send + Sync>;

/// A caller-supplied override for where a WRQ's bytes land.
pub type UploadOpen = Arc<dyn Fn(&str) -> Option<Box<dyn std::io::Write + Send>> + Send + Sync>;

pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub root: PathBuf,
    pub limits: Options,
    pub max_retries: u32,
    pub allow_overwrite: bool,
    pub dyn_file_func: Option<DynFileFunc>,
    pub upload_open: Option<UploadOpen>,
    pub observer: Option<Observer>,
}

/// Handle returned alongside a running server: lets the caller request a
/// graceful or immediate shutdown and read back whether the loop is still
/// running.
#[derive(Clone)]
pub struct ShutdownHandle {
    cancel: CancellationToken,
    graceful: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
}

impl ShutdownHandle {
    /// Stop accepting new RRQ/WRQ; let in-flight sessions finish, then exit.
    pub fn stop_graceful(&self) {
        self.graceful.store(true, Ordering::SeqCst);
    }

    /// Close everything immediately, abandoning in-flight sessions.
    pub fn stop_immediate(&self) {
        self.cancel.cancel();
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The address the listening socket actually bound to — useful when
    /// `listen_addr` was port 0 (tests, ephemeral bring-up).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

pub struct Server {
    config: ServerConfig,
}

enum Event {
    Immediate,
    NewRequest(SocketAddr, Vec<u8>),
    Inbound(SocketAddr, Result<(SocketAddr, Vec<u8>), Error>),
    Tick,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Server, Error> {
        let root = config.root.canonicalize()?;
        Ok(Server {
            config: ServerConfig { root, ..config },
        })
    }

    /// Runs the dispatcher to completion. Returns once the loop has exited:
    /// immediately on `stop_immediate`, or once the session map drains after
    /// `stop_graceful`.
    pub async fn serve(self) -> Result<(), Error> {
        let (_handle, running) = self.serve_with_handle().await?;
        running.run().await
    }

    /// Binds the listening socket and hands back a [`ShutdownHandle`]
    /// together with a [`Running`] future, before the event loop starts.
    /// Split this way so a caller can stash the handle, `tokio::spawn` the
    /// returned future, and signal shutdown from elsewhere in the same
    /// runtime — the dispatcher loop itself still runs on a single task.
    pub async fn serve_with_handle(self) -> Result<(ShutdownHandle, Running), Error> {
        let listen_sock = UdpSocket::bind(self.config.listen_addr).await?;
        let local_addr = listen_sock.local_addr()?;
        info!("tftp server listening on {local_addr}");

        let cancel = CancellationToken::new();
        let graceful = Arc::new(AtomicBool::new(false));
        let running_flag = Arc::new(AtomicBool::new(true));
        let handle = ShutdownHandle {
            cancel: cancel.clone(),
            graceful: graceful.clone(),
            running: running_flag.clone(),
            local_addr,
        };

        let running = Running {
            server: self,
            listen_sock,
            cancel,
            graceful,
            running_flag,
        };

        Ok((handle, running))
    }

    async fn accept(
        &self,
        sessions: &mut HashMap<SocketAddr, Session>,
        peer_addr: SocketAddr,
        buf: &[u8],
    ) {
        let pkt = match packet::decode(buf) {
            Ok(pkt @ (Packet::Rrq { .. } | Packet::Wrq { .. })) => pkt,
            Ok(_) => {
                trace!("[{peer_addr}] initial datagram was not RRQ/WRQ, dropping");
                return;
            }
            Err(e) => {
                trace!("[{peer_addr}] malformed initial datagram: {e}");
                return;
            }
        };

        let sock = match UdpSocket::bind((self.config.listen_addr.ip(), 0)).await {
            Ok(sock) => sock,
            Err(e) => {
                error!("[{peer_addr}] failed to bind session socket: {e}");
                return;
            }
        };

        let mut session = match self.build_session(sock, peer_addr, pkt).await {
            Ok(session) => session,
            Err(e) => {
                warn!("[{peer_addr}] rejected: {e}");
                let sock = match UdpSocket::bind((self.config.listen_addr.ip(), 0)).await {
                    Ok(sock) => sock,
                    Err(_) => return,
                };
                let pkt = Packet::Error {
                    code: e.error_code() as u16,
                    message: e.to_string(),
                };
                let _ = sock.send_to(&packet::encode(&pkt), peer_addr).await;
                return;
            }
        };

        if let Err(e) = session.start().await {
            warn!("[{peer_addr}] failed during session start: {e}");
            return;
        }

        if session.is_terminal() {
            self.log_completion(peer_addr, &session);
        } else {
            sessions.insert(peer_addr, session);
        }
    }

    async fn build_session(
        &self,
        sock: UdpSocket,
        peer_addr: SocketAddr,
        pkt: Packet,
    ) -> Result<Session, Error> {
        match pkt {
            Packet::Rrq {
                filename,
                mode,
                options,
            } => {
                let target = file::join(&self.config.root, &filename);
                let mut negotiated = options.negotiate(&self.config.limits);

                let data = match file::ensure_within_root(&self.config.root, &target) {
                    Ok(resolved) => {
                        let reader = file::open_read(&resolved)?;
                        let _ = negotiated.set_tsize(&resolved);
                        Data::Reader(Box::new(reader))
                    }
                    Err(_) if target.exists() => {
                        return Err(Error::AccessViolation("path escapes root"));
                    }
                    Err(_) => match &self.config.dyn_file_func {
                        Some(f) => match f(&filename) {
                            Some(reader) => Data::Reader(reader),
                            None => return Err(Error::FileNotFound),
                        },
                        None => return Err(Error::FileNotFound),
                    },
                };

                Ok(Session::new(
                    sock,
                    peer_addr,
                    Role::ServerRead,
                    mode,
                    negotiated,
                    data,
                    self.config.observer.clone(),
                    self.config.max_retries,
                ))
            }
            Packet::Wrq {
                filename,
                mode,
                options,
            } => {
                // `upload_open`, when configured, overrides the default
                // under-root creation entirely (spec §4.4/§6) — it is
                // consulted first, not as a fallback after a failed create.
                let data = if let Some(f) = &self.config.upload_open {
                    match f(&filename) {
                        Some(writer) => Data::Writer(writer),
                        None => return Err(Error::AccessViolation("no upload handler")),
                    }
                } else {
                    let target = file::join(&self.config.root, &filename);
                    let resolved = file::ensure_parent_within_root(&self.config.root, &target)
                        .map_err(|_| Error::AccessViolation("path escapes root"))?;
                    let f = file::open_create(&resolved, self.config.allow_overwrite)?;
                    Data::Writer(Box::new(f))
                };

                let negotiated = options.negotiate(&self.config.limits);

                Ok(Session::new(
                    sock,
                    peer_addr,
                    Role::ServerWrite,
                    mode,
                    negotiated,
                    data,
                    self.config.observer.clone(),
                    self.config.max_retries,
                ))
            }
            _ => Err(Error::ProtocolViolation("expected RRQ or WRQ")),
        }
    }

    async fn handle_inbound(
        &self,
        sessions: &mut HashMap<SocketAddr, Session>,
        key: SocketAddr,
        result: Result<(SocketAddr, Vec<u8>), Error>,
    ) {
        let Some(session) = sessions.get_mut(&key) else {
            return;
        };

        let (src, buf) = match result {
            Ok(pair) => pair,
            Err(e) => {
                warn!("[{key}] socket error: {e}");
                sessions.remove(&key);
                return;
            }
        };

        if src != session.peer_addr() {
            if let Err(e) = session.reply_unknown_tid(src).await {
                warn!("[{key}] failed to reply to unknown TID {src}: {e}");
            }
            return;
        }

        match packet::decode(&buf) {
            Ok(pkt) => {
                if let Err(e) = session.on_packet(pkt).await {
                    warn!("[{key}] session error: {e}");
                }
            }
            Err(e) => {
                warn!("[{key}] malformed packet: {e}");
                let _ = session.fail(ErrorCode::IllegalOp, "malformed packet").await;
            }
        }

        if session.is_terminal() {
            self.log_completion(key, session);
            sessions.remove(&key);
        }
    }

    async fn handle_timeouts(&self, sessions: &mut HashMap<SocketAddr, Session>) {
        let now = time::Instant::now();
        let expired: Vec<SocketAddr> = sessions
            .iter()
            .filter(|(_, s)| s.deadline() <= now)
            .map(|(k, _)| *k)
            .collect();

        for key in expired {
            if let Some(session) = sessions.get_mut(&key) {
                if session.on_timeout().await.is_err() || session.is_terminal() {
                    self.log_completion(key, session);
                    sessions.remove(&key);
                }
            }
        }
    }

    fn log_completion(&self, addr: SocketAddr, session: &Session) {
        let m = session.metrics();
        match session.state() {
            State::Done => info!(
                "[{addr}] transfer complete: {} bytes, {} duplicates, {} resent bytes",
                m.bytes, m.dupcount, m.resent_bytes
            ),
            _ => warn!(
                "[{addr}] transfer failed after {} bytes, {} duplicates",
                m.bytes, m.dupcount
            ),
        }
    }
}

/// The dispatcher's event loop, ready to run. Obtained from
/// [`Server::serve_with_handle`] alongside a [`ShutdownHandle`] that a
/// caller can hold onto — typically across a `tokio::spawn` — to signal
/// shutdown while [`Running::run`] is in flight.
pub struct Running {
    server: Server,
    listen_sock: UdpSocket,
    cancel: CancellationToken,
    graceful: Arc<AtomicBool>,
    running_flag: Arc<AtomicBool>,
}

impl Running {
    /// Drives the single `tokio::select!` loop (spec §4.4/§5) until
    /// immediate or graceful shutdown. Graceful shutdown only exits once
    /// every in-flight session has reached DONE or FAILED.
    pub async fn run(self) -> Result<(), Error> {
        let Running {
            server,
            listen_sock,
            cancel,
            graceful,
            running_flag,
        } = self;

        let mut sessions: HashMap<SocketAddr, Session> = HashMap::new();
        let mut listen_buf = vec![0u8; 65507];

        loop {
            let accepting = !graceful.load(Ordering::SeqCst);

            let mut recvs = FuturesUnordered::new();
            for (key, session) in sessions.iter() {
                let key = *key;
                recvs.push(async move { (key, session.recv().await) });
            }

            let tick_deadline = sessions
                .values()
                .map(|s| s.deadline())
                .min()
                .unwrap_or_else(|| time::Instant::now() + time::Duration::from_secs(1));

            let event = tokio::select! {
                biased;

                _ = cancel.cancelled() => Event::Immediate,

                res = listen_sock.recv_from(&mut listen_buf), if accepting => {
                    match res {
                        Ok((n, addr)) => Event::NewRequest(addr, listen_buf[..n].to_vec()),
                        Err(e) => {
                            warn!("failed to read listening socket: {e}");
                            continue;
                        }
                    }
                }

                Some((key, result)) = recvs.next(), if !recvs.is_empty() => {
                    Event::Inbound(key, result)
                }

                _ = time::sleep_until(tick_deadline), if !sessions.is_empty() => Event::Tick,
            };
            drop(recvs);

            match event {
                Event::Immediate => {
                    info!("immediate shutdown: abandoning {} session(s)", sessions.len());
                    break;
                }
                Event::NewRequest(addr, buf) => {
                    if sessions.contains_key(&addr) {
                        trace!("[{addr}] duplicate initial packet, existing session handles it");
                        continue;
                    }
                    server.accept(&mut sessions, addr, &buf).await;
                }
                Event::Inbound(key, result) => {
                    server.handle_inbound(&mut sessions, key, result).await;
                }
                Event::Tick => {
                    server.handle_timeouts(&mut sessions).await;
                }
            }

            if graceful.load(Ordering::SeqCst) && sessions.is_empty() {
                info!("graceful shutdown complete");
                break;
            }
        }

        running_flag.store(false, Ordering::SeqCst);
        Ok(())
    }
}
