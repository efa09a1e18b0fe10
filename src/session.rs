//! Per-transfer state machine (spec §3/§4.2), shared by all four roles.
//!
//! A `Session` owns its own ephemeral UDP socket and the open file handle
//! (or stdio stream) it reads from or writes to. It never spawns a task or
//! reaches back into whatever created it — the dispatcher (or the client's
//! caller) drives it by feeding it packets and timeouts and reading its
//! `state()` back out, the "arena+index" shape from the design notes.

use super::error::Error;
use super::options::Options;
use super::packet::Packet;
use super::{ErrorCode, Metrics, Observer, HEADER_LEN};
use bytes::Bytes;
use log::{trace, warn};
use std::io::{Read, Write};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    ServerRead,
    ServerWrite,
    ClientDownload,
    ClientUpload,
}

impl Role {
    fn is_sender(self) -> bool {
        matches!(self, Role::ServerRead | Role::ClientUpload)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    Init,
    SentOack,
    WaitingAck,
    ReceivingData,
    Done,
    Failed,
}

pub enum Data {
    Reader(Box<dyn Read + Send>),
    Writer(Box<dyn Write + Send>),
}

pub struct Session {
    sock: UdpSocket,
    peer_addr: SocketAddr,
    role: Role,
    mode: String,
    options: Options,
    block: u16,
    rollover: u32,
    final_sent: bool,
    last_packet: Bytes,
    state: State,
    retries: u32,
    max_retries: u32,
    timeout: Duration,
    deadline: Instant,
    metrics: Metrics,
    observer: Option<Observer>,
    data: Data,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sock: UdpSocket,
        peer_addr: SocketAddr,
        role: Role,
        mode: String,
        options: Options,
        data: Data,
        observer: Option<Observer>,
        max_retries: u32,
    ) -> Session {
        let timeout = Duration::from_secs(options.timeout());
        Session {
            sock,
            peer_addr,
            role,
            mode,
            options,
            block: 0,
            rollover: 0,
            final_sent: false,
            last_packet: Bytes::new(),
            state: State::Init,
            retries: 0,
            max_retries,
            timeout,
            deadline: Instant::now() + timeout,
            metrics: Metrics::started(),
            observer,
            data,
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, addr: SocketAddr) {
        self.peer_addr = addr;
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Done | State::Failed)
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    fn reset_deadline(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    fn notify(&self, pkt: &Packet) {
        if matches!(pkt, Packet::Data { .. } | Packet::Error { .. }) {
            if let Some(observer) = &self.observer {
                observer(pkt);
            }
        }
    }

    async fn send(&mut self, pkt: Packet) -> Result<(), Error> {
        self.notify(&pkt);
        let encoded = super::packet::encode(&pkt);
        self.sock.send_to(&encoded, self.peer_addr).await?;
        self.last_packet = encoded;
        self.reset_deadline();
        self.retries = 0;
        Ok(())
    }

    /// Re-sends the exact bytes of the last outbound packet: used both for
    /// duplicate-request resends and for timeout-driven retransmission.
    /// Never invokes the observer again — it already saw this packet once.
    async fn resend(&mut self) -> Result<(), Error> {
        self.sock.send_to(&self.last_packet, self.peer_addr).await?;
        self.reset_deadline();
        Ok(())
    }

    pub(crate) async fn fail(&mut self, code: ErrorCode, message: &str) -> Result<(), Error> {
        let pkt = Packet::Error {
            code: code as u16,
            message: message.to_string(),
        };
        if let Err(e) = self.send(pkt).await {
            warn!("[{}] failed to send error reply: {e}", self.peer_addr);
        }
        self.state = State::Failed;
        Ok(())
    }

    /// Replies ERROR(5) to a datagram from an address other than the
    /// session's established peer TID (testable property 3). Does not touch
    /// session state: the real transfer continues unaffected.
    pub async fn reply_unknown_tid(&self, from: SocketAddr) -> Result<(), Error> {
        let pkt = Packet::Error {
            code: ErrorCode::UnknownTid as u16,
            message: "unknown transfer id".to_string(),
        };
        let encoded = super::packet::encode(&pkt);
        self.sock.send_to(&encoded, from).await?;
        Ok(())
    }

    /// Receives the next datagram addressed to this session's socket.
    pub async fn recv(&self) -> Result<(SocketAddr, Vec<u8>), Error> {
        let mut buf = vec![0u8; self.options.blksize() + HEADER_LEN];
        let (n, addr) = self.sock.recv_from(&mut buf).await?;
        buf.truncate(n);
        Ok((addr, buf))
    }

    /// Sends the server's first reply (OACK, DATA(1), or ACK(0)). Server
    /// sessions never see an `Init` phase: the initial request is already
    /// decoded by the dispatcher before the session exists.
    pub async fn start(&mut self) -> Result<(), Error> {
        match self.role {
            Role::ServerRead => {
                if self.options.has_option() {
                    self.state = State::SentOack;
                    self.send(Packet::Oack {
                        options: self.options.clone(),
                    })
                    .await
                } else {
                    self.send_next_data().await
                }
            }
            Role::ServerWrite => {
                self.state = State::ReceivingData;
                if self.options.has_option() {
                    self.send(Packet::Oack {
                        options: self.options.clone(),
                    })
                    .await
                } else {
                    self.send(Packet::Ack { block: 0 }).await
                }
            }
            _ => unreachable!("start() is server-only; clients call send_request()"),
        }
    }

    /// Sends the client's opening RRQ or WRQ.
    pub async fn send_request(&mut self, filename: &str, is_read: bool) -> Result<(), Error> {
        let pkt = if is_read {
            Packet::Rrq {
                filename: filename.to_string(),
                mode: self.mode.clone(),
                options: self.options.clone(),
            }
        } else {
            Packet::Wrq {
                filename: filename.to_string(),
                mode: self.mode.clone(),
                options: self.options.clone(),
            }
        };
        self.send(pkt).await
    }

    pub async fn on_packet(&mut self, pkt: Packet) -> Result<(), Error> {
        if self.is_terminal() {
            return Ok(());
        }

        match pkt {
            Packet::Error { code, message } => {
                let snapshot = Packet::Error {
                    code,
                    message: message.clone(),
                };
                self.notify(&snapshot);
                warn!(
                    "[{}] peer reported error {}: {}",
                    self.peer_addr, code, message
                );
                self.state = State::Failed;
                Ok(())
            }
            Packet::Oack { options } => self.on_oack(options).await,
            Packet::Ack { block } => self.on_ack(block).await,
            Packet::Data { block, payload } => self.on_data(block, payload).await,
            Packet::Rrq { .. } | Packet::Wrq { .. } => {
                self.fail(ErrorCode::IllegalOp, "unexpected request on an open session")
                    .await
            }
        }
    }

    /// Handles a retransmit timeout: resend the last packet, or fail after
    /// `max_retries` (testable property 7).
    pub async fn on_timeout(&mut self) -> Result<(), Error> {
        if self.is_terminal() {
            return Ok(());
        }

        if self.retries >= self.max_retries {
            warn!(
                "[{}] giving up after {} retries",
                self.peer_addr, self.retries
            );
            self.state = State::Failed;
            return Err(Error::Timeout(self.retries));
        }

        self.retries += 1;
        self.metrics.resent_bytes += self.last_packet.len().saturating_sub(HEADER_LEN) as u64;
        warn!(
            "[{}] timed out waiting for peer, retry {}/{}",
            self.peer_addr, self.retries, self.max_retries
        );
        self.resend().await
    }

    async fn on_oack(&mut self, options: Options) -> Result<(), Error> {
        if self.state != State::Init {
            return self.fail(ErrorCode::IllegalOp, "unexpected OACK").await;
        }

        if self.options.has_unsolicited(&options) || self.options.increases_blksize(&options) {
            return self
                .fail(ErrorCode::OptionNotSupported, "option negotiation failed")
                .await;
        }

        self.options = options;
        self.timeout = Duration::from_secs(self.options.timeout());

        match self.role {
            Role::ClientUpload => self.send_next_data().await,
            Role::ClientDownload => {
                self.state = State::ReceivingData;
                self.send(Packet::Ack { block: 0 }).await
            }
            _ => self.fail(ErrorCode::IllegalOp, "unexpected OACK").await,
        }
    }

    async fn on_ack(&mut self, block: u16) -> Result<(), Error> {
        if !self.role.is_sender() {
            return self.fail(ErrorCode::IllegalOp, "unexpected ACK").await;
        }
        if !matches!(self.state, State::WaitingAck | State::SentOack | State::Init) {
            return Ok(());
        }

        trace!("[{}] received ACK({block})", self.peer_addr);

        if block == self.block {
            if self.final_sent {
                self.state = State::Done;
                self.metrics.end = Some(Instant::now());
                return Ok(());
            }
            return self.send_next_data().await;
        }

        if block == self.block.wrapping_sub(1) {
            // Sorcerer's apprentice: a duplicate ACK must never cause a
            // duplicate DATA.
            self.metrics.dupcount += 1;
            trace!("[{}] duplicate ACK({block}) ignored", self.peer_addr);
            return Ok(());
        }

        self.fail(ErrorCode::IllegalOp, "ACK out of sequence").await
    }

    async fn on_data(&mut self, block: u16, payload: Bytes) -> Result<(), Error> {
        if self.role.is_sender() {
            return self.fail(ErrorCode::IllegalOp, "unexpected DATA").await;
        }
        if !matches!(self.state, State::ReceivingData | State::Init | State::SentOack) {
            return Ok(());
        }

        trace!(
            "[{}] received DATA({block}, {} bytes)",
            self.peer_addr,
            payload.len()
        );

        let expected = self.block.wrapping_add(1);

        if block == expected {
            match &mut self.data {
                Data::Writer(writer) => writer.write_all(&payload)?,
                Data::Reader(_) => unreachable!("receiver role must hold a writer"),
            }

            self.metrics.bytes += payload.len() as u64;
            self.block = expected;
            if self.block == 0 {
                self.rollover = self.rollover.wrapping_add(1);
            }
            self.state = State::ReceivingData;

            let is_final = payload.len() < self.options.blksize();
            self.send(Packet::Ack { block: self.block }).await?;

            if is_final {
                self.state = State::Done;
                self.metrics.end = Some(Instant::now());
            }
            return Ok(());
        }

        if block == self.block {
            // Duplicate of the block we already wrote and ACKed.
            self.metrics.dupcount += 1;
            trace!("[{}] duplicate DATA({block}) ignored", self.peer_addr);
            return self.resend().await;
        }

        self.fail(ErrorCode::IllegalOp, "DATA out of sequence").await
    }

    async fn send_next_data(&mut self) -> Result<(), Error> {
        let blksize = self.options.blksize();
        let mut buf = vec![0u8; blksize];
        let n = match &mut self.data {
            Data::Reader(reader) => reader.read(&mut buf)?,
            Data::Writer(_) => unreachable!("sender role must hold a reader"),
        };
        buf.truncate(n);

        self.block = self.block.wrapping_add(1);
        if self.block == 0 {
            self.rollover = self.rollover.wrapping_add(1);
        }
        self.final_sent = n < blksize;
        self.metrics.bytes += n as u64;
        self.state = State::WaitingAck;

        self.send(Packet::Data {
            block: self.block,
            payload: Bytes::from(buf),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::OptionBuilder;
    use std::io::Cursor;

    async fn sender_session(payload: &'static [u8]) -> Session {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        Session::new(
            sock,
            peer_addr,
            Role::ServerRead,
            "octet".to_string(),
            OptionBuilder::default().blksize(8).build(),
            Data::Reader(Box::new(Cursor::new(payload))),
            None,
            3,
        )
    }

    #[tokio::test]
    async fn duplicate_ack_does_not_resend_data() {
        let mut session = sender_session(b"abcdefghij").await;
        session.start().await.unwrap();
        assert_eq!(1, session.block);
        assert_eq!(0, session.metrics().dupcount);

        session.on_ack(1).await.unwrap();
        assert_eq!(2, session.block);

        // ACK(1) again: a duplicate of the previous block.
        session.on_ack(1).await.unwrap();
        assert_eq!(2, session.block, "must not regress or resend past data");
        assert_eq!(1, session.metrics().dupcount);
    }

    #[tokio::test]
    async fn out_of_sequence_ack_fails_session() {
        let mut session = sender_session(b"abcdefghij").await;
        session.start().await.unwrap();
        session.on_ack(99).await.unwrap();
        assert_eq!(State::Failed, session.state());
    }

    #[tokio::test]
    async fn short_final_data_completes_transfer() {
        let mut session = sender_session(b"abcdefg").await;
        session.start().await.unwrap();
        assert!(session.final_sent);
        session.on_ack(1).await.unwrap();
        assert_eq!(State::Done, session.state());
    }

    async fn receiver_session() -> (Session, std::sync::Arc<std::sync::Mutex<Vec<u8>>>) {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        struct SharedWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let written = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let session = Session::new(
            sock,
            peer_addr,
            Role::ServerWrite,
            "octet".to_string(),
            OptionBuilder::default().blksize(8).build(),
            Data::Writer(Box::new(SharedWriter(written.clone()))),
            None,
            3,
        );
        (session, written)
    }

    #[tokio::test]
    async fn duplicate_data_resent_ack_without_rewrite() {
        let (mut session, written) = receiver_session().await;
        session.start().await.unwrap();

        session
            .on_data(1, Bytes::from_static(b"12345678"))
            .await
            .unwrap();
        assert_eq!(b"12345678".to_vec(), *written.lock().unwrap());

        // Resend of the same block must not append again.
        session
            .on_data(1, Bytes::from_static(b"12345678"))
            .await
            .unwrap();
        assert_eq!(b"12345678".to_vec(), *written.lock().unwrap());
        assert_eq!(1, session.metrics().dupcount);
    }

    #[tokio::test]
    async fn short_data_completes_write_transfer() {
        let (mut session, written) = receiver_session().await;
        session.start().await.unwrap();
        session.on_data(1, Bytes::from_static(b"short")).await.unwrap();
        assert_eq!(State::Done, session.state());
        assert_eq!(b"short".to_vec(), *written.lock().unwrap());
    }

    #[tokio::test]
    async fn retry_bound_fails_after_max_retries() {
        let mut session = sender_session(b"abcdefghij").await;
        session.max_retries = 2;
        session.start().await.unwrap();

        session.on_timeout().await.unwrap();
        assert_eq!(State::WaitingAck, session.state());
        session.on_timeout().await.unwrap();
        assert_eq!(State::WaitingAck, session.state());
        assert!(session.on_timeout().await.is_err());
        assert_eq!(State::Failed, session.state());
    }

    #[tokio::test]
    async fn unknown_tid_gets_error_reply_and_leaves_session_unaffected() {
        let mut session = sender_session(b"abcdefghij").await;
        session.start().await.unwrap();
        assert_eq!(1, session.block);

        let intruder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        session
            .reply_unknown_tid(intruder.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = intruder.recv_from(&mut buf).await.unwrap();
        let pkt = crate::packet::decode(&buf[..n]).unwrap();
        assert!(matches!(
            pkt,
            Packet::Error { code, .. } if code == ErrorCode::UnknownTid as u16
        ));

        // The real transfer's state must be untouched by the stray datagram.
        assert_eq!(1, session.block);
        assert_eq!(State::WaitingAck, session.state());
    }

    #[tokio::test]
    async fn unsolicited_oack_option_fails_session() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let mut session = Session::new(
            sock,
            peer_addr,
            Role::ClientDownload,
            "octet".to_string(),
            OptionBuilder::default().blksize(1024).build(),
            Data::Writer(Box::new(std::io::sink())),
            None,
            3,
        );

        // Server replies with a "timeout" option the client never requested.
        let reply = OptionBuilder::default().blksize(1024).timeout(4).build();
        session.on_oack(reply).await.unwrap();
        assert_eq!(State::Failed, session.state());
    }

    #[tokio::test]
    async fn oack_increasing_blksize_fails_session() {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();
        let mut session = Session::new(
            sock,
            peer_addr,
            Role::ClientDownload,
            "octet".to_string(),
            OptionBuilder::default().blksize(512).build(),
            Data::Writer(Box::new(std::io::sink())),
            None,
            3,
        );

        let reply = OptionBuilder::default().blksize(4096).build();
        session.on_oack(reply).await.unwrap();
        assert_eq!(State::Failed, session.state());
    }

    #[tokio::test]
    async fn block_number_wraps_from_65535_to_zero() {
        let mut session = sender_session(b"0123456789abcdef").await;
        session.start().await.unwrap();
        session.block = 65534;

        // ACK(65534) advances the sender past the wrap point to block 65535,
        // then ACK(65535) must wrap the next emitted block to 0, not 1.
        session.on_ack(65534).await.unwrap();
        assert_eq!(65535, session.block);
        session.on_ack(65535).await.unwrap();
        assert_eq!(0, session.block);
        assert_eq!(1, session.rollover);
    }

    #[tokio::test]
    async fn receiver_accepts_wrapped_block_zero() {
        let (mut session, written) = receiver_session().await;
        session.start().await.unwrap();
        session.block = 65535;

        session.on_data(0, Bytes::from_static(b"12345678")).await.unwrap();
        assert_eq!(0, session.block);
        assert_eq!(1, session.rollover);
        assert_eq!(b"12345678".to_vec(), *written.lock().unwrap());
    }
}
