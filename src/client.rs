//! Client: one RRQ/WRQ transfer per `Client`, driven synchronously on the
//! calling task (spec §5 — no background task, no shared state between
//! clients in the same process).

use super::error::Error;
use super::file;
use super::options::Options;
use super::packet;
use super::session::{Data, Role, Session, State};
use super::{DataSink, DataSource, ErrorCode, Metrics, Observer};
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio::time;

pub struct ClientConfig {
    pub remote_addr: SocketAddr,
    pub local_addr: Option<SocketAddr>,
    pub mode: String,
    pub options: Options,
    pub max_retries: u32,
    pub observer: Option<Observer>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            remote_addr: "127.0.0.1:69".parse().unwrap(),
            local_addr: None,
            mode: "octet".to_string(),
            options: Options::default(),
            max_retries: 3,
            observer: None,
        }
    }
}

pub struct Client {
    config: ClientConfig,
}

impl Client {
    pub fn new(config: ClientConfig) -> Client {
        Client { config }
    }

    /// Downloads `remote_file` into `sink`.
    pub async fn get(&self, remote_file: &str, sink: DataSink) -> Result<Metrics, Error> {
        let writer = file::sink_writer(sink, true)?;
        let sock = self.bind().await?;
        let mut session = Session::new(
            sock,
            self.config.remote_addr,
            Role::ClientDownload,
            self.config.mode.clone(),
            self.config.options.clone(),
            Data::Writer(writer),
            self.config.observer.clone(),
            self.config.max_retries,
        );
        session.send_request(remote_file, true).await?;
        self.drive(&mut session).await
    }

    /// Uploads `source` to `remote_file`.
    pub async fn put(&self, source: DataSource, remote_file: &str) -> Result<Metrics, Error> {
        let mut options = self.config.options.clone();
        if let DataSource::Path(path) = &source {
            let _ = options.set_tsize(path);
        }

        let reader = file::source_reader(source)?;
        let sock = self.bind().await?;
        let mut session = Session::new(
            sock,
            self.config.remote_addr,
            Role::ClientUpload,
            self.config.mode.clone(),
            options,
            Data::Reader(reader),
            self.config.observer.clone(),
            self.config.max_retries,
        );
        session.send_request(remote_file, false).await?;
        self.drive(&mut session).await
    }

    async fn bind(&self) -> Result<UdpSocket, Error> {
        let addr = self
            .config
            .local_addr
            .unwrap_or_else(|| "0.0.0.0:0".parse().unwrap());
        Ok(UdpSocket::bind(addr).await?)
    }

    async fn drive(&self, session: &mut Session) -> Result<Metrics, Error> {
        while !session.is_terminal() {
            let remaining = session
                .deadline()
                .saturating_duration_since(time::Instant::now());

            match time::timeout(remaining, session.recv()).await {
                Ok(Ok((src, buf))) => {
                    if session.state() == State::Init {
                        // First reply: this is where we learn the server's
                        // ephemeral TID.
                        session.set_peer_addr(src);
                    } else if src != session.peer_addr() {
                        session.reply_unknown_tid(src).await?;
                        continue;
                    }

                    match packet::decode(&buf) {
                        Ok(pkt) => session.on_packet(pkt).await?,
                        Err(_) => {
                            let _ = session.fail(ErrorCode::IllegalOp, "malformed packet").await;
                        }
                    }
                }
                Ok(Err(e)) => return Err(e),
                Err(_elapsed) => {
                    session.on_timeout().await?;
                }
            }
        }

        match session.state() {
            State::Done => Ok(session.metrics().clone()),
            _ => Err(Error::ProtocolViolation("transfer did not complete")),
        }
    }
}
