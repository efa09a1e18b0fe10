//! `tftpd` — serves a directory tree over TFTP (spec §4.4/§6).

use clap::Parser;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use tftp::config;
use tftp::error::Error;
use tftp::options::OptionBuilder;
use tftp::server::{Server, ServerConfig};

#[derive(Parser)]
#[command(name = "tftpd", version, about = "TFTP server (RFC 1350, RFC 2347/2348/2349)")]
struct Cli {
    /// Address to bind the listening socket to.
    #[arg(short = 'i', long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    bind: IpAddr,

    #[arg(short = 'p', long, default_value_t = 69)]
    port: u16,

    /// Directory served as the TFTP root.
    #[arg(short = 'r', long, default_value = ".")]
    root: PathBuf,

    /// Upper bound offered to clients negotiating blksize (RFC 2348).
    #[arg(short = 'b', long)]
    blksize: Option<u16>,

    /// Timeout offered to clients negotiating timeout (RFC 2349).
    #[arg(short = 't', long)]
    timeout: Option<u8>,

    /// Honor tsize requests (RFC 2349).
    #[arg(long)]
    tsize: bool,

    #[arg(long, default_value_t = 3)]
    retries: u32,

    /// Allow WRQ to overwrite an existing file instead of failing ERROR(6).
    #[arg(long)]
    allow_overwrite: bool,

    /// Optional TOML configuration file; overrides the flags above.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let file_config = cli.config.as_deref().map(config::load).transpose()?;

    let listen_ip = file_config.as_ref().map_or(cli.bind, |c| c.bind_addr);
    let listen_port = file_config.as_ref().map_or(cli.port, |c| c.bind_port);
    let root = file_config
        .as_ref()
        .map_or_else(|| cli.root.clone(), |c| c.root.clone());
    let max_retries = file_config.as_ref().map_or(cli.retries, |c| c.retries);
    let allow_overwrite = file_config
        .as_ref()
        .map_or(cli.allow_overwrite, |c| c.allow_overwrite);
    let blksize = cli
        .blksize
        .or_else(|| file_config.as_ref().and_then(|c| c.default_blksize));
    let timeout = cli
        .timeout
        .or_else(|| file_config.as_ref().and_then(|c| c.timeout));

    let mut builder = OptionBuilder::default();
    if let Some(blksize) = blksize {
        builder = builder.blksize(blksize);
    }
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if cli.tsize {
        builder = builder.tsize();
    }

    let server = Server::new(ServerConfig {
        listen_addr: SocketAddr::new(listen_ip, listen_port),
        root,
        limits: builder.build(),
        max_retries,
        allow_overwrite,
        dyn_file_func: None,
        upload_open: None,
        observer: None,
    })?;

    let (handle, running) = server.serve_with_handle().await?;
    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("ctrl-c received, shutting down gracefully");
            shutdown.stop_graceful();
        }
    });

    running.run().await
}
