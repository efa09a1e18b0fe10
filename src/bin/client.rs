//! `tftp` — one RRQ/WRQ transfer per invocation (spec §6).

use clap::{Parser, Subcommand};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use tftp::client::{Client, ClientConfig};
use tftp::error::Error;
use tftp::options::OptionBuilder;
use tftp::{DataSink, DataSource};

#[derive(Parser)]
#[command(name = "tftp", version, about = "TFTP client (RFC 1350, RFC 2347/2348/2349)")]
struct Cli {
    /// Server to connect to.
    host: String,

    #[arg(short = 'p', long, default_value_t = 69)]
    port: u16,

    /// Transfer mode; only "octet" is fully supported.
    #[arg(short = 'm', long, default_value = "octet")]
    mode: String,

    /// Requested blksize (RFC 2348), 8..=65464.
    #[arg(short = 'b', long)]
    blksize: Option<u16>,

    /// Requested timeout in seconds (RFC 2349), 1..=255.
    #[arg(short = 't', long)]
    timeout: Option<u8>,

    /// Ask for (get) or announce (put) the transfer size (RFC 2349).
    #[arg(long)]
    tsize: bool,

    /// Local address to bind the client's ephemeral socket to.
    #[arg(long)]
    localip: Option<IpAddr>,

    #[command(subcommand)]
    operation: Operation,
}

#[derive(Subcommand)]
enum Operation {
    /// Download REMOTE_FILE from the server into LOCAL_FILE ("-" for stdout).
    Get {
        remote_file: String,
        local_file: String,
    },
    /// Upload LOCAL_FILE ("-" for stdin) to the server as REMOTE_FILE.
    Put {
        local_file: String,
        remote_file: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let mut builder = OptionBuilder::default();
    if let Some(blksize) = cli.blksize {
        builder = builder.blksize(blksize);
    }
    if let Some(timeout) = cli.timeout {
        builder = builder.timeout(timeout);
    }
    if cli.tsize {
        builder = builder.tsize();
    }

    let remote_addr: SocketAddr = format!("{}:{}", cli.host, cli.port).parse()?;
    let local_addr = cli.localip.map(|ip| SocketAddr::new(ip, 0));

    let client = Client::new(ClientConfig {
        remote_addr,
        local_addr,
        mode: cli.mode,
        options: builder.build(),
        max_retries: 3,
        observer: None,
    });

    match cli.operation {
        Operation::Get {
            remote_file,
            local_file,
        } => {
            let sink = if local_file == "-" {
                DataSink::Stdout
            } else {
                DataSink::Path(PathBuf::from(local_file))
            };
            let metrics = client.get(&remote_file, sink).await?;
            log::info!("downloaded {} bytes", metrics.bytes);
        }
        Operation::Put {
            local_file,
            remote_file,
        } => {
            let source = if local_file == "-" {
                DataSource::Stdin
            } else {
                DataSource::Path(PathBuf::from(local_file))
            };
            let metrics = client.put(source, &remote_file).await?;
            log::info!("uploaded {} bytes", metrics.bytes);
        }
    }

    Ok(())
}
