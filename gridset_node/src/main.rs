//! Gridset member executable.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use gridset::{
    logger_init, pf_error, pf_info, pf_warn, GridConfig, GridError, GridNode,
    TcpTransport, Transport, ME,
};
use log::{self, LevelFilter};
use tokio::runtime::Builder;
use tokio::sync::watch;

/// Command line arguments definition.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct CliArgs {
    /// Address this member listens on for peer traffic.
    #[arg(short, long, default_value_t = SocketAddr::from(([127, 0, 0, 1], 5701)))]
    bind_addr: SocketAddr,

    /// Static initial member list, including or excluding this member
    /// (e.g., '-m host1:5701 -m host2:5701').
    #[arg(short, long)]
    members: Vec<SocketAddr>,

    /// Path to a TOML configuration file; defaults are used if absent.
    #[arg(short, long)]
    config: Option<String>,

    /// Connect attempts to a peer before it is deemed unreachable.
    #[arg(long, default_value_t = 10)]
    connect_retries: u8,

    /// Number of tokio worker threads.
    #[arg(long, default_value_t = 8)]
    threads: usize,
}

impl CliArgs {
    /// Sanitize command line arguments, return `Ok(())` on success or
    /// `Err(GridError)` on any error.
    fn sanitize(&self) -> Result<(), GridError> {
        if self.bind_addr.port() <= 1024 {
            return Err(GridError::msg(format!(
                "invalid bind port {}",
                self.bind_addr.port()
            )));
        }
        if self.connect_retries == 0 {
            return Err(GridError::msg("connect_retries must be positive"));
        }
        if self.threads < 2 {
            return Err(GridError::msg(format!(
                "invalid number of threads {}",
                self.threads
            )));
        }

        // check for duplicate members
        let mut member_set = HashSet::new();
        for m in self.members.iter() {
            if !member_set.insert(*m) {
                return Err(GridError::msg(format!(
                    "duplicate member address {} given",
                    m
                )));
            }
        }
        Ok(())
    }

    /// Reads in the configuration file if one is given.
    fn load_config(&self) -> Result<GridConfig, GridError> {
        let text = match &self.config {
            Some(path) => Some(std::fs::read_to_string(path)?),
            None => None,
        };
        GridConfig::from_toml(text.as_deref())
    }
}

/// Actual main function of a Gridset member.
fn node_main() -> Result<(), GridError> {
    // read in and parse command line arguments
    let args = CliArgs::parse();
    args.sanitize()?;
    let config = args.load_config()?;
    let _ = ME.set(args.bind_addr.to_string());

    // set up termination signals handler
    let (tx_term, mut rx_term) = watch::channel(false);
    ctrlc::set_handler(move || {
        if let Err(e) = tx_term.send(true) {
            pf_error!("error sending to term channel: {}", e);
        }
    })
    .map_err(GridError::msg)?;

    let log_level = log::max_level();
    {
        // create tokio multi-threaded runtime
        let runtime = Builder::new_multi_thread()
            .enable_all()
            .worker_threads(args.threads)
            .thread_name("tokio-worker-node")
            .build()?;

        runtime.block_on(async move {
            let (transport, inbox) =
                TcpTransport::new_and_setup(args.bind_addr, args.connect_retries)
                    .await?;
            let transport: Arc<dyn Transport> = Arc::new(transport);
            let node =
                GridNode::start(config, transport, inbox, &args.members).await?;

            // serve until terminated
            while !*rx_term.borrow() {
                if rx_term.changed().await.is_err() {
                    pf_warn!("term channel closed");
                    break;
                }
            }
            pf_info!("termination signal received, shutting down");
            node.shutdown().await;

            // suppress logging before dropping the runtime to avoid spurious
            // error messages
            log::set_max_level(LevelFilter::Off);

            Ok::<(), GridError>(()) // give type hint for this async closure
        })?;
    } // drop the runtime here

    log::set_max_level(log_level);
    Ok(())
}

/// Main function of a Gridset member.
fn main() -> ExitCode {
    logger_init();

    if let Err(ref e) = node_main() {
        pf_error!("node_main exited: {}", e);
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod arg_tests {
    use super::*;

    fn args() -> Result<CliArgs, GridError> {
        Ok(CliArgs {
            bind_addr: "127.0.0.1:5701".parse()?,
            members: vec!["127.0.0.1:5701".parse()?, "127.0.0.1:5702".parse()?],
            config: None,
            connect_retries: 10,
            threads: 2,
        })
    }

    #[test]
    fn sanitize_valid() -> Result<(), GridError> {
        assert_eq!(args()?.sanitize(), Ok(()));
        Ok(())
    }

    #[test]
    fn sanitize_invalid_port() -> Result<(), GridError> {
        let mut args = args()?;
        args.bind_addr = "127.0.0.1:1023".parse()?;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_invalid_threads() -> Result<(), GridError> {
        let mut args = args()?;
        args.threads = 1;
        assert!(args.sanitize().is_err());
        Ok(())
    }

    #[test]
    fn sanitize_duplicate_member() -> Result<(), GridError> {
        let mut args = args()?;
        args.members.push("127.0.0.1:5702".parse()?);
        assert_eq!(
            args.sanitize(),
            Err(GridError::msg("duplicate member address 127.0.0.1:5702 given"))
        );
        Ok(())
    }

    #[test]
    fn default_config_without_file() -> Result<(), GridError> {
        assert_eq!(args()?.load_config()?, GridConfig::default());
        Ok(())
    }
}
