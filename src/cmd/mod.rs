//! Subcommand dispatch and execution.
//!
//! The [`dispatch`] function routes the parsed CLI to the appropriate
//! subcommand handler: [`run`], [`validate`], or [`inspect`].
//! Each handler lives in its own submodule.

pub mod inspect;
pub mod run;
pub mod validate;

use std::sync::Arc;
use std::time::Duration;

use crate::cli::{Cli, Commands, SocketArgs};
use crate::error::DynconfError;
use crate::haproxy::{Client, SocketAddress, SocketTransport};

pub async fn dispatch(cli: Cli) -> Result<(), DynconfError> {
    match cli.command {
        Some(Commands::Run(args)) => run::execute(*args).await,
        Some(Commands::Validate(ref args)) => validate::execute(args),
        Some(Commands::Inspect(ref args)) => inspect::execute(args).await,
        None => {
            print_welcome();
            Ok(())
        }
    }
}

/// Control socket client for the `--socket` flags.
pub fn connect(args: &SocketArgs) -> Result<Arc<Client>, DynconfError> {
    let address: SocketAddress = args
        .socket
        .parse()
        .map_err(DynconfError::InvalidSocketAddress)?;
    let transport = SocketTransport::new(address, Duration::from_millis(args.socket_timeout));
    Ok(Arc::new(Client::new(Arc::new(transport))))
}

fn print_welcome() {
    let version = env!("CARGO_PKG_VERSION");
    println!(
        "\n  dynconf v{version}: HAProxy reconfiguration without reloads\n\n  \
         No command provided. To get started:\n\n    \
         dynconf validate state.yaml       Check a desired-state file\n    \
         dynconf run                       Start (auto-detects ./dynconf.yaml)\n    \
         dynconf run -c state.yaml         Start with a specific desired-state file\n    \
         dynconf inspect backends          Query HAProxy through its control socket\n    \
         dynconf --help                    See all commands and options\n"
    );
}
