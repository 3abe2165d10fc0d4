use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = haproxy_dynconf::cli::Cli::parse();
    if let Err(e) = haproxy_dynconf::cmd::dispatch(cli).await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}
