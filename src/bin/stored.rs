use std::env;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kvconf::engine::MemStore;
use kvconf::ConfigTree;
use kvconf::server::Router;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(short, long)]
    port: Option<String>,

    /// Token every client must present. Defaults to KVCONF_ACCESS_TOKEN; unset means open access.
    #[arg(long)]
    access_token: Option<String>,

    /// Longest time a watch request is held open, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    wait_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let port = args.port
        .or_else(|| env::var("KVCONF_PORT").ok())
        .unwrap_or_else(|| "7001".to_string());

    let access_token = args.access_token
        .or_else(|| env::var("KVCONF_ACCESS_TOKEN").ok())
        .filter(|t| !t.is_empty());

    let store = Arc::new(
        MemStore::new(ConfigTree::new())
            .with_wait_time(Duration::from_millis(args.wait_ms))
            .with_access_token(access_token),
    );

    let router = Router::new(store);

    println!("Starting kvconf store daemon...");
    println!("kvconf store listening on :{} (TCP)", port);

    tokio::select! {
        res = router.listen(&port) => {
            if let Err(e) = res {
                eprintln!("TCP Server failed: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            println!("\nShutdown signal received. Exiting.");
        }
    }

    Ok(())
}
