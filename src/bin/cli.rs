use clap::{Parser, Subcommand};
use kvconf::sdk::{self, ServiceConfig};
use serde_json::Value;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Store location as <type>.<protocol>://host:port. Defaults to KVCONF_PROVIDER_URL.
    #[arg(short, long)]
    url: Option<String>,

    /// Namespace root of the service. Defaults to KVCONF_BASE_PATH.
    #[arg(short, long)]
    base_path: Option<String>,

    /// Access token. Defaults to KVCONF_ACCESS_TOKEN.
    #[arg(short, long)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Alive,
    Has { sub_path: Option<String> },
    Get { key: String },
    Put { key: String, value: String },
    PutMap {
        json: String,
        #[arg(long)]
        overwrite: bool,
    },
    Dump,
    Watch { sub_path: Option<String> },
}

fn service_config(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut config = match &cli.url {
        Some(url) => {
            let mut config = ServiceConfig::default();
            config.populate_from_url(url)?;
            config
        }
        None => sdk::from_env()?,
    };
    if let Some(base_path) = &cli.base_path {
        config.base_path = base_path.clone();
    }
    if let Some(token) = &cli.token {
        config.access_token = Some(token.clone());
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let client = sdk::new_configuration_client(service_config(&cli)?)?;

    match cli.command {
        Commands::Alive => {
            println!("{}", client.is_alive().await);
        }
        Commands::Has { sub_path } => {
            let found = match sub_path {
                Some(sub) => client.has_sub_configuration(&sub).await?,
                None => client.has_configuration().await?,
            };
            println!("{}", found);
        }
        Commands::Get { key } => {
            let value = client.get_configuration_value(&key).await?;
            println!("{}", String::from_utf8_lossy(&value));
        }
        Commands::Put { key, value } => {
            client.put_configuration_value(&key, value.as_bytes()).await?;
            println!("OK");
        }
        Commands::PutMap { json, overwrite } => {
            let map = match serde_json::from_str::<Value>(&json)? {
                Value::Object(map) => map,
                _ => anyhow::bail!("put-map expects a JSON object"),
            };
            client.put_configuration_map(&map, overwrite).await?;
            println!("OK");
        }
        Commands::Dump => {
            let tree: Value = client.get_configuration().await?;
            println!("{}", serde_json::to_string_pretty(&tree)?);
        }
        Commands::Watch { sub_path } => {
            let (updates_tx, mut updates) = mpsc::channel::<Value>(16);
            let (errors_tx, mut errors) = mpsc::channel(16);
            client.watch_for_changes(updates_tx, errors_tx, sub_path.as_deref().unwrap_or(""));

            loop {
                tokio::select! {
                    Some(update) = updates.recv() => println!("{}", serde_json::to_string_pretty(&update)?),
                    Some(err) = errors.recv() => eprintln!("watch error: {}", err),
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
            client.stop_watching();
        }
    }

    Ok(())
}
