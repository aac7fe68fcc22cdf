use std::path::PathBuf;

use clap::Parser;
use rowlink::{Connection, ConnectionConfig, Execution};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rowlink")]
#[command(about = "Run one request against a rowlink server", long_about = None)]
struct Args {
    /// TOML file with connection settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// Server port
    #[arg(short, long)]
    port: Option<u16>,

    /// User name for the credential handshake
    #[arg(short, long)]
    user: Option<String>,

    /// Password for the credential handshake
    #[arg(long)]
    password: Option<String>,

    /// Give up if the server sends nothing for this long
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Report generated ids for updates
    #[arg(long)]
    with_ids: bool,

    /// Request text, sent as-is
    request: String,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(ConnectionConfig, String, bool)> {
        let mut config = match &self.config {
            Some(path) => ConnectionConfig::load(path)?,
            None => {
                let mut config = ConnectionConfig::default();
                config.apply_env_overrides()?;
                config
            }
        };

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(user) = self.user {
            config.user = user;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(ms) = self.timeout_ms {
            config.query_timeout_ms = Some(ms);
        }
        Ok((config, self.request, self.with_ids))
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rowlink=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let (config, request, with_ids) = args.into_config()?;
    tracing::debug!("Using {:?}", config);

    let connection = Connection::connect(config).await?;
    let statement = connection.create_statement()?;

    // Ctrl-C cancels the running request instead of killing the process
    let cancel = statement.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Cancelling request");
            cancel.cancel();
        }
    });

    let execution = if with_ids {
        statement.execute_with_ids(&request).await
    } else {
        statement.execute(&request).await
    };

    let outcome = match execution {
        Ok(Execution::Rows(mut cursor)) => {
            if !cursor.column_names().is_empty() {
                println!("{}", cursor.column_names().join("\t"));
            }
            let mut count = 0usize;
            let streamed = loop {
                match cursor.next_row().await {
                    Ok(Some(row)) => {
                        println!("{}", row);
                        count += 1;
                    }
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                }
            };
            tracing::info!("{} row(s)", count);
            streamed
        }
        Ok(Execution::Update { count, ids }) => {
            println!("{} row(s) affected", count);
            if !ids.is_empty() {
                let ids: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
                println!("generated ids: {}", ids.join(", "));
            }
            Ok(())
        }
        Ok(Execution::Command) => {
            println!("OK");
            Ok(())
        }
        Err(e) => Err(e),
    };

    let closed = connection.close().await;
    outcome?;
    closed?;
    Ok(())
}
