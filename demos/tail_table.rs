use anyhow::{Context, Result};
use clap::Parser;
use tablestream_sdk::stream::client::LOCAL_BASE_URL;
use tablestream_sdk::{handler_fn, StreamClient, StreamEvent, SubscribeOptions};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "tail_table", about = "Print a table's event timeline in order")]
struct Cli {
    /// Table to follow
    table_id: String,

    /// Game server base URL
    #[arg(long, default_value = LOCAL_BASE_URL)]
    base_url: String,

    /// Resume after this sequence id instead of replaying the full history
    #[arg(long)]
    last_event_id: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let client = StreamClient::new(&cli.base_url).context("invalid base url")?;

    let mut options = SubscribeOptions::new(cli.table_id.clone());
    if let Some(last_event_id) = cli.last_event_id {
        options = options.with_last_event_id(last_event_id);
    }

    let session = client.subscribe_table(options, handler_fn(|event: StreamEvent| async move {
        let payload = serde_json::Value::Object(event.payload);
        if event.sequence_id == 0 {
            println!("      {:<16} {payload}", event.kind);
        } else {
            println!("{:>5} {:<16} {payload}", event.sequence_id, event.kind);
        }
        anyhow::Ok(())
    }))?;

    let mut states = session.watch_state();
    let watcher = tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = *states.borrow_and_update();
            tracing::info!(table_id = %cli.table_id, ?state, "connection state");
        }
    });

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;

    let status = session.status();
    tracing::info!(
        last_event_id = status.last_processed_event_id,
        queued = status.queue_size,
        "stopping"
    );
    session.close();
    watcher.abort();
    Ok(())
}
