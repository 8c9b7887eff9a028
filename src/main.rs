use clap::Parser;
use std::path::PathBuf;
use xserver_rs::bootstrap::hooks::{flush_tracing, init_tracing, LogSettings};
use xserver_rs::consumer::handler_fn;
use xserver_rs::server::{ConsumerServer, Server};

#[derive(Parser)]
#[command(name = "xserver-rs")]
#[command(about = "Kafka and RocketMQ consumer server", long_about = None)]
struct Cli {
    /// Directory holding mq.json (defaults to conf/consumer)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    /// Emit JSON log records
    #[arg(long)]
    json_logs: bool,

    /// Export spans over OTLP, configured from OTEL_* variables
    #[cfg(feature = "telemetry")]
    #[arg(long)]
    otlp: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut server = ConsumerServer::new(cli.config);
    server.add_start_hook(init_tracing(LogSettings {
        debug: cli.debug,
        json: cli.json_logs,
        #[cfg(feature = "telemetry")]
        telemetry: cli.otlp.then(xserver_rs::telemetry::TelemetryConfig::from_env),
    }));
    server.add_stop_hook(flush_tracing());

    // Topics configured with "handler": "log" print what they receive
    server.add_handler(
        "log",
        handler_fn(|topic, payload, extra| {
            tracing::info!(
                target: "xserver.handler.log",
                topic,
                bytes = payload.len(),
                ?extra,
                "{}",
                String::from_utf8_lossy(payload)
            );
            Ok(())
        }),
    );

    server.serve().await?;
    Ok(())
}
