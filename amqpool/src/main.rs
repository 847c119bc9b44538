use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use amqpool::config::{Cli, Config, LogLevel};
use amqpool::metrics::{MetricsSink, NoopSink, StatsdSink};
use amqpool::pool::UpstreamPool;
use amqpool::server::Server;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let max_level = match config.log_level {
        LogLevel::Info => Level::INFO,
        LogLevel::Debug => Level::DEBUG,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(max_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .expect("setting default subscriber failed");

    let metrics: Arc<dyn MetricsSink> = match &config.statsd {
        Some((host, port)) => match StatsdSink::new(host, *port) {
            Ok(sink) => Arc::new(sink),
            Err(err) => {
                eprintln!("cannot reach statsd at {host}:{port}: {err}");
                std::process::exit(1);
            }
        },
        None => Arc::new(NoopSink),
    };

    let pool = Arc::new(UpstreamPool::new(
        config.upstream.clone(),
        config.idle_connection_timeout,
        Arc::clone(&metrics),
    ));
    let reaper_token = CancellationToken::new();
    let reaper = pool.spawn_reaper(reaper_token.clone());

    let server = Arc::new(Server::new(config, Arc::clone(&pool), metrics));
    tokio::spawn(shutdown_signals(Arc::clone(&server)));

    if let Err(err) = server.listen().await {
        error!(?err, "listener failed");
        std::process::exit(1);
    }

    // the listener is gone; block until the last client session is too
    server.wait_for_clients().await;

    reaper_token.cancel();
    let _ = reaper.await;
    pool.close_all().await;
    info!("shutdown complete");
}

/// First SIGINT/SIGTERM stops the listener; a second one disconnects every
/// remaining client.
async fn shutdown_signals(server: Arc<Server>) {
    let mut interrupt = signal(SignalKind::interrupt()).expect("installing SIGINT handler failed");
    let mut terminate = signal(SignalKind::terminate()).expect("installing SIGTERM handler failed");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    info!("shutdown requested; draining existing clients");
    server.stop_accepting_clients();

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
    info!("second signal; disconnecting clients");
    server.disconnect_clients().await;
}
