// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use opentelemetry::global;
use opentelemetry_sdk::metrics::SdkMeterProvider;
use prometheus::Registry;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use tailmet::init::args::Args;
use tailmet::init::{start_tailer, TailerSetup};
use tailmet::listener::Listener;
use tailmet::tailer::{BufferedTailer, ErrorKind, TailError};
use tailmet::telemetry::metrics_server::MetricsServer;
use tailmet::telemetry::{BufferLoadObserver, SelfMonitor};

fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = args.validate() {
        eprintln!("configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Prometheus registry backing the scrape endpoint; the opentelemetry
    // meter provider writes into it.
    let registry = Registry::new();
    let exporter = match opentelemetry_prometheus::exporter()
        .with_registry(registry.clone())
        .build()
    {
        Ok(exporter) => exporter,
        Err(e) => {
            error!(error = %e, "failed to build metrics exporter");
            return ExitCode::FAILURE;
        }
    };
    let provider = SdkMeterProvider::builder().with_reader(exporter).build();
    global::set_meter_provider(provider);

    // Bind early so a bad listen address fails before any tailing starts.
    let listener = match Listener::bind(args.listen) {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, "failed to bind scrape endpoint");
            return ExitCode::FAILURE;
        }
    };

    let setup = match start_tailer(&args) {
        Ok(setup) => setup,
        Err(e) => {
            error!(error = %e, "failed to start tailer");
            return ExitCode::FAILURE;
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "failed to start runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(args, registry, listener, setup)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting with error");
            ExitCode::FAILURE
        }
    }
}

async fn run(
    args: Args,
    registry: Registry,
    listener: Listener,
    setup: TailerSetup,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let TailerSetup {
        tailer,
        webhook,
        position_store,
    } = setup;

    let monitor = Arc::new(SelfMonitor::new());
    let buffered = Arc::new(BufferedTailer::new(
        tailer,
        args.max_lines_in_buffer,
        Arc::new(BufferLoadObserver::new()),
    ));

    // Consumer drains the fan-in buffer. Metric extraction hangs off this
    // stream; the exporter itself only counts.
    let consumer = {
        let buffered = buffered.clone();
        let monitor = monitor.clone();
        std::thread::Builder::new()
            .name("tailmet-consumer".into())
            .spawn(move || {
                while let Some(line) = buffered.pop() {
                    monitor.lines.add(1, &[]);
                    tracing::trace!(path = %line.path.display(), text = %line.text, "line");
                }
            })?
    };

    let cancel = CancellationToken::new();
    let server = MetricsServer::new(registry, args.metrics_path.as_str(), webhook);
    let server_cancel = cancel.clone();
    let mut server_task =
        tokio::spawn(async move { server.serve(listener, server_cancel).await });

    let mut errors = buffered.errors();
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    info!(listen = %args.listen, metrics_path = %args.metrics_path, "tailmet started");

    let result: Result<(), Box<dyn std::error::Error + Send + Sync>> = loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT, shutting down");
                break Ok(());
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down");
                break Ok(());
            }
            maybe_err = errors.next() => match maybe_err {
                Some(err) => {
                    monitor.tailer_errors.add(1, &[]);
                    log_tail_error(&err);
                }
                // error channel closed: the input has finished
                None => {
                    info!("input finished");
                    break Ok(());
                }
            },
            res = &mut server_task => {
                break match res {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(e),
                    Err(e) => Err(e.into()),
                };
            }
        }
    };

    // Orderly shutdown: close the tailer (stops every reader), drain the
    // consumer, flush positions, then stop the server.
    let closer = buffered.clone();
    tokio::task::spawn_blocking(move || closer.close()).await?;
    tokio::task::spawn_blocking(move || {
        let _ = consumer.join();
    })
    .await?;
    if let Some(store) = position_store {
        tokio::task::spawn_blocking(move || store.stop()).await?;
    }
    cancel.cancel();
    if !server_task.is_finished() {
        let _ = server_task.await;
    }

    info!("tailmet stopped");
    result
}

/// Structured error records carry their cause and field map; everything else
/// is logged unstructured.
fn log_tail_error(err: &TailError) {
    let kind = match err.kind() {
        ErrorKind::FileNotFound => "file_not_found",
        ErrorKind::DirectoryNotFound => "directory_not_found",
        ErrorKind::Unspecified => "unspecified",
    };
    if err.fields().is_empty() {
        error!(kind, cause = ?err.cause(), "{}", err);
    } else {
        error!(kind, cause = ?err.cause(), fields = ?err.fields(), "{}", err);
    }
}
