//! Process entry point: parses CLI args, wires up [`bunbase::state::AppState`], and serves the
//! HTTP API until an interrupt or termination signal arrives.

use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::Parser;
use tokio::signal;

use bunbase::constants::{
  DEFAULT_DB_PATH, DEFAULT_PORT, DEFAULT_STORAGE_DIR, REALTIME_INACTIVITY_TIMEOUT_SECS,
  REALTIME_SWEEP_INTERVAL_SECS,
};
use bunbase::error;
use bunbase::routes;
use bunbase::state::AppState;

/// Command line arguments for bunbase's server binary.
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
struct Args {
  /// TCP port the HTTP server binds to.
  #[arg(long, env, default_value_t = DEFAULT_PORT)]
  port: u16,

  /// Path to the SQLite database file.
  #[arg(long, env, default_value = DEFAULT_DB_PATH)]
  db: PathBuf,

  /// Directory uploaded files are persisted under.
  #[arg(long, env, default_value = DEFAULT_STORAGE_DIR)]
  storage_dir: PathBuf,

  /// Secret used to sign and verify bearer tokens. Must be kept stable across restarts or every
  /// issued token is invalidated.
  #[arg(long, env)]
  jwt_secret: String,

  /// Domain used to compose the bootstrap admin's email (`admin@<domain>`).
  #[arg(long, env, default_value = "localhost")]
  admin_domain: String,

  /// Disables redaction of internal error details in HTTP responses.
  #[arg(long, env)]
  dev: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .init();

  let args = match Args::try_parse() {
    Ok(args) => args,
    Err(err) => match err.kind() {
      ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
        let _ = err.print();
        std::process::exit(0);
      }
      _ => {
        eprintln!("{err}");
        std::process::exit(1);
      }
    },
  };
  error::set_dev_mode(args.dev);

  let conn = bunbase_sqlite::connect_sqlite(Some(args.db.clone())).await?;
  let state = AppState::new(conn, &args.jwt_secret, args.storage_dir.clone()).await?;
  state.auth().bootstrap_initial_admin(&args.admin_domain).await?;

  let sweep_realtime = state.realtime().clone();
  tokio::spawn(async move {
    let mut interval = tokio::time::interval(std::time::Duration::from_secs(REALTIME_SWEEP_INTERVAL_SECS));
    loop {
      interval.tick().await;
      sweep_realtime.sweep(REALTIME_INACTIVITY_TIMEOUT_SECS);
    }
  });

  let app = routes::router(state);
  let addr = format!("0.0.0.0:{}", args.port);
  let listener = tokio::net::TcpListener::bind(&addr).await?;
  log::info!("listening on {addr}");

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal())
    .await?;

  return Ok(());
}

async fn shutdown_signal() {
  let ctrl_c = async {
    signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
  };

  #[cfg(unix)]
  let terminate = async {
    signal::unix::signal(signal::unix::SignalKind::terminate())
      .expect("failed to install signal handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {
      println!("Received Ctrl+C. Shutting down gracefully.");
    },
    _ = terminate => {
      println!("Received termination. Shutting down gracefully.");
    },
  }
}
