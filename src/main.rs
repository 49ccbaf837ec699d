use clap::Parser;
use spyglass::{CertAuthority, Error, KeyLogWriter, ProxyConfig, ProxyServer, UpstreamDialer};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> ExitCode {
  let config = ProxyConfig::parse();

  let default_filter = if config.debug { "spyglass=debug" } else { "spyglass=info" };
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
    )
    .with_writer(std::io::stderr)
    .init();

  let key_log = match config.key_log_path() {
    Some(path) => match KeyLogWriter::create(&path) {
      Ok(writer) => Some(Arc::new(writer)),
      Err(e) => {
        tracing::error!("proxy: open key log file {}: {e}", path.display());
        return ExitCode::FAILURE;
      }
    },
    None => None,
  };

  let ca = match CertAuthority::open(&config.ca_path, key_log.clone()) {
    Ok(ca) => Arc::new(ca),
    Err(e) => {
      tracing::error!("proxy: ca setup: {e}");
      return ExitCode::FAILURE;
    }
  };

  let dialer = match UpstreamDialer::from_url(&config.relay_proxy) {
    Ok(dialer) => Arc::new(dialer),
    Err(e) => {
      tracing::error!("proxy: relay proxy: {e}");
      return ExitCode::FAILURE;
    }
  };

  let server = ProxyServer::new(ca, dialer, key_log);
  let mut run = {
    let server = server.clone();
    let addr = config.listen_addr.clone();
    tokio::spawn(async move { server.run(&addr).await })
  };

  tokio::select! {
    _ = tokio::signal::ctrl_c() => {
      tracing::info!("shutting down");
      if let Err(e) = server.shutdown(SHUTDOWN_DEADLINE).await {
        tracing::warn!("proxy: shutdown: {e}");
      }
      match run.await {
        Ok(Ok(())) | Ok(Err(Error::ServerClosed)) => ExitCode::SUCCESS,
        Ok(Err(e)) => {
          tracing::error!("proxy: server: {e}");
          ExitCode::FAILURE
        }
        Err(e) => {
          tracing::error!("proxy: server task: {e}");
          ExitCode::FAILURE
        }
      }
    }
    result = &mut run => match result {
      Ok(Err(e)) => {
        tracing::error!("proxy: server: {e}");
        ExitCode::FAILURE
      }
      _ => ExitCode::SUCCESS,
    }
  }
}
