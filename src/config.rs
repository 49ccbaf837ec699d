//! Run configuration as handed to the proxy core

use clap::Parser;
use std::path::PathBuf;

/// Command line configuration for the proxy.
#[derive(Parser, Debug, Clone)]
#[command(name = "spyglass", version, about = "TLS-intercepting HTTP/HTTPS debugging proxy")]
pub struct ProxyConfig {
  /// HTTP proxy server listen addr
  #[arg(short = 'l', long, default_value = "127.0.0.1:8080")]
  pub listen_addr: String,

  /// CA certificate used to issue leaf certificates
  #[arg(long = "ca", default_value = "~/.mitmproxy/mitmproxy-ca.pem")]
  pub ca_path: String,

  /// Relay to an upstream proxy (socks5/http/https URL, empty for direct)
  #[arg(long = "proxy", default_value = "")]
  pub relay_proxy: String,

  /// Key log file for TLS decryption in wireshark (truncated on start)
  #[arg(long = "keylog", default_value = "")]
  pub key_log_file: String,

  /// Enable debug output
  #[arg(short = 'd', long)]
  pub debug: bool,
}

impl ProxyConfig {
  /// Expanded key log path, `None` when key logging is disabled.
  pub fn key_log_path(&self) -> Option<PathBuf> {
    if self.key_log_file.is_empty() {
      None
    } else {
      Some(expand_home(&self.key_log_file))
    }
  }
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen_addr: "127.0.0.1:8080".to_string(),
      ca_path: "~/.mitmproxy/mitmproxy-ca.pem".to_string(),
      relay_proxy: String::new(),
      key_log_file: String::new(),
      debug: false,
    }
  }
}

/// Expand a leading `~` to the user's home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
  if path == "~" || path.starts_with("~/") {
    if let Ok(home) = std::env::var("HOME") {
      if path == "~" {
        return PathBuf::from(home);
      }
      return PathBuf::from(home).join(&path[2..]);
    }
  }
  PathBuf::from(path)
}
