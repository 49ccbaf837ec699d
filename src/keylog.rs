//! NSS-format key log for external TLS decryption (e.g. wireshark)

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;
use tokio_rustls::rustls::KeyLog;

/// Appends `LABEL client_random secret` lines to a file. The file is
/// truncated when the writer is created and closed once at shutdown;
/// late log calls after close are dropped.
#[derive(Debug)]
pub struct KeyLogWriter {
  file: Mutex<Option<File>>,
}

impl KeyLogWriter {
  pub fn create(path: &Path) -> io::Result<Self> {
    let file = File::create(path)?;
    Ok(Self {
      file: Mutex::new(Some(file)),
    })
  }

  /// Flush and drop the underlying file.
  pub fn close(&self) {
    let mut guard = self.file.lock().unwrap();
    if let Some(mut file) = guard.take() {
      let _ = file.flush();
    }
  }
}

impl KeyLog for KeyLogWriter {
  fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
    let mut guard = self.file.lock().unwrap();
    if let Some(file) = guard.as_mut() {
      let _ = writeln!(file, "{} {} {}", label, hex(client_random), hex(secret));
    }
  }
}

fn hex(bytes: &[u8]) -> String {
  let mut out = String::with_capacity(bytes.len() * 2);
  for byte in bytes {
    out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
    out.push(char::from_digit(u32::from(byte & 0x0f), 16).unwrap_or('0'));
  }
  out
}
