//! End-to-end scenarios over loopback sockets

use spyglass::{CertAuthority, Error, ProxyServer, UpstreamDialer};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

const CONNECT_ACK: &[u8] = b"HTTP/1.1 200 Connection established\r\nContent-Length: 0\r\n\r\n";

struct TestProxy {
  server: ProxyServer,
  addr: String,
  ca: Arc<CertAuthority>,
  dir: std::path::PathBuf,
}

impl TestProxy {
  async fn start(label: &str, relay: &str) -> Self {
    let dir = std::env::temp_dir().join(format!("spyglass-e2e-{label}"));
    std::fs::remove_dir_all(&dir).ok();
    let ca_path = dir.join("ca.pem");

    let ca = Arc::new(CertAuthority::open(ca_path.to_str().unwrap(), None).unwrap());
    let dialer = Arc::new(UpstreamDialer::from_url(relay).unwrap());
    let server = ProxyServer::new(ca.clone(), dialer, None);

    // reserve an ephemeral port, then run on it
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = probe.local_addr().unwrap().to_string();
    drop(probe);

    {
      let server = server.clone();
      let addr = addr.clone();
      tokio::spawn(async move { server.run(&addr).await });
    }
    wait_until_connectable(&addr).await;

    Self {
      server,
      addr,
      ca,
      dir,
    }
  }

  async fn connect(&self) -> TcpStream {
    TcpStream::connect(&self.addr).await.unwrap()
  }

  fn cleanup(&self) {
    std::fs::remove_dir_all(&self.dir).ok();
  }
}

async fn wait_until_connectable(addr: &str) {
  for _ in 0..100 {
    if TcpStream::connect(addr).await.is_ok() {
      return;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  panic!("proxy at {addr} never became connectable");
}

async fn read_head(stream: &mut TcpStream) -> Vec<u8> {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    let n = stream.read(&mut byte).await.unwrap();
    if n == 0 {
      break;
    }
    head.push(byte[0]);
  }
  head
}

/// A one-shot HTTP origin that answers `hello` and closes.
async fn spawn_origin() -> (String, tokio::task::JoinHandle<Vec<u8>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap().to_string();
  let handle = tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let head = read_head(&mut stream).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
      .await
      .unwrap();
    stream.flush().await.unwrap();
    head
  });
  (addr, handle)
}

#[tokio::test]
async fn plain_http_forward_round_trips() {
  let proxy = TestProxy::start("plain-forward", "").await;
  let (origin_addr, origin) = spawn_origin().await;

  let mut client = proxy.connect().await;
  let request =
    format!("GET http://{origin_addr}/ HTTP/1.1\r\nHost: {origin_addr}\r\nAccept: */*\r\n\r\n");
  client.write_all(request.as_bytes()).await.unwrap();

  let mut response = Vec::new();
  tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
    .await
    .unwrap()
    .unwrap();
  let response = String::from_utf8_lossy(&response);
  assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {response}");
  assert!(response.ends_with("hello"));

  let origin_head = String::from_utf8(origin.await.unwrap()).unwrap();
  assert!(origin_head.starts_with("GET / HTTP/1.1\r\n"), "origin saw: {origin_head}");
  assert!(origin_head.to_ascii_lowercase().contains(&format!("host: {origin_addr}")));

  proxy.cleanup();
}

#[tokio::test]
async fn connect_ack_is_byte_exact_and_opaque_bytes_pass_through() {
  let proxy = TestProxy::start("opaque-tunnel", "").await;

  // an origin speaking something that is neither TLS nor HTTP
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = listener.local_addr().unwrap().to_string();
  let origin = tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let mut greeting = [0u8; 8];
    stream.read_exact(&mut greeting).await.unwrap();
    stream.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
    stream.flush().await.unwrap();
    greeting
  });

  let mut client = proxy.connect().await;
  let connect = format!("CONNECT {origin_addr} HTTP/1.1\r\nHost: {origin_addr}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.unwrap();

  let mut ack = vec![0u8; CONNECT_ACK.len()];
  tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut ack))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(ack, CONNECT_ACK);

  client.write_all(b"SSH-2.0-").await.unwrap();
  let mut banner = [0u8; 21];
  tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut banner))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(&banner, b"SSH-2.0-OpenSSH_9.6\r\n");

  assert_eq!(&origin.await.unwrap(), b"SSH-2.0-");
  proxy.cleanup();
}

#[tokio::test]
async fn connect_intercept_serves_a_wildcard_leaf_chained_to_the_root() {
  use tokio_rustls::rustls::pki_types::ServerName;
  use tokio_rustls::rustls::{ClientConfig, RootCertStore};
  use x509_parser::prelude::{FromDer, GeneralName, X509Certificate};

  let proxy = TestProxy::start("intercept", "").await;

  let mut client = proxy.connect().await;
  client
    .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
    .await
    .unwrap();
  let mut ack = vec![0u8; CONNECT_ACK.len()];
  client.read_exact(&mut ack).await.unwrap();
  assert_eq!(ack, CONNECT_ACK);

  let mut roots = RootCertStore::empty();
  roots.add(proxy.ca.ca_cert_der().clone()).unwrap();
  let config = ClientConfig::builder()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
  let name = ServerName::try_from("example.test").unwrap();

  let tls = tokio::time::timeout(Duration::from_secs(5), connector.connect(name, client))
    .await
    .unwrap()
    .unwrap();

  let certs = tls.get_ref().1.peer_certificates().unwrap();
  assert_eq!(certs.len(), 2);
  assert_eq!(&certs[1], proxy.ca.ca_cert_der());

  let (_, leaf) = X509Certificate::from_der(certs[0].as_ref()).unwrap();
  let san = leaf.subject_alternative_name().unwrap().unwrap().value;
  let names: Vec<String> = san
    .general_names
    .iter()
    .filter_map(|name| match name {
      GeneralName::DNSName(dns) => Some(dns.to_string()),
      _ => None,
    })
    .collect();
  assert_eq!(names, vec!["*.example.test", "example.test"]);

  let subject_cn = leaf
    .subject()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .unwrap();
  assert_eq!(subject_cn, "*.example.test");

  let issuer_cn = leaf
    .issuer()
    .iter_common_name()
    .next()
    .and_then(|cn| cn.as_str().ok())
    .unwrap();
  assert_eq!(issuer_cn, "mitmproxy");

  proxy.cleanup();
}

#[tokio::test]
async fn relay_proxy_receives_connect_with_basic_auth() {
  // fake relay proxy asserting the Proxy-Authorization header
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let relay_addr = listener.local_addr().unwrap().to_string();
  let relay = tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let connect_head = String::from_utf8(read_head(&mut stream).await).unwrap();
    stream
      .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
      .await
      .unwrap();
    // now play origin for the relayed request
    let request_head = String::from_utf8(read_head(&mut stream).await).unwrap();
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
      .await
      .unwrap();
    stream.flush().await.unwrap();
    (connect_head, request_head)
  });

  let proxy = TestProxy::start(
    "relay-auth",
    &format!("http://user:pw@{relay_addr}"),
  )
  .await;

  let mut client = proxy.connect().await;
  client
    .write_all(b"GET http://example.test/ HTTP/1.1\r\nHost: example.test\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
    .await
    .unwrap()
    .unwrap();
  assert!(String::from_utf8_lossy(&response).ends_with("ok"));

  let (connect_head, request_head) = relay.await.unwrap();
  assert!(
    connect_head.starts_with("CONNECT example.test:80 HTTP/1.1\r\n"),
    "relay saw: {connect_head}"
  );
  assert!(connect_head.contains("Proxy-Authorization: Basic dXNlcjpwdw==\r\n"));
  assert!(request_head.starts_with("GET / HTTP/1.1\r\n"));

  proxy.cleanup();
}

#[tokio::test]
async fn status_endpoint_reports_cache_gauges() {
  let proxy = TestProxy::start("status", "").await;

  let mut client = proxy.connect().await;
  client
    .write_all(b"GET /status HTTP/1.1\r\nHost: proxy\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut response))
    .await
    .unwrap()
    .unwrap();
  let response = String::from_utf8(response).unwrap();

  assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "got: {response}");
  assert!(response.contains("Content-Type: application/json;charset=utf-8\r\n"));

  let body_start = response.find("\r\n\r\n").unwrap() + 4;
  let body: serde_json::Value = serde_json::from_str(&response[body_start..]).unwrap();
  assert!(body.get("Goroutines").and_then(|v| v.as_u64()).is_some());
  assert_eq!(body.get("CacheCap").and_then(|v| v.as_u64()), Some(128));
  assert_eq!(body.get("CacheLen").and_then(|v| v.as_u64()), Some(0));

  let content_length: usize = response[..body_start]
    .lines()
    .find_map(|line| line.strip_prefix("Content-Length: "))
    .unwrap()
    .trim()
    .parse()
    .unwrap();
  assert_eq!(content_length, response.len() - body_start);

  // any other direct request is a 400
  let mut client = proxy.connect().await;
  client
    .write_all(b"GET /metrics HTTP/1.1\r\nHost: proxy\r\n\r\n")
    .await
    .unwrap();
  let mut response = Vec::new();
  client.read_to_end(&mut response).await.unwrap();
  assert!(String::from_utf8_lossy(&response)
    .starts_with("HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n"));

  proxy.cleanup();
}

#[tokio::test]
async fn shutdown_drains_idle_connect_tunnels_within_deadline() {
  let proxy = TestProxy::start("shutdown-drain", "").await;

  let mut tunnels = Vec::new();
  for _ in 0..50 {
    let mut client = proxy.connect().await;
    client
      .write_all(b"CONNECT idle.example.test:443 HTTP/1.1\r\nHost: idle.example.test:443\r\n\r\n")
      .await
      .unwrap();
    let mut ack = vec![0u8; CONNECT_ACK.len()];
    client.read_exact(&mut ack).await.unwrap();
    tunnels.push(client);
  }

  let started = std::time::Instant::now();
  proxy
    .server
    .shutdown(Duration::from_secs(5))
    .await
    .expect("drain within deadline");
  assert!(started.elapsed() < Duration::from_secs(5));

  // every peer connection is closed
  for mut tunnel in tunnels {
    let mut buf = [0u8; 1];
    let eof = tokio::time::timeout(Duration::from_secs(5), tunnel.read(&mut buf))
      .await
      .expect("peer close observed");
    assert!(matches!(eof, Ok(0) | Err(_)));
  }

  proxy.cleanup();
}

#[tokio::test]
async fn lifecycle_errors_are_reported() {
  let proxy = TestProxy::start("lifecycle", "").await;

  // a second accept loop on the same server is refused
  match proxy.server.run("127.0.0.1:0").await {
    Err(Error::AlreadyListening) => {}
    other => panic!("expected AlreadyListening, got {:?}", other.is_ok()),
  }

  proxy.server.shutdown(Duration::from_secs(1)).await.unwrap();

  // and after shutdown the server stays closed
  match proxy.server.run("127.0.0.1:0").await {
    Err(Error::ServerClosed) => {}
    other => panic!("expected ServerClosed, got {:?}", other.is_ok()),
  }

  proxy.cleanup();
}
