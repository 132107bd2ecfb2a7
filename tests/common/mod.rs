use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use beanstalk_rs::config::Config;
use beanstalk_rs::server::Server;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running server bound to an OS-assigned loopback port, with its own
/// shutdown token so a test can stop it deterministically instead of relying
/// on process exit.
pub struct TestServer {
    pub addr: SocketAddr,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

pub fn test_config() -> Config {
    Config {
        listen: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        wal_dir: None,
        max_job_size: 65535,
        fsync_period: Duration::from_millis(50),
        no_fsync: false,
        binlog_segment_size: 10 * 1024 * 1024,
        verbose: false,
    }
}

pub fn wal_config(dir: PathBuf) -> Config {
    Config { wal_dir: Some(dir), ..test_config() }
}

impl TestServer {
    pub async fn start(config: Config) -> Self {
        let (server, listener) = Server::open(&config).await.expect("server should open");
        let addr = listener.local_addr().expect("listener should have a local addr");

        let shutdown = CancellationToken::new();
        let drain = CancellationToken::new();
        let task_shutdown = shutdown.clone();
        let handle = tokio::spawn(server.run(listener, task_shutdown, drain));

        TestServer { addr, shutdown, handle }
    }

    pub async fn connect(&self) -> TestClient {
        let stream = TcpStream::connect(self.addr).await.expect("connect to test server");
        stream.set_nodelay(true).expect("set_nodelay");
        TestClient { stream: BufReader::new(stream) }
    }

    /// Cancels the shutdown token and waits for the event loop to unwind,
    /// flushing the write-ahead log (if any) before returning.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.handle.await.expect("server task should not panic").expect("server should shut down cleanly");
    }
}

pub struct TestClient {
    stream: BufReader<TcpStream>,
}

impl TestClient {
    pub async fn send(&mut self, line: &str) {
        self.stream.write_all(line.as_bytes()).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
    }

    pub async fn send_put(&mut self, pri: u32, delay: u32, ttr: u32, body: &[u8]) -> String {
        self.send(&format!("put {pri} {delay} {ttr} {}", body.len())).await;
        self.stream.write_all(body).await.unwrap();
        self.stream.write_all(b"\r\n").await.unwrap();
        self.read_line().await
    }

    pub async fn read_line(&mut self) -> String {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await.unwrap();
        assert!(n > 0, "connection closed before a reply arrived");
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    /// Reads a `RESERVED`/`FOUND` header plus its job body, returning the
    /// header line and the body with its trailing CRLF stripped.
    pub async fn read_job(&mut self) -> (String, Vec<u8>) {
        let header = self.read_line().await;
        let n_bytes: usize = header
            .rsplit(' ')
            .next()
            .and_then(|tok| tok.parse().ok())
            .unwrap_or_else(|| panic!("expected a job header with a byte count, got {header:?}"));

        let mut body = vec![0u8; n_bytes + 2];
        self.stream.read_exact(&mut body).await.unwrap();
        body.truncate(n_bytes);
        (header, body)
    }

    /// Drops the connection without sending `quit`, as if the client crashed.
    pub async fn disconnect(self) {
        drop(self.stream);
    }
}
