use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::health::HealthMetrics;
use crate::metric::{valid_path, Sample};

/// Why a protocol line was rejected.
#[derive(Debug, PartialEq, Eq)]
pub enum LineError {
    FieldCount,
    Path,
    Value,
    Timestamp,
}

/// Parses one plaintext protocol line: `path value timestamp`, separated
/// by whitespace.
pub fn parse_line(line: &str) -> Result<Sample, LineError> {
    let mut fields = line.split_whitespace();

    let (Some(path), Some(value), Some(timestamp), None) =
        (fields.next(), fields.next(), fields.next(), fields.next())
    else {
        return Err(LineError::FieldCount);
    };

    if !valid_path(path) {
        return Err(LineError::Path);
    }

    let value: f64 = value.parse().map_err(|_| LineError::Value)?;
    if !value.is_finite() {
        return Err(LineError::Value);
    }

    let timestamp: f64 = timestamp.parse().map_err(|_| LineError::Timestamp)?;

    Ok(Sample {
        path: path.to_string(),
        value,
        timestamp,
    })
}

/// Parses and forwards one line. Malformed lines and samples dropped on
/// a full ingest channel are counted, never fatal.
fn process_line(line: &str, samples: &mpsc::Sender<Sample>, health: &HealthMetrics) {
    if line.trim().is_empty() {
        return;
    }

    match parse_line(line) {
        Ok(sample) => match samples.try_send(sample) {
            Ok(()) => health.samples_received.inc(),
            Err(e) => {
                debug!(error = %e, "ingest channel full, sample dropped");
                health.samples_discarded.inc();
            }
        },
        Err(e) => {
            debug!(?e, line, "malformed metric line");
            health.samples_discarded.inc();
        }
    }
}

/// Starts the plaintext TCP listener. Binding failures are fatal; a
/// service that cannot ingest has no reason to run.
pub async fn start_tcp(
    addr: &str,
    samples: mpsc::Sender<Sample>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding tcp listener on {addr}"))?;

    info!(addr = %listener.local_addr().context("getting local address")?, "tcp listener started");

    Ok(spawn_tcp(listener, samples, health, cancel))
}

fn spawn_tcp(
    listener: TcpListener,
    samples: mpsc::Sender<Sample>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("tcp listener received quit");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            debug!(%peer, "metric connection accepted");
                            let samples = samples.clone();
                            let health = Arc::clone(&health);
                            let cancel = cancel.clone();
                            tokio::spawn(handle_connection(stream, samples, health, cancel));
                        }
                        Err(e) => {
                            warn!(error = %e, "accepting metric connection");
                        }
                    }
                }
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    samples: mpsc::Sender<Sample>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => process_line(&line, &samples, &health),
                    Ok(None) => return,
                    Err(e) => {
                        debug!(error = %e, "metric connection read error");
                        return;
                    }
                }
            }
        }
    }
}

/// Starts the plaintext UDP listener. One datagram may carry several
/// newline-separated lines.
pub async fn start_udp(
    addr: &str,
    samples: mpsc::Sender<Sample>,
    health: Arc<HealthMetrics>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let socket = UdpSocket::bind(addr)
        .await
        .with_context(|| format!("binding udp listener on {addr}"))?;

    info!(addr = %socket.local_addr().context("getting local address")?, "udp listener started");

    Ok(tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("udp listener received quit");
                    return;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, _peer)) => {
                            let datagram = String::from_utf8_lossy(&buf[..len]);
                            for line in datagram.lines() {
                                process_line(line, &samples, &health);
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "receiving metric datagram");
                        }
                    }
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line_valid() {
        let sample = parse_line("a.b.c 4.5 1700000000").expect("parses");
        assert_eq!(sample.path, "a.b.c");
        assert_eq!(sample.value, 4.5);
        assert_eq!(sample.timestamp, 1_700_000_000.0);
    }

    #[test]
    fn test_parse_line_tolerates_extra_whitespace() {
        let sample = parse_line("  a.b.c\t4.5  1700000000 ").expect("parses");
        assert_eq!(sample.path, "a.b.c");
    }

    #[test]
    fn test_parse_line_wrong_field_count() {
        assert_eq!(parse_line("a.b.c 4.5"), Err(LineError::FieldCount));
        assert_eq!(
            parse_line("a.b.c 4.5 1700000000 extra"),
            Err(LineError::FieldCount),
        );
    }

    #[test]
    fn test_parse_line_rejects_bad_path() {
        assert_eq!(parse_line("a.*.c 4.5 1700000000"), Err(LineError::Path));
        assert_eq!(parse_line("a:b 4.5 1700000000"), Err(LineError::Path));
        assert_eq!(parse_line("a..b 4.5 1700000000"), Err(LineError::Path));
    }

    #[test]
    fn test_parse_line_rejects_non_finite_values() {
        assert_eq!(parse_line("a.b nan 1700000000"), Err(LineError::Value));
        assert_eq!(parse_line("a.b inf 1700000000"), Err(LineError::Value));
        assert_eq!(parse_line("a.b abc 1700000000"), Err(LineError::Value));
    }

    #[test]
    fn test_parse_line_rejects_bad_timestamp() {
        assert_eq!(parse_line("a.b 4.5 then"), Err(LineError::Timestamp));
    }

    #[tokio::test]
    async fn test_process_line_counts_drops_on_full_channel() {
        let health = HealthMetrics::new(":0").expect("metrics");
        let (tx, _rx) = mpsc::channel(1);

        process_line("a.b 1 1700000000", &tx, &health);
        process_line("a.b 2 1700000000", &tx, &health);

        assert_eq!(health.samples_received.get() as u64, 1);
        assert_eq!(health.samples_discarded.get() as u64, 1);
    }

    #[tokio::test]
    async fn test_tcp_listener_feeds_ingest_channel() {
        use tokio::io::AsyncWriteExt;

        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = spawn_tcp(listener, tx, Arc::clone(&health), cancel.clone());

        let mut stream = TcpStream::connect(addr).await.expect("connect");
        stream
            .write_all(b"a.b.c 4.5 1700000000\nbad line\na.b.d 6 1700000001\n")
            .await
            .expect("write");
        stream.shutdown().await.expect("shutdown");

        let first = rx.recv().await.expect("first sample");
        assert_eq!(first.path, "a.b.c");
        let second = rx.recv().await.expect("second sample");
        assert_eq!(second.path, "a.b.d");
        assert_eq!(second.value, 6.0);

        cancel.cancel();
        handle.await.expect("listener task");
        assert_eq!(health.samples_discarded.get() as u64, 1);
    }
}
