// Firmware transfer over TCP
//
// Wire format: 8-byte big-endian length, then exactly that many raw bytes.
// Nothing is read back. Each attempt sleeps, connects and sends the whole
// file from byte 0; a failed attempt never resumes mid-stream.

use crate::artifact::FirmwareArtifact;
use crate::config::TransferConfig;
use crate::error::{ArtifactError, TransferError};
use async_trait::async_trait;
use serde::Serialize;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;

pub const LENGTH_HEADER_LEN: usize = 8;

pub fn encode_length_header(len: u64) -> [u8; LENGTH_HEADER_LEN] {
    len.to_be_bytes()
}

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UploadProgress {
    pub attempt: u32,
    pub bytes_sent: u64,
    pub total_bytes: u64,
    pub percent: u8,
}

impl UploadProgress {
    fn new(attempt: u32, bytes_sent: u64, total_bytes: u64) -> Self {
        let percent = if total_bytes == 0 {
            0
        } else {
            (bytes_sent.saturating_mul(100) / total_bytes).min(100) as u8
        };
        Self {
            attempt,
            bytes_sent,
            total_bytes,
            percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransferReport {
    pub attempts: u32,
    pub bytes_sent: u64,
}

/// Opens the byte stream to the device.
#[async_trait]
pub trait Connector: Send + Sync {
    type Stream: AsyncWrite + Unpin + Send;

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<Self::Stream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    type Stream = TcpStream;

    async fn connect(&self, addr: SocketAddr, timeout: Duration) -> io::Result<TcpStream> {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {addr} timed out"),
            )),
        }
    }
}

/// Why one attempt ended early.
enum AttemptError {
    /// Socket-level failure: consumes one attempt.
    Io(io::Error),
    /// Retrying cannot help.
    Fatal(TransferError),
}

// ============================================================================
// Engine
// ============================================================================

pub struct FirmwareTransfer<C: Connector = TcpConnector> {
    connector: C,
    config: TransferConfig,
}

impl FirmwareTransfer<TcpConnector> {
    pub fn new(config: TransferConfig) -> Self {
        Self::with_connector(TcpConnector, config)
    }
}

impl<C: Connector> FirmwareTransfer<C> {
    pub fn with_connector(connector: C, config: TransferConfig) -> Self {
        Self { connector, config }
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Deliver `artifact`, retrying failed attempts up to the configured budget.
    pub async fn upload(
        &self,
        artifact: &FirmwareArtifact,
        progress: &watch::Sender<UploadProgress>,
    ) -> Result<TransferReport, TransferError> {
        let addr = self.config.device_addr();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        tlog!(
            "[transfer] Uploading {} ({} bytes) to {addr}",
            artifact.file_name(),
            artifact.len
        );

        for attempt in 1..=max_attempts {
            // Gives the device's AP and socket server time to come up.
            tokio::time::sleep(self.config.retry_delay()).await;
            tlog!("[transfer] Attempt {attempt}/{max_attempts}: connecting to {addr}");

            let mut stream = match self
                .connector
                .connect(addr, self.config.connect_timeout())
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    tlog!("[transfer] Attempt {attempt} failed to connect: {e}");
                    last_error = e.to_string();
                    continue;
                }
            };

            match self.send_file(&mut stream, artifact, attempt, progress).await {
                Ok(bytes_sent) => {
                    tlog!("[transfer] Upload complete after {attempt} attempt(s) ({bytes_sent} bytes)");
                    return Ok(TransferReport {
                        attempts: attempt,
                        bytes_sent,
                    });
                }
                Err(AttemptError::Fatal(e)) => {
                    tlog!("[transfer] Aborting: {e}");
                    return Err(e);
                }
                Err(AttemptError::Io(e)) => {
                    tlog!("[transfer] Attempt {attempt} failed mid-stream: {e}");
                    last_error = e.to_string();
                }
            }
        }

        Err(TransferError::RetriesExhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    async fn send_file(
        &self,
        stream: &mut C::Stream,
        artifact: &FirmwareArtifact,
        attempt: u32,
        progress: &watch::Sender<UploadProgress>,
    ) -> Result<u64, AttemptError> {
        let path = artifact.path.display().to_string();
        let artifact_err = |source: io::Error| {
            AttemptError::Fatal(TransferError::Artifact(ArtifactError::Io {
                path: path.clone(),
                source,
            }))
        };

        tokio::time::sleep(self.config.settle_delay()).await;

        // The header must describe the bytes that follow, so re-check the file.
        let file = tokio::fs::File::open(&artifact.path)
            .await
            .map_err(artifact_err)?;
        let actual = file.metadata().await.map_err(artifact_err)?.len();
        if actual != artifact.len {
            return Err(AttemptError::Fatal(TransferError::SourceChanged {
                expected: artifact.len,
                actual,
            }));
        }

        let total = artifact.len;
        progress.send_replace(UploadProgress::new(attempt, 0, total));
        stream
            .write_all(&encode_length_header(total))
            .await
            .map_err(AttemptError::Io)?;

        let mut reader = file.take(total);
        let mut buf = vec![0u8; self.config.chunk_size.max(1)];
        let mut sent = 0u64;
        loop {
            let n = reader.read(&mut buf).await.map_err(artifact_err)?;
            if n == 0 {
                break;
            }
            stream
                .write_all(&buf[..n])
                .await
                .map_err(AttemptError::Io)?;
            sent += n as u64;
            progress.send_replace(UploadProgress::new(attempt, sent, total));
        }

        if sent != total {
            return Err(AttemptError::Fatal(TransferError::SourceChanged {
                expected: total,
                actual: sent,
            }));
        }

        stream.flush().await.map_err(AttemptError::Io)?;
        if let Err(e) = stream.shutdown().await {
            tlog!("[transfer] Socket shutdown failed after upload: {e}");
        }
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net_mock::MockConnector;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::net::TcpListener;

    fn fast_config(port: u16) -> TransferConfig {
        TransferConfig {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            max_attempts: 3,
            retry_delay_ms: 0,
            settle_delay_ms: 0,
            connect_timeout_ms: 2000,
            chunk_size: 64,
        }
    }

    async fn artifact_with(contents: &[u8]) -> (tempfile::NamedTempFile, FirmwareArtifact) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents).unwrap();
        file.flush().unwrap();
        let artifact = FirmwareArtifact::from_path(file.path()).await.unwrap();
        (file, artifact)
    }

    fn firmware(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn wire(contents: &[u8]) -> Vec<u8> {
        let mut expected = encode_length_header(contents.len() as u64).to_vec();
        expected.extend_from_slice(contents);
        expected
    }

    // ========================================================================
    // Wire format
    // ========================================================================

    #[test]
    fn test_length_header_is_big_endian() {
        assert_eq!(encode_length_header(3), [0, 0, 0, 0, 0, 0, 0, 3]);
        assert_eq!(
            encode_length_header(0x0102_0304_0506_0708),
            [1, 2, 3, 4, 5, 6, 7, 8]
        );
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(UploadProgress::new(1, 0, 200).percent, 0);
        assert_eq!(UploadProgress::new(1, 50, 200).percent, 25);
        assert_eq!(UploadProgress::new(1, 200, 200).percent, 100);
    }

    #[tokio::test]
    async fn test_wire_format_over_loopback() {
        let contents = firmware(10_000);
        let (_file, artifact) = artifact_with(&contents).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut received = Vec::new();
            socket.read_to_end(&mut received).await.unwrap();
            received
        });

        let engine = FirmwareTransfer::new(fast_config(port));
        let (progress, rx) = watch::channel(UploadProgress::default());
        let report = engine.upload(&artifact, &progress).await.unwrap();

        assert_eq!(report, TransferReport { attempts: 1, bytes_sent: 10_000 });
        assert_eq!(server.await.unwrap(), wire(&contents));
        let last = *rx.borrow();
        assert_eq!(last.percent, 100);
        assert_eq!(last.bytes_sent, 10_000);
    }

    // ========================================================================
    // Retry policy
    // ========================================================================

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let contents = firmware(500);
        let (_file, artifact) = artifact_with(&contents).await;
        let engine = FirmwareTransfer::with_connector(MockConnector::refusing(2), fast_config(5000));
        let (progress, _rx) = watch::channel(UploadProgress::default());

        let report = engine.upload(&artifact, &progress).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(engine.connector().attempts(), 3);
        assert_eq!(engine.connector().streams(), vec![wire(&contents)]);
        assert_eq!(
            engine.connector().last_addr().unwrap().to_string(),
            "127.0.0.1:5000"
        );
    }

    #[tokio::test]
    async fn test_always_refused_makes_exactly_three_attempts() {
        let (_file, artifact) = artifact_with(&firmware(64)).await;
        let engine =
            FirmwareTransfer::with_connector(MockConnector::refusing(usize::MAX), fast_config(5000));
        let (progress, _rx) = watch::channel(UploadProgress::default());

        let err = engine.upload(&artifact, &progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetriesExhausted { attempts: 3, .. }
        ));
        assert_eq!(engine.connector().attempts(), 3);
        assert!(engine.connector().streams().is_empty());
    }

    #[tokio::test]
    async fn test_refused_loopback_port_fails() {
        let (_file, artifact) = artifact_with(&firmware(64)).await;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let engine = FirmwareTransfer::new(fast_config(port));
        let (progress, _rx) = watch::channel(UploadProgress::default());
        let err = engine.upload(&artifact, &progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::RetriesExhausted { attempts: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_mid_stream_failure_restarts_from_zero() {
        let contents = firmware(1000);
        let (_file, artifact) = artifact_with(&contents).await;
        let engine = FirmwareTransfer::with_connector(
            MockConnector::breaking_first_stream_after(100),
            fast_config(5000),
        );
        let (progress, _rx) = watch::channel(UploadProgress::default());

        let report = engine.upload(&artifact, &progress).await.unwrap();
        assert_eq!(report.attempts, 2);
        let streams = engine.connector().streams();
        assert_eq!(streams.len(), 2);
        assert!(streams[0].len() <= 100);
        assert_eq!(streams[1], wire(&contents));
    }

    #[tokio::test]
    async fn test_changed_source_is_not_retried() {
        let (file, artifact) = artifact_with(&firmware(256)).await;
        std::fs::write(file.path(), firmware(10)).unwrap();

        let engine = FirmwareTransfer::with_connector(MockConnector::refusing(0), fast_config(5000));
        let (progress, _rx) = watch::channel(UploadProgress::default());
        let err = engine.upload(&artifact, &progress).await.unwrap_err();
        assert!(matches!(
            err,
            TransferError::SourceChanged {
                expected: 256,
                actual: 10
            }
        ));
        assert_eq!(engine.connector().attempts(), 1);
    }
}
