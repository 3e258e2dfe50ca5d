use crate::transfer::Connector;
use crate::wifi::{NetworkEvent, WifiNetworks};
use async_trait::async_trait;
use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;

// ============================================================================
// Wi-Fi
// ============================================================================

/// Records every call; optionally replays network events on `reconnect`.
#[derive(Default)]
pub struct MockNetworks {
    calls: Mutex<Vec<String>>,
    active: Mutex<Option<String>>,
    failing: Mutex<HashSet<&'static str>>,
    on_reconnect: Mutex<Option<(mpsc::UnboundedSender<NetworkEvent>, Vec<NetworkEvent>)>>,
}

impl MockNetworks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn set_active(&self, ssid: Option<&str>) {
        *self.active.lock().unwrap() = ssid.map(str::to_string);
    }

    /// Make the named operation ("add", "disconnect", "enable", "reconnect") fail.
    pub fn fail(&self, op: &'static str) {
        self.failing.lock().unwrap().insert(op);
    }

    pub fn on_reconnect(&self, tx: mpsc::UnboundedSender<NetworkEvent>, events: Vec<NetworkEvent>) {
        *self.on_reconnect.lock().unwrap() = Some((tx, events));
    }

    fn record(&self, op: &'static str, call: String) -> Result<(), String> {
        self.calls.lock().unwrap().push(call);
        if self.failing.lock().unwrap().contains(op) {
            Err(format!("{op} rejected"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl WifiNetworks for MockNetworks {
    async fn add_or_update_network(&self, ssid: &str, psk: &str) -> Result<(), String> {
        self.record("add", format!("add {ssid} {psk}"))
    }

    async fn disconnect(&self) -> Result<(), String> {
        self.record("disconnect", "disconnect".to_string())
    }

    async fn enable_network(&self, ssid: &str) -> Result<(), String> {
        self.record("enable", format!("enable {ssid}"))
    }

    async fn reconnect(&self, ssid: &str) -> Result<(), String> {
        if let Some((tx, events)) = self.on_reconnect.lock().unwrap().as_ref() {
            for event in events {
                let _ = tx.send(event.clone());
            }
        }
        self.record("reconnect", format!("reconnect {ssid}"))
    }

    async fn active_ssid(&self) -> Result<Option<String>, String> {
        Ok(self.active.lock().unwrap().clone())
    }
}

// ============================================================================
// TCP
// ============================================================================

/// In-memory socket that keeps everything written to it.
pub struct RecordingStream {
    written: Arc<Mutex<Vec<u8>>>,
    /// Fail the write that would take the total past this many bytes.
    fail_after: Option<usize>,
}

impl AsyncWrite for RecordingStream {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut written = self.written.lock().unwrap();
        if let Some(limit) = self.fail_after {
            if written.len() + buf.len() > limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "connection reset by peer",
                )));
            }
        }
        written.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Refuses the first `refusals` attempts, then accepts.
#[derive(Default)]
pub struct MockConnector {
    refusals: usize,
    /// Accepted connection (by index) that breaks after this many bytes.
    break_stream: Option<(usize, usize)>,
    attempts: Mutex<Vec<SocketAddr>>,
    streams: Mutex<Vec<Arc<Mutex<Vec<u8>>>>>,
}

impl MockConnector {
    pub fn refusing(refusals: usize) -> Self {
        Self {
            refusals,
            ..Self::default()
        }
    }

    pub fn breaking_first_stream_after(bytes: usize) -> Self {
        Self {
            break_stream: Some((0, bytes)),
            ..Self::default()
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.lock().unwrap().len()
    }

    pub fn last_addr(&self) -> Option<SocketAddr> {
        self.attempts.lock().unwrap().last().copied()
    }

    /// Bytes written on each accepted connection, in order.
    pub fn streams(&self) -> Vec<Vec<u8>> {
        self.streams
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.lock().unwrap().clone())
            .collect()
    }
}

#[async_trait]
impl Connector for MockConnector {
    type Stream = RecordingStream;

    async fn connect(&self, addr: SocketAddr, _timeout: Duration) -> io::Result<RecordingStream> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            attempts.push(addr);
            attempts.len()
        };
        if attempt <= self.refusals {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        let written = Arc::new(Mutex::new(Vec::new()));
        let mut streams = self.streams.lock().unwrap();
        let fail_after = match self.break_stream {
            Some((index, bytes)) if index == streams.len() => Some(bytes),
            _ => None,
        };
        streams.push(written.clone());
        Ok(RecordingStream {
            written,
            fail_after,
        })
    }
}
