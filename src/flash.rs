// Flash orchestration
//
// read Wi-Fi password -> mode = firmware update -> wait for the AP -> join
// it -> wait for the usable join -> upload. One flash at a time per
// controller; progress and milestones go out on a broadcast channel.

use crate::artifact::FirmwareArtifact;
use crate::error::{FlashError, HandoffError};
use crate::handoff::HandoffController;
use crate::session::SharedSession;
use crate::transfer::{Connector, FirmwareTransfer, TcpConnector, TransferReport, UploadProgress};
use crate::wifi::NetworkEvent;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch, Mutex};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum FlashEvent {
    PasswordReceived,
    ModeSwitched,
    JoiningNetwork { ssid: String },
    NetworkJoined { ssid: String },
    Progress { progress: UploadProgress },
    Completed { attempts: u32, bytes_sent: u64 },
    Failed { message: String },
}

pub struct FlashController<C: Connector = TcpConnector> {
    session: SharedSession,
    handoff: HandoffController,
    transfer: FirmwareTransfer<C>,
    /// Held for the whole flash; a second caller finds it locked.
    network_events: Mutex<mpsc::UnboundedReceiver<NetworkEvent>>,
    events: broadcast::Sender<FlashEvent>,
}

impl<C: Connector> FlashController<C> {
    pub fn new(
        session: SharedSession,
        handoff: HandoffController,
        transfer: FirmwareTransfer<C>,
        network_events: mpsc::UnboundedReceiver<NetworkEvent>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session,
            handoff,
            transfer,
            network_events: Mutex::new(network_events),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FlashEvent> {
        self.events.subscribe()
    }

    pub fn transfer(&self) -> &FirmwareTransfer<C> {
        &self.transfer
    }

    /// Run one complete flash. Fails with `AlreadyInProgress` instead of
    /// queueing behind a flash that has not resolved yet.
    pub async fn flash(&self, artifact: &FirmwareArtifact) -> Result<TransferReport, FlashError> {
        let mut network_events = self
            .network_events
            .try_lock()
            .map_err(|_| FlashError::AlreadyInProgress)?;

        tlog!("[flash] Starting flash of {} ({} bytes)", artifact.file_name(), artifact.len);
        let result = self.run(&mut network_events, artifact).await;
        match &result {
            Ok(report) => {
                tlog!("[flash] Completed after {} attempt(s)", report.attempts);
                self.emit(FlashEvent::Completed {
                    attempts: report.attempts,
                    bytes_sent: report.bytes_sent,
                });
            }
            Err(e) => {
                tlog!("[flash] Failed: {e}");
                self.emit(FlashEvent::Failed {
                    message: e.to_string(),
                });
            }
        }
        result
    }

    async fn run(
        &self,
        network_events: &mut mpsc::UnboundedReceiver<NetworkEvent>,
        artifact: &FirmwareArtifact,
    ) -> Result<TransferReport, FlashError> {
        // Reports from before the mode switch must not count as a join.
        while network_events.try_recv().is_ok() {}

        let password = self.session.lock().await.read_wifi_password().await?;
        if password.is_empty() {
            return Err(HandoffError::MissingPassword.into());
        }
        self.emit(FlashEvent::PasswordReceived);

        self.session.lock().await.enter_update_mode().await?;
        self.emit(FlashEvent::ModeSwitched);

        let ssid = self.handoff.ssid().to_string();
        tokio::time::sleep(self.handoff.config().ap_start_delay()).await;
        self.emit(FlashEvent::JoiningNetwork { ssid: ssid.clone() });
        self.handoff.join(&password).await?;
        self.handoff.wait_for_join(network_events).await?;
        self.emit(FlashEvent::NetworkJoined { ssid });

        let (progress_tx, mut progress_rx) = watch::channel(UploadProgress::default());
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while progress_rx.changed().await.is_ok() {
                let progress = *progress_rx.borrow_and_update();
                let _ = events.send(FlashEvent::Progress { progress });
            }
        });

        let result = self.transfer.upload(artifact, &progress_tx).await;
        drop(progress_tx);
        let _ = forwarder.await;
        Ok(result?)
    }

    fn emit(&self, event: FlashEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble_mock::{MockHandle, MockLink, MOCK_PASSWORD};
    use crate::config::{HandoffConfig, TransferConfig};
    use crate::error::{SessionError, TransferError};
    use crate::gatt::DeviceHandle;
    use crate::net_mock::{MockConnector, MockNetworks};
    use crate::registry::CharacteristicRole;
    use crate::session::{DeviceSession, SessionState};
    use crate::transfer::encode_length_header;
    use crate::wifi::NetworkEvent;
    use std::io::Write;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::Arc;
    use std::time::Duration;

    struct Rig {
        controller: Arc<FlashController<MockConnector>>,
        networks: Arc<MockNetworks>,
        link: MockHandle,
        network_tx: mpsc::UnboundedSender<NetworkEvent>,
        _file: tempfile::NamedTempFile,
        artifact: FirmwareArtifact,
        contents: Vec<u8>,
    }

    async fn rig(connect: bool, connector: MockConnector) -> Rig {
        let (link, handle) = MockLink::sabotage_device();
        let session = DeviceSession::new(Box::new(link)).into_shared();
        if connect {
            session
                .lock()
                .await
                .connect(DeviceHandle::new("24:0A:C4:12:34:56", "dtc-buzz", None))
                .await
                .unwrap();
        }

        let networks = Arc::new(MockNetworks::new());
        let handoff = HandoffController::new(
            networks.clone(),
            HandoffConfig {
                ap_start_delay_ms: 0,
                join_timeout_secs: 1,
                connect_events_per_join: 1,
                ..HandoffConfig::default()
            },
        );
        let transfer = FirmwareTransfer::with_connector(
            connector,
            TransferConfig {
                host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                port: 5000,
                max_attempts: 3,
                retry_delay_ms: 0,
                settle_delay_ms: 0,
                connect_timeout_ms: 1000,
                chunk_size: 128,
            },
        );

        let (network_tx, network_rx) = mpsc::unbounded_channel();
        let controller = Arc::new(FlashController::new(session, handoff, transfer, network_rx));

        let contents: Vec<u8> = (0..1000u32).map(|i| (i % 256) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&contents).unwrap();
        file.flush().unwrap();
        let artifact = FirmwareArtifact::from_path(file.path()).await.unwrap();

        Rig {
            controller,
            networks,
            link: handle,
            network_tx,
            _file: file,
            artifact,
            contents,
        }
    }

    fn drain(rx: &mut broadcast::Receiver<FlashEvent>) -> Vec<FlashEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_flash_end_to_end() {
        let rig = rig(true, MockConnector::refusing(1)).await;
        rig.networks
            .on_reconnect(rig.network_tx.clone(), vec![NetworkEvent::connected("DTCAP")]);
        let mut events = rig.controller.subscribe();

        let report = rig.controller.flash(&rig.artifact).await.unwrap();
        assert_eq!(report.attempts, 2);
        assert_eq!(report.bytes_sent, 1000);

        assert_eq!(rig.link.value(CharacteristicRole::Mode), Some(vec![1]));
        assert_eq!(rig.networks.calls()[0], format!("add DTCAP {MOCK_PASSWORD}"));

        let mut expected = encode_length_header(1000).to_vec();
        expected.extend_from_slice(&rig.contents);
        assert_eq!(rig.controller.transfer().connector().streams(), vec![expected]);

        let events = drain(&mut events);
        let milestones: Vec<_> = events
            .iter()
            .filter(|e| !matches!(e, FlashEvent::Progress { .. }))
            .cloned()
            .collect();
        assert_eq!(
            milestones,
            vec![
                FlashEvent::PasswordReceived,
                FlashEvent::ModeSwitched,
                FlashEvent::JoiningNetwork { ssid: "DTCAP".into() },
                FlashEvent::NetworkJoined { ssid: "DTCAP".into() },
                FlashEvent::Completed {
                    attempts: 2,
                    bytes_sent: 1000
                },
            ]
        );
        assert!(events.iter().any(|e| matches!(
            e,
            FlashEvent::Progress { progress } if progress.percent == 100
        )));
    }

    #[tokio::test]
    async fn test_flash_requires_ready_session() {
        let rig = rig(false, MockConnector::refusing(0)).await;
        let mut events = rig.controller.subscribe();

        let err = rig.controller.flash(&rig.artifact).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::Session(SessionError::NotReady(SessionState::Disconnected))
        ));
        assert!(rig.networks.calls().is_empty());
        assert_eq!(rig.controller.transfer().connector().attempts(), 0);
        assert!(matches!(
            drain(&mut events).last(),
            Some(FlashEvent::Failed { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_join_events_are_ignored() {
        let rig = rig(true, MockConnector::refusing(0)).await;
        rig.network_tx.send(NetworkEvent::connected("DTCAP")).unwrap();

        let err = rig.controller.flash(&rig.artifact).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::Handoff(HandoffError::JoinTimeout { .. })
        ));
        assert_eq!(rig.controller.transfer().connector().attempts(), 0);
    }

    #[tokio::test]
    async fn test_second_flash_is_rejected_while_first_runs() {
        let rig = rig(true, MockConnector::refusing(0)).await;
        let controller = rig.controller.clone();
        let artifact = rig.artifact.clone();
        let first = tokio::spawn(async move { controller.flash(&artifact).await });

        tokio::time::sleep(Duration::from_millis(200)).await;
        let err = rig.controller.flash(&rig.artifact).await.unwrap_err();
        assert!(matches!(err, FlashError::AlreadyInProgress));

        // The first one resolves (no join ever arrives) and frees the controller.
        assert!(first.await.unwrap().is_err());
        rig.networks
            .on_reconnect(rig.network_tx.clone(), vec![NetworkEvent::connected("DTCAP")]);
        assert!(rig.controller.flash(&rig.artifact).await.is_ok());
    }

    #[tokio::test]
    async fn test_transfer_failure_is_reported() {
        let rig = rig(true, MockConnector::refusing(usize::MAX)).await;
        rig.networks
            .on_reconnect(rig.network_tx.clone(), vec![NetworkEvent::connected("DTCAP")]);
        let mut events = rig.controller.subscribe();

        let err = rig.controller.flash(&rig.artifact).await.unwrap_err();
        assert!(matches!(
            err,
            FlashError::Transfer(TransferError::RetriesExhausted { attempts: 3, .. })
        ));
        assert_eq!(rig.controller.transfer().connector().attempts(), 3);
        assert!(matches!(
            drain(&mut events).last(),
            Some(FlashEvent::Failed { .. })
        ));
    }
}
