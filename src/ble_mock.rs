use crate::error::LinkError;
use crate::gatt::{
    CharProps, DeviceHandle, DiscoveredCharacteristic, GattLink, LinkEvent, StampedEvent,
};
use crate::registry::{CharacteristicRole, SABOTAGE_SERVICE_UUID};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const MOCK_PASSWORD: &str = "Ab3$kP9!";

/// Every operation the session dispatched to the link, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Connect(String),
    Discover,
    Read(Uuid),
    Write(Uuid, Vec<u8>),
    Subscribe(Uuid),
    Disconnect,
    RemoveBond,
}

#[derive(Default)]
pub struct MockState {
    pub ops: Vec<LinkOp>,
    pub table: Vec<DiscoveredCharacteristic>,
    pub values: HashMap<Uuid, Vec<u8>>,
    pub fail_connect: Option<LinkError>,
    pub fail_discover: Option<LinkError>,
    pub fail_next_write: Option<LinkError>,
    pub fail_reads: HashMap<Uuid, LinkError>,
    pub connected: bool,
    pub epoch: u64,
}

/// Test-side view of a `MockLink` after it has been moved into a session.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    events_tx: mpsc::UnboundedSender<StampedEvent>,
}

impl MockHandle {
    pub fn ops(&self) -> Vec<LinkOp> {
        self.state.lock().unwrap().ops.clone()
    }

    pub fn clear_ops(&self) {
        self.state.lock().unwrap().ops.clear();
    }

    pub fn count(&self, pred: impl Fn(&LinkOp) -> bool) -> usize {
        self.state.lock().unwrap().ops.iter().filter(|op| pred(op)).count()
    }

    pub fn io_ops(&self) -> usize {
        self.count(|op| {
            matches!(
                op,
                LinkOp::Read(_) | LinkOp::Write(..) | LinkOp::Subscribe(_)
            )
        })
    }

    pub fn value(&self, role: CharacteristicRole) -> Option<Vec<u8>> {
        self.state.lock().unwrap().values.get(&role.uuid()).cloned()
    }

    pub fn set_value(&self, role: CharacteristicRole, value: &[u8]) {
        self.state
            .lock()
            .unwrap()
            .values
            .insert(role.uuid(), value.to_vec());
    }

    pub fn fail_connect(&self, err: LinkError) {
        self.state.lock().unwrap().fail_connect = Some(err);
    }

    pub fn fail_next_write(&self, err: LinkError) {
        self.state.lock().unwrap().fail_next_write = Some(err);
    }

    pub fn fail_discover(&self, err: LinkError) {
        self.state.lock().unwrap().fail_discover = Some(err);
    }

    pub fn fail_read(&self, role: CharacteristicRole, err: LinkError) {
        self.state.lock().unwrap().fail_reads.insert(role.uuid(), err);
    }

    pub fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().unwrap().connected
    }

    /// Queue an event from the current connection.
    pub fn inject(&self, event: LinkEvent) {
        let epoch = self.state.lock().unwrap().epoch;
        let _ = self.events_tx.send(StampedEvent { epoch, event });
    }
}

pub struct MockLink {
    state: Arc<Mutex<MockState>>,
    events_rx: Option<mpsc::UnboundedReceiver<StampedEvent>>,
}

impl MockLink {
    /// A device exposing every characteristic with sample values.
    pub fn sabotage_device() -> (Self, MockHandle) {
        let table = CharacteristicRole::ALL
            .into_iter()
            .map(|role| DiscoveredCharacteristic {
                service: SABOTAGE_SERVICE_UUID,
                uuid: role.uuid(),
                props: CharProps::READ_WRITE_NOTIFY,
            })
            .collect();
        Self::with_table(table)
    }

    /// A device exposing every characteristic except `absent`.
    pub fn without(absent: &[CharacteristicRole]) -> (Self, MockHandle) {
        let (link, handle) = Self::sabotage_device();
        link.state
            .lock()
            .unwrap()
            .table
            .retain(|c| absent.iter().all(|role| role.uuid() != c.uuid));
        (link, handle)
    }

    pub fn with_table(table: Vec<DiscoveredCharacteristic>) -> (Self, MockHandle) {
        let values = HashMap::from([
            (CharacteristicRole::Buzzer.uuid(), vec![0]),
            (CharacteristicRole::Mode.uuid(), vec![0]),
            (CharacteristicRole::FixedInterval.uuid(), vec![10]),
            (CharacteristicRole::RandomInterval.uuid(), vec![0]),
            (CharacteristicRole::RssiMin.uuid(), vec![0]),
            (CharacteristicRole::SolarMin.uuid(), vec![25]),
            (
                CharacteristicRole::WifiPassword.uuid(),
                MOCK_PASSWORD.as_bytes().to_vec(),
            ),
        ]);
        let state = Arc::new(Mutex::new(MockState {
            table,
            values,
            ..MockState::default()
        }));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let handle = MockHandle {
            state: state.clone(),
            events_tx,
        };
        (
            MockLink {
                state,
                events_rx: Some(events_rx),
            },
            handle,
        )
    }

    fn record(&self, op: LinkOp) {
        self.state.lock().unwrap().ops.push(op);
    }

    fn require_connected(&self) -> Result<(), LinkError> {
        if self.state.lock().unwrap().connected {
            Ok(())
        } else {
            Err(LinkError::NotConnected)
        }
    }
}

#[async_trait]
impl GattLink for MockLink {
    async fn connect(&mut self, device: &DeviceHandle) -> Result<(), LinkError> {
        self.record(LinkOp::Connect(device.address.clone()));
        let mut state = self.state.lock().unwrap();
        state.epoch += 1;
        if let Some(err) = state.fail_connect.take() {
            return Err(err);
        }
        state.connected = true;
        Ok(())
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, LinkError> {
        self.record(LinkOp::Discover);
        self.require_connected()?;
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_discover.take() {
            return Err(err);
        }
        Ok(state.table.clone())
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, LinkError> {
        self.record(LinkOp::Read(uuid));
        self.require_connected()?;
        let state = self.state.lock().unwrap();
        if let Some(err) = state.fail_reads.get(&uuid) {
            return Err(err.clone());
        }
        Ok(state.values.get(&uuid).cloned().unwrap_or_default())
    }

    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), LinkError> {
        self.record(LinkOp::Write(uuid, value.to_vec()));
        self.require_connected()?;
        let mut state = self.state.lock().unwrap();
        if let Some(err) = state.fail_next_write.take() {
            if err.is_disconnect() {
                state.connected = false;
            }
            return Err(err);
        }
        state.values.insert(uuid, value.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, uuid: Uuid) -> Result<(), LinkError> {
        self.record(LinkOp::Subscribe(uuid));
        self.require_connected()
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.record(LinkOp::Disconnect);
        self.state.lock().unwrap().connected = false;
        Ok(())
    }

    async fn remove_bond(&mut self) -> Result<(), LinkError> {
        self.record(LinkOp::RemoveBond);
        Ok(())
    }

    fn epoch(&self) -> u64 {
        self.state.lock().unwrap().epoch
    }

    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<StampedEvent>> {
        self.events_rx.take()
    }
}
