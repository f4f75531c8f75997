//! In-memory radio, device and publisher used by the unit tests

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};
use tmind_radio::{
    Capability, DeviceId, DiscoveryStream, Measurement, RadioError, SensorDevice, SensorRadio,
};
use tokio::{
    sync::{
        mpsc::{unbounded_channel, UnboundedSender},
        watch,
    },
    time::Duration,
};

use crate::publisher::{PublishError, TelemetryPublisher};
use crate::settings::Settings;

/// Test settings: one known device `AA:BB`, publisher `test-gw`, no
/// capability enabled and millisecond timings, with `overrides` merged in
pub(crate) fn settings(overrides: serde_json::Value) -> Arc<Settings> {
    let mut base = serde_json::json!({
        "SensorTags": ["AA:BB"],
        "Timeout": 200,
        "Interval": 50,
        "EnableTimeout": 1,
        "MQTTHost": "localhost",
        "MQTTPort": 1883,
        "MQTTTls": false,
        "PublisherId": "test-gw"
    });
    if let (Some(base), Some(overrides)) = (base.as_object_mut(), overrides.as_object()) {
        for (k, v) in overrides {
            base.insert(k.clone(), v.clone());
        }
    }
    Arc::new(Settings::from_json_str(&base.to_string()).unwrap())
}

#[derive(Default)]
pub(crate) struct MockRadio {
    sender: Mutex<Option<UnboundedSender<Arc<dyn SensorDevice>>>>,
    starts: AtomicUsize,
    stops: AtomicUsize,
}

impl MockRadio {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Deliver an advertisement. False when no scan is running
    pub fn advertise(&self, device: Arc<MockDevice>) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(tx) => tx.send(device).is_ok(),
            None => false,
        }
    }

    /// Scanner dies on its own
    pub fn end_scan(&self) {
        self.sender.lock().unwrap().take();
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SensorRadio for MockRadio {
    async fn start_discovery(&self) -> Result<DiscoveryStream, RadioError> {
        let (tx, rx) = unbounded_channel();
        *self.sender.lock().unwrap() = Some(tx);
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        self.sender.lock().unwrap().take();
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Scripted SensorTag. Every call is recorded; all calls fail with
/// `LinkDown` once the link is dropped
pub(crate) struct MockDevice {
    id: DeviceId,
    kind: String,
    firmware: Option<String>,
    fail_setup: bool,
    failing_enables: HashSet<Capability>,
    failing_reads: HashSet<Capability>,
    read_delay: Duration,
    calls: Mutex<Vec<String>>,
    link: watch::Sender<bool>,
}

impl MockDevice {
    pub fn new(id: &str) -> Self {
        Self {
            id: DeviceId::new(id),
            kind: "cc2650".to_string(),
            firmware: None,
            fail_setup: false,
            failing_enables: HashSet::new(),
            failing_reads: HashSet::new(),
            read_delay: Duration::ZERO,
            calls: Mutex::new(vec![]),
            link: watch::channel(true).0,
        }
    }

    pub fn firmware(mut self, revision: &str) -> Self {
        self.firmware = Some(revision.to_string());
        self
    }

    pub fn failing_setup(mut self) -> Self {
        self.fail_setup = true;
        self
    }

    pub fn failing_enable(mut self, capability: Capability) -> Self {
        self.failing_enables.insert(capability);
        self
    }

    pub fn failing_read(mut self, capability: Capability) -> Self {
        self.failing_reads.insert(capability);
        self
    }

    pub fn read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn build(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Radio-level link loss
    pub fn drop_link(&self) {
        self.link.send_replace(false);
    }

    fn call(&self, name: String) -> Result<(), RadioError> {
        self.calls.lock().unwrap().push(name);
        if *self.link.borrow() {
            Ok(())
        } else {
            Err(RadioError::LinkDown(self.id.clone()))
        }
    }
}

#[async_trait::async_trait]
impl SensorDevice for MockDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn connect_and_setup(&self) -> Result<(), RadioError> {
        self.call("connect".to_string())?;
        if self.fail_setup {
            return Err(RadioError::Command("connect error".to_string()));
        }
        Ok(())
    }

    async fn read_device_name(&self) -> Result<String, RadioError> {
        self.call("read name".to_string())?;
        Ok("SensorTag 2.0".to_string())
    }

    async fn read_firmware_revision(&self) -> Result<String, RadioError> {
        self.call("read firmware".to_string())?;
        self.firmware
            .clone()
            .ok_or_else(|| RadioError::Command("no firmware characteristic".to_string()))
    }

    async fn read_manufacturer_name(&self) -> Result<String, RadioError> {
        self.call("read manufacturer".to_string())?;
        Ok("Texas Instruments".to_string())
    }

    async fn enable(&self, capability: Capability) -> Result<(), RadioError> {
        self.call(format!("enable {capability}"))?;
        if self.failing_enables.contains(&capability) {
            return Err(RadioError::Command(format!("write {capability} config")));
        }
        Ok(())
    }

    async fn read(&self, capability: Capability) -> Result<Measurement, RadioError> {
        self.call(format!("read {capability}"))?;
        tokio::time::sleep(self.read_delay).await;
        if self.failing_reads.contains(&capability) {
            return Err(RadioError::Command(format!("read {capability} data")));
        }
        Ok(match capability {
            Capability::Thermal => Measurement::IrTemperature {
                object: 23.5,
                ambient: 22.1,
            },
            Capability::Humidity => Measurement::Humidity {
                temperature: 21.9,
                humidity: 45.3,
            },
            Capability::Barometric => Measurement::Pressure { pressure: 1013.25 },
            Capability::Luminosity => Measurement::Lux { lux: 120.0 },
        })
    }

    async fn disable(&self, capability: Capability) -> Result<(), RadioError> {
        self.call(format!("disable {capability}"))
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.calls.lock().unwrap().push("disconnect".to_string());
        self.link.send_replace(false);
        Ok(())
    }

    async fn wait_disconnected(&self) {
        let mut link = self.link.subscribe();
        while *link.borrow_and_update() {
            if link.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Keeps every publish as `(topic, parsed JSON)`
#[derive(Default)]
pub(crate) struct RecordingPublisher {
    published: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn published(&self) -> Vec<(String, serde_json::Value)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl TelemetryPublisher for RecordingPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let value = serde_json::from_slice(&payload)?;
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), value));
        Ok(())
    }
}
