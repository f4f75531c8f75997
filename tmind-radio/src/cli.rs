//! Lazy implementation of the [`crate::SensorRadio`] and
//! [`crate::SensorDevice`] traits on top of the BlueZ command line tools.
//! Discovery runs `hcitool lescan` for as long as the window is open; every
//! device request is one `gatttool` process, so no link is held open between
//! requests and a failed connect is what tells us the device is gone.

use std::{collections::HashMap, process::Stdio, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::{Child, Command},
    sync::{mpsc::unbounded_channel, watch, Mutex},
    task::JoinHandle,
    time::{timeout, Duration},
};

use crate::{
    convert, Capability, DeviceId, DiscoveryStream, Measurement, RadioError, SensorDevice,
    SensorRadio,
};

const GATT_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_STOP_GRACE: Duration = Duration::from_secs(2);

// IR temperature service, present on every CC2650
const IR_TEMPERATURE_SERVICE: &str = "f000aa00-0451-4000-b000-000000000000";

const DEVICE_NAME_UUID: &str = "2a00";
const FIRMWARE_REVISION_UUID: &str = "2a26";
const MANUFACTURER_NAME_UUID: &str = "2a29";

struct Scanner {
    child: Child,
    reader: JoinHandle<()>,
}

pub struct GattCliRadio {
    adapter: String,
    scanner: Mutex<Option<Scanner>>,
}

impl GattCliRadio {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self {
            adapter: adapter.into(),
            scanner: Mutex::new(None),
        }
    }

    /// Parse one line of `hcitool lescan` output, e.g.
    /// `B0:B4:48:C9:12:34 CC2650 SensorTag`
    fn parse_lescan_line(line: &str) -> Option<(String, String)> {
        let line = line.trim();
        let (addr, name) = match line.split_once(' ') {
            Some((addr, name)) => (addr, name.trim()),
            None => (line, ""),
        };

        if !is_bd_addr(addr) {
            return None;
        }
        Some((addr.to_string(), name.to_string()))
    }

    fn kind_from_name(name: &str) -> &'static str {
        if name.contains("CC2650") {
            "cc2650"
        } else if name.contains("SensorTag") {
            "cc2540"
        } else {
            "unknown"
        }
    }
}

fn is_bd_addr(addr: &str) -> bool {
    let octets = addr.split(':').collect::<Vec<_>>();
    octets.len() == 6
        && octets
            .iter()
            .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()))
}

#[async_trait::async_trait]
impl SensorRadio for GattCliRadio {
    async fn start_discovery(&self) -> Result<DiscoveryStream, RadioError> {
        let mut scanner = self.scanner.lock().await;
        if scanner.is_some() {
            return Err(RadioError::Busy(format!(
                "lescan already running on {}",
                self.adapter
            )));
        }

        let mut child = Command::new("hcitool")
            .args(["-i", self.adapter.as_str(), "lescan", "--duplicates"])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| RadioError::Command("lescan stdout unavailable".to_string()))?;

        let (sender, receiver) = unbounded_channel();
        let adapter = self.adapter.clone();

        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            // Scan responses carry the name, plain advertisements print
            // "(unknown)", so remember the last name seen per address
            let mut names: HashMap<String, &'static str> = HashMap::new();

            while let Ok(Some(line)) = lines.next_line().await {
                let Some((addr, name)) = GattCliRadio::parse_lescan_line(&line) else {
                    continue;
                };

                let kind = match GattCliRadio::kind_from_name(&name) {
                    "unknown" => names.get(&addr).copied().unwrap_or("unknown"),
                    kind => {
                        names.insert(addr.clone(), kind);
                        kind
                    }
                };

                log::trace!("lescan: {addr} {name:?} ({kind})");
                let device: Arc<dyn SensorDevice> =
                    Arc::new(GattCliDevice::new(adapter.clone(), addr, kind));
                if sender.send(device).is_err() {
                    break;
                }
            }
            log::debug!("lescan output closed");
        });

        *scanner = Some(Scanner { child, reader });
        log::debug!("lescan started on {}", self.adapter);
        Ok(receiver)
    }

    async fn stop_discovery(&self) -> Result<(), RadioError> {
        let Some(mut scanner) = self.scanner.lock().await.take() else {
            return Ok(());
        };

        // lescan only disables scanning on the controller when it gets
        // SIGINT. Child::kill sends SIGKILL, which leaves the controller
        // scanning, so the interrupt goes through kill(1)
        if let Some(pid) = scanner.child.id() {
            Command::new("kill")
                .args(["-INT", pid.to_string().as_str()])
                .status()
                .await
                .map_err(|e| {
                    log::warn!("Unable to interrupt lescan {e:}");
                })
                .ok();
        }

        if timeout(SCAN_STOP_GRACE, scanner.child.wait()).await.is_err() {
            log::warn!("lescan did not exit after SIGINT, killing");
            scanner.child.kill().await?;
        }
        scanner.reader.abort();
        log::debug!("lescan stopped on {}", self.adapter);
        Ok(())
    }
}

/// One CC2650 SensorTag reached through `gatttool`
pub struct GattCliDevice {
    adapter: String,
    id: DeviceId,
    kind: String,
    link: watch::Sender<bool>,
}

impl GattCliDevice {
    pub fn new(adapter: impl Into<String>, addr: impl Into<String>, kind: &str) -> Self {
        let (link, _) = watch::channel(true);
        Self {
            adapter: adapter.into(),
            id: DeviceId::new(addr),
            kind: kind.to_string(),
            link,
        }
    }

    /// (data, configuration) characteristic value handles
    fn handles(capability: Capability) -> (u16, u16) {
        match capability {
            Capability::Thermal => (0x0021, 0x0024),
            Capability::Humidity => (0x0029, 0x002c),
            Capability::Barometric => (0x0031, 0x0034),
            Capability::Luminosity => (0x0041, 0x0044),
        }
    }

    fn link_lost(&self, reason: &str) {
        if self.link.send_replace(false) {
            log::warn!("Link to {} lost: {reason}", self.id);
        }
    }

    async fn gatttool(&self, args: &[&str]) -> Result<String, RadioError> {
        if !*self.link.borrow() {
            return Err(RadioError::LinkDown(self.id.clone()));
        }

        let output = Command::new("gatttool")
            .args(["-i", self.adapter.as_str(), "-b", self.id.as_str()])
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = match timeout(GATT_TIMEOUT, output).await {
            Ok(output) => output?,
            Err(_) => {
                self.link_lost("request timed out");
                return Err(RadioError::Timeout(format!("{} {:?}", self.id, args)));
            }
        };

        let stdout = std::str::from_utf8(&output.stdout)?.to_string();
        let stderr = std::str::from_utf8(&output.stderr)?.trim().to_string();

        if stderr.contains("connect error") || stdout.contains("connect error") {
            self.link_lost(&stderr);
            return Err(RadioError::LinkDown(self.id.clone()));
        }

        if !output.status.success() {
            return Err(RadioError::Command(format!(
                "gatttool {:?} exit status {:?}: {}",
                args, output.status, stderr
            )));
        }

        Ok(stdout)
    }

    /// Pull the value bytes out of `gatttool --char-read` output. Both forms
    /// put the hex bytes after the last colon:
    /// `Characteristic value/descriptor: 9c 0b 8c 0d`
    /// `handle: 0x0003 \t value: 53 65 6e 73 6f 72 54 61 67`
    fn parse_char_read_output(output: &str) -> Result<Vec<u8>, RadioError> {
        let line = output
            .lines()
            .find(|l| l.contains("value"))
            .ok_or_else(|| RadioError::Command(format!("No value in output {output:?}")))?;

        let hex_str = line
            .rsplit_once(':')
            .map(|(_, bytes)| bytes)
            .unwrap_or_default()
            .split_whitespace()
            .collect::<String>();

        Ok(hex::decode(hex_str)?)
    }

    async fn read_string(&self, uuid: &str) -> Result<String, RadioError> {
        let out = self
            .gatttool(&["--char-read", &format!("--uuid={uuid}")])
            .await?;
        let bytes = Self::parse_char_read_output(&out)?;
        Ok(std::str::from_utf8(&bytes)?
            .trim_end_matches('\0')
            .trim()
            .to_string())
    }

    async fn write_config(&self, capability: Capability, value: &str) -> Result<(), RadioError> {
        let (_, config) = Self::handles(capability);
        let out = self
            .gatttool(&[
                "--char-write-req",
                "-a",
                &format!("0x{config:04x}"),
                "-n",
                value,
            ])
            .await?;

        if out.contains("written successfully") {
            Ok(())
        } else {
            Err(RadioError::Command(format!(
                "Write {value} to {capability} config failed: {}",
                out.trim()
            )))
        }
    }
}

#[async_trait::async_trait]
impl SensorDevice for GattCliDevice {
    fn id(&self) -> &DeviceId {
        &self.id
    }

    fn kind(&self) -> &str {
        &self.kind
    }

    async fn connect_and_setup(&self) -> Result<(), RadioError> {
        let services = self.gatttool(&["--primary"]).await?;
        if services.contains(IR_TEMPERATURE_SERVICE) {
            Ok(())
        } else {
            Err(RadioError::Unsupported(format!(
                "{} ({}) has no sensor services",
                self.id, self.kind
            )))
        }
    }

    async fn read_device_name(&self) -> Result<String, RadioError> {
        self.read_string(DEVICE_NAME_UUID).await
    }

    async fn read_firmware_revision(&self) -> Result<String, RadioError> {
        self.read_string(FIRMWARE_REVISION_UUID).await
    }

    async fn read_manufacturer_name(&self) -> Result<String, RadioError> {
        self.read_string(MANUFACTURER_NAME_UUID).await
    }

    async fn enable(&self, capability: Capability) -> Result<(), RadioError> {
        self.write_config(capability, "01").await
    }

    async fn read(&self, capability: Capability) -> Result<Measurement, RadioError> {
        let (data, _) = Self::handles(capability);
        let out = self
            .gatttool(&["--char-read", "-a", &format!("0x{data:04x}")])
            .await?;
        let bytes = Self::parse_char_read_output(&out)?;
        convert::cc2650(capability, &bytes)
    }

    async fn disable(&self, capability: Capability) -> Result<(), RadioError> {
        self.write_config(capability, "00").await
    }

    async fn disconnect(&self) -> Result<(), RadioError> {
        self.link_lost("closed by session");
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_parse_lescan_lines() {
        assert_eq!(
            GattCliRadio::parse_lescan_line("B0:B4:48:C9:12:34 CC2650 SensorTag\n"),
            Some((
                "B0:B4:48:C9:12:34".to_string(),
                "CC2650 SensorTag".to_string()
            ))
        );
        assert_eq!(
            GattCliRadio::parse_lescan_line("54:6C:0E:52:F3:A1 (unknown)"),
            Some(("54:6C:0E:52:F3:A1".to_string(), "(unknown)".to_string()))
        );
        assert_eq!(GattCliRadio::parse_lescan_line("LE Scan ..."), None);
        assert_eq!(GattCliRadio::parse_lescan_line(""), None);
        assert_eq!(GattCliRadio::parse_lescan_line("B0:B4:48:C9:12 short"), None);
    }

    #[test]
    fn check_kind_from_name() {
        assert_eq!(GattCliRadio::kind_from_name("CC2650 SensorTag"), "cc2650");
        assert_eq!(GattCliRadio::kind_from_name("SensorTag"), "cc2540");
        assert_eq!(GattCliRadio::kind_from_name("(unknown)"), "unknown");
    }

    #[test]
    fn check_parse_char_read_by_handle() {
        let out = "Characteristic value/descriptor: 9c 0b 8c 0d \n";
        assert_eq!(
            GattCliDevice::parse_char_read_output(out).unwrap(),
            vec![0x9c, 0x0b, 0x8c, 0x0d]
        );
    }

    #[test]
    fn check_parse_char_read_by_uuid() {
        let out = "handle: 0x0014 \t value: 31 2e 34 30 20 28 4a 75 6c 20 31 33 20 32 30 31 36 29 00 \n";
        let bytes = GattCliDevice::parse_char_read_output(out).unwrap();
        let s = std::str::from_utf8(&bytes).unwrap().trim_end_matches('\0');
        assert_eq!(s, "1.40 (Jul 13 2016)");
    }

    #[test]
    fn check_parse_char_read_garbage() {
        assert!(matches!(
            GattCliDevice::parse_char_read_output("Read characteristics by UUID failed"),
            Err(RadioError::Command(_))
        ));
        assert!(matches!(
            GattCliDevice::parse_char_read_output("Characteristic value/descriptor: zz"),
            Err(RadioError::Hex(_))
        ));
    }

    #[tokio::test]
    async fn disconnect_resolves_waiters_and_blocks_requests() {
        let device = Arc::new(GattCliDevice::new("hci0", "B0:B4:48:C9:12:34", "cc2650"));
        let waiter = {
            let device = device.clone();
            tokio::spawn(async move { device.wait_disconnected().await })
        };

        device.disconnect().await.unwrap();
        timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter not woken")
            .unwrap();

        // No process is spawned once the link is down
        assert!(matches!(
            device.enable(Capability::Thermal).await,
            Err(RadioError::LinkDown(_))
        ));
    }
}
