use tmind_radio::{Capability, RadioError, SensorDevice};
use tokio::time::Duration;

use crate::settings::Settings;
use crate::telemetry::Sample;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    Completed,
    Failed(String),
    /// Not attempted because an earlier step for the capability failed
    Skipped,
}

impl StepOutcome {
    fn from_result<T>(res: &Result<T, RadioError>) -> Self {
        match res {
            Ok(_) => Self::Completed,
            Err(e) => Self::Failed(e.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_))
    }
}

/// What happened to each step of one capability during a tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityOutcome {
    pub capability: Capability,
    pub enable: StepOutcome,
    pub read: StepOutcome,
    pub disable: StepOutcome,
}

impl CapabilityOutcome {
    pub fn succeeded(&self) -> bool {
        self.read == StepOutcome::Completed
    }
}

#[derive(Debug, Clone)]
pub struct TickReport {
    pub sample: Sample,
    pub outcomes: Vec<CapabilityOutcome>,
}

/// Reads every enabled capability of a device, one at a time, in the fixed
/// order thermal, humidity, barometric, luminosity.
///
/// Each capability is enabled, given its settle delay, read and then
/// disabled again. At most one capability is powered on at any time, and
/// a failure in one capability never prevents the others from being tried.
#[derive(Debug, Clone)]
pub struct SensorReadSequencer {
    plan: Vec<(Capability, Duration)>,
}

impl SensorReadSequencer {
    pub fn new(plan: Vec<(Capability, Duration)>) -> Self {
        Self { plan }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(
            settings
                .enabled_capabilities()
                .map(|capability| (capability, settings.settle_delay(capability)))
                .collect(),
        )
    }

    pub fn plan(&self) -> &[(Capability, Duration)] {
        &self.plan
    }

    /// Run one sampling pass. An empty plan gives an empty sample
    pub async fn tick(&self, device: &dyn SensorDevice) -> TickReport {
        let mut sample = Sample::new();
        let mut outcomes = Vec::with_capacity(self.plan.len());

        for &(capability, settle) in &self.plan {
            outcomes.push(Self::sample_capability(device, capability, settle, &mut sample).await);
        }

        let failed = outcomes.iter().filter(|o| !o.succeeded()).count();
        if failed > 0 {
            log::warn!(
                "{}: {failed} of {} sensors not read this tick",
                device.id(),
                outcomes.len()
            );
        }

        TickReport { sample, outcomes }
    }

    async fn sample_capability(
        device: &dyn SensorDevice,
        capability: Capability,
        settle: Duration,
        sample: &mut Sample,
    ) -> CapabilityOutcome {
        let id = device.id();

        log::trace!("{id}: enable {capability}");
        let enable = StepOutcome::from_result(&device.enable(capability).await);

        let read = match enable {
            StepOutcome::Completed => {
                tokio::time::sleep(settle).await;
                match device.read(capability).await {
                    Ok(measurement) if measurement.capability() == capability => {
                        log::debug!("{id}: {measurement:?}");
                        sample.record(&measurement);
                        StepOutcome::Completed
                    }
                    Ok(measurement) => StepOutcome::Failed(format!(
                        "{} reading returned for {capability}",
                        measurement.capability()
                    )),
                    Err(e) => StepOutcome::Failed(e.to_string()),
                }
            }
            _ => StepOutcome::Skipped,
        };

        // Attempted whatever happened above so the sensor is never left on
        log::trace!("{id}: disable {capability}");
        let disable = StepOutcome::from_result(&device.disable(capability).await);

        for (step, outcome) in [("enable", &enable), ("read", &read), ("disable", &disable)] {
            if let StepOutcome::Failed(e) = outcome {
                log::warn!("{id}: {step} {capability} failed: {e}");
            }
        }

        CapabilityOutcome {
            capability,
            enable,
            read,
            disable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settings, MockDevice};
    use serde_json::json;

    fn plan(caps: &[Capability]) -> SensorReadSequencer {
        SensorReadSequencer::new(caps.iter().map(|c| (*c, Duration::from_millis(1))).collect())
    }

    #[test]
    fn plan_follows_enabled_flags_and_delays() {
        let settings = settings(json!({
            "TemperatureEnabled": true,
            "HumidityEnabled": false,
            "BarometricEnabled": true,
            "LuxometerEnabled": true,
            "EnableTimeout": 5,
            "SettleDelays": {"barometric": 30}
        }));
        let sequencer = SensorReadSequencer::from_settings(&settings);
        assert_eq!(
            sequencer.plan(),
            &[
                (Capability::Thermal, Duration::from_millis(5)),
                (Capability::Barometric, Duration::from_millis(30)),
                (Capability::Luminosity, Duration::from_millis(5)),
            ]
        );
    }

    #[tokio::test]
    async fn one_capability_powered_at_a_time() {
        let device = MockDevice::new("AA:BB").build();
        let report = plan(&Capability::ORDERED).tick(device.as_ref()).await;

        assert_eq!(
            device.calls(),
            vec![
                "enable thermal",
                "read thermal",
                "disable thermal",
                "enable humidity",
                "read humidity",
                "disable humidity",
                "enable barometric",
                "read barometric",
                "disable barometric",
                "enable luminosity",
                "read luminosity",
                "disable luminosity",
            ]
        );
        assert_eq!(
            report.sample.keys(),
            vec![
                "objectTemperature",
                "ambientTemperature",
                "temperature",
                "humidity",
                "pressure",
                "lux"
            ]
        );
        assert!(report.outcomes.iter().all(|o| o.succeeded()));
    }

    #[tokio::test]
    async fn failed_read_omits_keys_and_still_disables() {
        let device = MockDevice::new("AA:BB")
            .failing_read(Capability::Humidity)
            .build();
        let report = plan(&[Capability::Thermal, Capability::Humidity])
            .tick(device.as_ref())
            .await;

        assert_eq!(
            report.sample.keys(),
            vec!["objectTemperature", "ambientTemperature"]
        );
        assert!(report.outcomes[1].read.is_failure());
        assert_eq!(report.outcomes[1].disable, StepOutcome::Completed);
        assert!(device.calls().contains(&"disable humidity".to_string()));
    }

    #[tokio::test]
    async fn failed_enable_skips_read_but_not_disable() {
        let device = MockDevice::new("AA:BB")
            .failing_enable(Capability::Thermal)
            .build();
        let report = plan(&[Capability::Thermal, Capability::Luminosity])
            .tick(device.as_ref())
            .await;

        let thermal = &report.outcomes[0];
        assert!(thermal.enable.is_failure());
        assert_eq!(thermal.read, StepOutcome::Skipped);
        assert_eq!(thermal.disable, StepOutcome::Completed);
        assert!(!device.calls().contains(&"read thermal".to_string()));
        assert_eq!(report.sample.keys(), vec!["lux"]);
    }

    #[tokio::test]
    async fn empty_plan_gives_empty_sample() {
        let device = MockDevice::new("AA:BB").build();
        let report = plan(&[]).tick(device.as_ref()).await;
        assert!(report.sample.is_empty());
        assert!(device.calls().is_empty());
        assert_eq!(serde_json::to_string(&report.sample).unwrap(), "{}");
    }

    #[tokio::test]
    async fn lost_link_fails_every_step() {
        let device = MockDevice::new("AA:BB").build();
        device.drop_link();
        let report = plan(&[Capability::Thermal]).tick(device.as_ref()).await;
        assert!(report.sample.is_empty());
        assert!(report.outcomes[0].enable.is_failure());
        assert!(report.outcomes[0].disable.is_failure());
    }
}
