use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, Transport};
use secrecy::ExposeSecret;
use serde::Serialize;
use thiserror::Error;
use tokio::time::Duration;

use crate::settings::BrokerSettings;

/// Capacity of the client request queue. Publishes beyond this while the
/// broker is unreachable are dropped, not queued
const REQUEST_QUEUE_CAP: usize = 64;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("MQTT client Error")]
    Client(#[from] rumqttc::ClientError),
    #[error("Payload serialize Error")]
    Serialize(#[from] serde_json::Error),
}

/// Single outlet for everything the gateway reports. Implementations own
/// the broker connection and its retry policy; callers treat a publish as
/// fire-and-forget and only log failures
#[async_trait::async_trait]
pub trait TelemetryPublisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;
}

/// Serialise `value` as JSON and hand it to the publisher
pub(crate) async fn publish_json<T: Serialize + Sync>(
    publisher: &dyn TelemetryPublisher,
    topic: &str,
    value: &T,
) -> Result<(), PublishError> {
    let payload = serde_json::to_vec(value)?;
    log::info!("{topic} {}", String::from_utf8_lossy(&payload));
    publisher.publish(topic, payload).await
}

/// [`TelemetryPublisher`] over an MQTT broker. The rumqttc event loop is
/// driven by a background task for as long as the publisher lives; that task
/// reconnects on its own after `reconnect_period`
pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    retain: bool,
    driver: tokio::task::JoinHandle<()>,
}

impl MqttPublisher {
    /// Must be called from within a tokio runtime
    pub fn new(settings: &BrokerSettings) -> Self {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
        options.set_keep_alive(settings.keep_alive);

        if let Some(username) = &settings.username {
            let password = settings
                .password
                .as_ref()
                .map(|p| p.expose_secret().to_string())
                .unwrap_or_default();
            options.set_credentials(username, password);
        }

        if settings.tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, event_loop) = AsyncClient::new(options, REQUEST_QUEUE_CAP);
        let broker = format!("{}:{}", settings.host, settings.port);
        let driver = tokio::spawn(Self::drive(event_loop, settings.reconnect_period, broker));

        Self {
            client,
            qos: qos_from_level(settings.qos),
            retain: settings.retain,
            driver,
        }
    }

    /// Send DISCONNECT; best effort, the connection closes either way
    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            log::warn!("Error sending disconnect packet: {e:}");
        }
    }

    async fn drive(mut event_loop: EventLoop, reconnect_period: Duration, broker: String) {
        log::info!("Connecting to broker {broker}");
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    log::info!("Connected to broker {broker} ({:?})", ack.code);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    log::warn!("Disconnected by broker {broker}");
                }
                Ok(event) => {
                    log::trace!("mqtt event {event:?}");
                }
                Err(e) => {
                    log::error!(
                        "Broker connection error {e:}, polling again in {:?}",
                        reconnect_period
                    );
                    tokio::time::sleep(reconnect_period).await;
                }
            }
        }
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtMostOnce,
    }
}

#[async_trait::async_trait]
impl TelemetryPublisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        // try_publish never waits on a full queue, so a dead broker can not
        // stall a session
        self.client
            .try_publish(topic, self.qos, self.retain, payload)
            .map_err(|e| {
                log::error!("Failure to publish to {topic}: {e:}");
                PublishError::from(e)
            })
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.driver.abort();
    }
}
