use crate::{detection::DetectionSet, serialization};
use anyhow::{Context, Result};
use rumqttc::{Client, ClientError, ConnectionError, Event, MqttOptions, Packet, QoS};
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outgoing MQTT requests buffered while the broker is unreachable.
const QUEUE_CAPACITY: usize = 10;

/// Receives one [`DetectionSet`] per processed frame, in submission order.
pub trait DetectionPublisher {
    fn publish(&mut self, detections: DetectionSet) -> Result<()>;
}

impl<P: DetectionPublisher + ?Sized> DetectionPublisher for Box<P> {
    fn publish(&mut self, detections: DetectionSet) -> Result<()> {
        (**self).publish(detections)
    }
}

/// One JSON document per line on stdout.
#[derive(Debug, Default)]
pub struct StdoutPublisher;

impl StdoutPublisher {
    pub fn new() -> Self {
        Self
    }
}

impl DetectionPublisher for StdoutPublisher {
    fn publish(&mut self, detections: DetectionSet) -> Result<()> {
        let payload =
            serialization::to_json(&detections).context("Failed to serialize detections")?;
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{payload}").context("Failed to write detections to stdout")?;
        Ok(())
    }
}

/// Publishes detection arrays as JSON on an MQTT topic.
///
/// The connection is driven by a background thread that reconnects with
/// exponential backoff. Publishing never blocks on the broker: when the
/// outgoing queue is full the set is dropped and counted.
pub struct MqttPublisher {
    client: Client,
    topic: String,
    connected: Arc<AtomicBool>,
    dropped: u64,
}

impl MqttPublisher {
    pub fn new(broker_host: &str, broker_port: u16, topic: String, client_id: &str) -> Result<Self> {
        let mut mqtt_options = MqttOptions::new(client_id, broker_host, broker_port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));
        mqtt_options.set_clean_session(true);

        let (client, mut connection) = Client::new(mqtt_options, QUEUE_CAPACITY);
        let connected = Arc::new(AtomicBool::new(false));
        let connected_clone = Arc::clone(&connected);

        std::thread::Builder::new()
            .name("mqtt-connection".to_string())
            .spawn(move || {
                let mut reconnect_attempts = 0u32;

                loop {
                    for notification in connection.iter() {
                        match notification {
                            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                                connected_clone.store(true, Ordering::Release);
                                reconnect_attempts = 0;
                                tracing::info!("MQTT connected to broker");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                connected_clone.store(false, Ordering::Release);
                                match &e {
                                    ConnectionError::Io(_) | ConnectionError::NetworkTimeout => {
                                        reconnect_attempts = reconnect_attempts.saturating_add(1);
                                        let backoff = calculate_backoff(reconnect_attempts);
                                        tracing::warn!(
                                            error = %e,
                                            attempt = reconnect_attempts,
                                            backoff_ms = backoff.as_millis(),
                                            "MQTT connection lost, reconnecting"
                                        );
                                        std::thread::sleep(backoff);
                                    }
                                    _ => {
                                        tracing::error!(error = %e, "MQTT error");
                                    }
                                }
                            }
                        }
                    }

                    // the iterator ends on disconnect; iterating again reconnects
                    connected_clone.store(false, Ordering::Release);
                    reconnect_attempts = reconnect_attempts.saturating_add(1);
                    let backoff = calculate_backoff(reconnect_attempts);
                    tracing::warn!(
                        attempt = reconnect_attempts,
                        backoff_ms = backoff.as_millis(),
                        "MQTT connection closed, attempting reconnect"
                    );
                    std::thread::sleep(backoff);
                }
            })
            .context("Failed to spawn MQTT connection thread")?;

        tracing::info!(
            broker = %format!("{}:{}", broker_host, broker_port),
            topic = %topic,
            client_id,
            "MQTT publisher initialized"
        );

        Ok(Self {
            client,
            topic,
            connected,
            dropped: 0,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Sets discarded because the outgoing queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl DetectionPublisher for MqttPublisher {
    fn publish(&mut self, detections: DetectionSet) -> Result<()> {
        let payload =
            serialization::to_json(&detections).context("Failed to serialize detections")?;

        if !self.is_connected() {
            tracing::debug!(
                frame_id = detections.meta().frame_id,
                "Broker not connected yet, message queued"
            );
        }

        match self
            .client
            .try_publish(&self.topic, QoS::AtLeastOnce, false, payload.into_bytes())
        {
            Ok(()) => {}
            Err(ClientError::TryRequest(_)) => {
                self.dropped += 1;
                tracing::warn!(
                    frame_id = detections.meta().frame_id,
                    dropped = self.dropped,
                    connected = self.is_connected(),
                    "MQTT queue full, detections dropped"
                );
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to publish MQTT message"),
        }

        tracing::trace!(
            frame_id = detections.meta().frame_id,
            detections = detections.len(),
            "Detections published"
        );
        Ok(())
    }
}

/// Exponential backoff with jitter, capped at 30 seconds
fn calculate_backoff(attempt: u32) -> Duration {
    const BASE_MS: u64 = 100;
    const MAX_MS: u64 = 30_000;

    let exp_backoff = BASE_MS.saturating_mul(2u64.saturating_pow(attempt.min(10)));
    let capped = exp_backoff.min(MAX_MS);

    let jitter = (capped / 10).max(1);
    let jittered = capped.saturating_add(fastrand::u64(0..jitter));

    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::detection::FrameMeta;
    use std::time::Instant;

    #[test]
    fn test_unreachable_broker_does_not_block_publishing() {
        let mut publisher =
            MqttPublisher::new("127.0.0.1", 1, "detections".to_string(), "test_node").unwrap();

        let start = Instant::now();
        for frame_id in 0..40 {
            let meta = FrameMeta {
                frame_id,
                source: "test".to_string(),
                timestamp_ns: 0,
                width: 8,
                height: 8,
            };
            publisher.publish(DetectionSet::empty(meta)).unwrap();
        }

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!publisher.is_connected());
        assert!(publisher.dropped() > 0);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let first = calculate_backoff(1);
        assert!(first >= Duration::from_millis(200) && first < Duration::from_millis(220));

        let capped = calculate_backoff(30);
        assert!(capped >= Duration::from_millis(30_000));
        assert!(capped < Duration::from_millis(33_000));
    }
}
