//! Outbound MQTT publishing, kept optional: a deployment with no broker
//! configured runs the rest of the system unaffected.

use crate::error::BrokerError;
use std::sync::Mutex;
use std::time::Duration;

pub trait BrokerClient: Send + Sync {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError>;
}

pub struct NullBroker;

impl BrokerClient for NullBroker {
    fn publish(&self, _topic: &str, _payload: &str) -> Result<(), BrokerError> {
        Ok(())
    }
}

pub struct MqttBroker {
    client: rumqttc::Client,
    _connection_thread: std::thread::JoinHandle<()>,
    topic_prefix: String,
    last_error: Mutex<Option<String>>,
}

impl MqttBroker {
    pub fn connect(host: &str, port: u16, username: Option<&str>, password: Option<&str>, topic_prefix: &str) -> Self {
        let mut opts = rumqttc::MqttOptions::new("rds-guard", host, port);
        opts.set_keep_alive(Duration::from_secs(30));
        if let (Some(u), Some(p)) = (username, password) {
            opts.set_credentials(u, p);
        }
        let (client, mut connection) = rumqttc::Client::new(opts, 10);

        let thread = std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || {
                for notification in connection.iter() {
                    if let Err(e) = notification {
                        tracing::warn!(error = %e, "mqtt connection event");
                    }
                }
            })
            .expect("failed to spawn mqtt connection thread");

        MqttBroker {
            client,
            _connection_thread: thread,
            topic_prefix: topic_prefix.to_string(),
            last_error: Mutex::new(None),
        }
    }
}

impl BrokerClient for MqttBroker {
    fn publish(&self, topic: &str, payload: &str) -> Result<(), BrokerError> {
        let full_topic = format!("{}/{}", self.topic_prefix, topic);
        self.client
            .publish(full_topic, rumqttc::QoS::AtLeastOnce, false, payload.as_bytes())
            .map_err(|e| {
                *self.last_error.lock().unwrap() = Some(e.to_string());
                BrokerError::PublishFailed(e.to_string())
            })
    }
}
