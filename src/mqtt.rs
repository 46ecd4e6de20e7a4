use anyhow::{bail, Context, Result};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use serde::Deserialize;
use std::time::Duration;
use tokio::task::JoinHandle;

const REQUEST_CHANNEL_CAPACITY: usize = 10;

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default = "MqttConfig::default_qos")]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive_interval",
        with = "humantime_serde"
    )]
    keep_alive_interval: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_interval",
        with = "humantime_serde"
    )]
    reconnect_interval: Duration,
}

impl MqttConfig {
    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "evcharger".into()
    }

    fn default_qos() -> u8 {
        0
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distr::Alphanumeric;
        use rand::Rng;

        rand::rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("evcharger-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive_interval() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_interval() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        config.quality_of_service()?;
        Ok(config)
    }

    fn quality_of_service(&self) -> Result<QoS> {
        Ok(match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => bail!("Invalid MQTT QoS {other}, expected 0, 1 or 2"),
        })
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options
            .set_keep_alive(self.keep_alive_interval)
            .set_clean_session(true);
        if let Some(username) = &self.username {
            options.set_credentials(username, self.password.as_deref().unwrap_or_default());
        }
        options
    }
}

/// Drives the MQTT connection. rumqttc reconnects on the next poll after an error.
async fn drive(mut event_loop: EventLoop, reconnect_interval: Duration) {
    loop {
        match event_loop.poll().await {
            Ok(notification) => log::trace!("MQTT notification: {notification:?}"),
            Err(err) => {
                log::error!("MQTT connection error: {err}");
                tokio::time::sleep(reconnect_interval).await;
            }
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    qos: QoS,
    config: MqttConfig,
    connection: JoinHandle<()>,
}

impl MqttPublisher {
    /// Must be called inside a tokio runtime, the connection runs on a spawned task.
    pub fn new(config: MqttConfig) -> Result<Self> {
        let qos = config.quality_of_service()?;
        log::info!(
            "Connecting to MQTT broker: {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, event_loop) = AsyncClient::new(config.options(), REQUEST_CHANNEL_CAPACITY);
        let connection = tokio::spawn(drive(event_loop, config.reconnect_interval));
        Ok(Self {
            client,
            qos,
            config,
            connection,
        })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    pub async fn publish(&self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{topic}', Payload='{payload}', QoS={:?}",
            self.qos
        );
        self.client
            .publish(topic, self.qos, false, payload.as_bytes().to_vec())
            .await
            .with_context(|| format!("Failed to publish message to MQTT topic: {topic}"))?;
        Ok(())
    }
}

impl Drop for MqttPublisher {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn load_with_defaults() {
        let file = write_config("host: broker.local\n");
        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(config.topic, "evcharger");
        assert_eq!(config.qos, 0);
        assert!(config.client_id.starts_with("evcharger-"));
        assert_eq!(config.client_id.len(), "evcharger-".len() + 8);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(30));
        assert!(config.username.is_none());
    }

    #[test]
    fn load_full_config() {
        let file = write_config(
            "host: 10.0.0.2\nport: 8883\nusername: user\npassword: secret\ntopic: garage/charger\n\
             qos: 1\nclient_id: wallbox\nkeep_alive_interval: 1m\nreconnect_interval: 500ms\n",
        );
        let config = MqttConfig::load(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.port, 8883);
        assert_eq!(config.topic, "garage/charger");
        assert_eq!(config.client_id, "wallbox");
        assert_eq!(config.quality_of_service().unwrap(), QoS::AtLeastOnce);
        assert_eq!(config.keep_alive_interval, Duration::from_secs(60));
        assert_eq!(config.reconnect_interval, Duration::from_millis(500));
    }

    #[test]
    fn invalid_qos_is_rejected() {
        let file = write_config("host: broker.local\nqos: 3\n");
        assert!(MqttConfig::load(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn missing_file() {
        assert!(MqttConfig::load("/nonexistent/mqtt.yaml").is_err());
    }
}
