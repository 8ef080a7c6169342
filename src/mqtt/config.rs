use crate::persistence::BridgeSettings;
use crate::topics::bridge_identifier;
use rumqttc::MqttOptions;
use std::time::Duration;

/// Connection parameters of the broker client, derived from the bridge settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub client_id: String,
    pub host: String,
    pub port: u16,
    pub credentials: Option<(String, String)>,
    pub keep_alive: Duration,
    /// Capacity of the client request queue and of the inbound message channel
    pub channel_capacity: usize,
    /// Pause after a connection error before the event loop reconnects
    pub retry_delay: Duration,
}

impl MqttConfig {
    pub fn from_settings(settings: &BridgeSettings) -> Self {
        let credentials = settings
            .user
            .clone()
            .map(|user| (user, settings.pw.clone().unwrap_or_default()));

        Self {
            client_id: bridge_identifier(settings),
            host: settings.ip.clone(),
            port: settings.port,
            credentials,
            keep_alive: Duration::from_secs(60),
            channel_capacity: 100,
            retry_delay: Duration::from_secs(5),
        }
    }

    pub fn options(&self) -> MqttOptions {
        let mut mqtt_options = MqttOptions::new(&self.client_id, &self.host, self.port);
        mqtt_options.set_keep_alive(self.keep_alive);
        if let Some((user, pw)) = &self.credentials {
            mqtt_options.set_credentials(user, pw);
        }
        mqtt_options
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::tests::sample_settings;

    #[test]
    fn test_from_settings() {
        let config = MqttConfig::from_settings(&sample_settings());
        assert_eq!(config.client_id, "device2mqtt_TestNode");
        assert_eq!(config.host, "broker.local");
        assert_eq!(config.port, 1883);
        assert_eq!(
            config.credentials,
            Some(("user".to_string(), "secret".to_string()))
        );

        let options = config.options();
        assert_eq!(options.client_id(), "device2mqtt_TestNode");
        assert_eq!(options.broker_address(), ("broker.local".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn test_anonymous() {
        let mut settings = sample_settings();
        settings.user = None;
        settings.pw = None;
        let config = MqttConfig::from_settings(&settings);
        assert_eq!(config.credentials, None);
        assert_eq!(config.options().credentials(), None);
    }
}
