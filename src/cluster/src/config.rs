/// Default address other brokers use to reach this one
pub const DEFAULT_BROKER_URL: &str = "amqp:tcp:127.0.0.1:5672";

/// HA settings for one broker
#[derive(Debug, Clone)]
pub struct HaSettings {
    pub node_id: String,
    /// Address list brokers use to reach each other
    pub broker_url: String,
    /// Address list advertised to clients; the broker URL when not set
    pub client_url: Option<String>,
    /// HA cannot run without the management agent
    pub management_enabled: bool,
}

impl HaSettings {
    pub fn new(node_id: &str, broker_url: &str) -> Self {
        HaSettings {
            node_id: node_id.to_string(),
            broker_url: broker_url.to_string(),
            client_url: None,
            management_enabled: true,
        }
    }

    pub fn from_env() -> Self {
        let node_id = std::env::var("QUAY_NODE_ID").unwrap_or_else(|_| "quay-1".to_string());

        let broker_url = std::env::var("QUAY_HA_BROKER_URL")
            .unwrap_or_else(|_| DEFAULT_BROKER_URL.to_string());

        let client_url = std::env::var("QUAY_HA_CLIENT_URL")
            .ok()
            .filter(|v| !v.trim().is_empty());

        let management_enabled = std::env::var("QUAY_MANAGEMENT")
            .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no" | "off"))
            .unwrap_or(true);

        HaSettings {
            node_id,
            broker_url,
            client_url,
            management_enabled,
        }
    }

    /// Client URL, falling back to the broker URL
    pub fn effective_client_url(&self) -> &str {
        self.client_url.as_deref().unwrap_or(&self.broker_url)
    }
}

impl Default for HaSettings {
    fn default() -> Self {
        Self::new("quay-1", DEFAULT_BROKER_URL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_url_falls_back_to_broker_url() {
        let mut settings = HaSettings::new("a", "amqp:tcp:10.0.0.1:5672");
        assert_eq!(settings.effective_client_url(), "amqp:tcp:10.0.0.1:5672");

        settings.client_url = Some("amqp:tcp:vip:5672".to_string());
        assert_eq!(settings.effective_client_url(), "amqp:tcp:vip:5672");
    }
}
