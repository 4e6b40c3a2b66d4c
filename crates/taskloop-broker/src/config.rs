use std::str::FromStr;

/// Which broker transport to construct. Selected once at process startup
/// via `BROKER_KIND`, mirroring how the worker's `RunnerConfig` reads
/// `WORKFLOW_RUNNER` in the teacher codebase this was generalized from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrokerKind {
    #[default]
    InMemory,
    Amqp,
}

impl FromStr for BrokerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "inmemory" | "in_process" | "in-memory" => Ok(BrokerKind::InMemory),
            "amqp" | "rabbitmq" => Ok(BrokerKind::Amqp),
            other => Err(format!("unknown broker kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub amqp_url: Option<String>,
    pub default_prefetch: u16,
}

impl BrokerConfig {
    pub fn from_env() -> Self {
        let kind = std::env::var("BROKER_KIND")
            .ok()
            .and_then(|s| BrokerKind::from_str(&s).ok())
            .unwrap_or_default();
        let amqp_url = std::env::var("AMQP_URL").ok();
        let default_prefetch = std::env::var("BROKER_PREFETCH")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(4);
        Self { kind, amqp_url, default_prefetch }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_kind_parse_inmemory() {
        assert_eq!(BrokerKind::from_str("inmemory").unwrap(), BrokerKind::InMemory);
    }

    #[test]
    fn broker_kind_parse_amqp() {
        assert_eq!(BrokerKind::from_str("amqp").unwrap(), BrokerKind::Amqp);
    }

    #[test]
    fn broker_kind_parse_invalid() {
        assert!(BrokerKind::from_str("kafka").is_err());
    }
}
