use std::time::Duration;

use serde::Deserialize;

use crate::BrokerError;

// ═══════════════════════════════════════════════════════════════
//  Transport kind
// ═══════════════════════════════════════════════════════════════

/// Какой клиент лога строить при `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Kafka-совместимый брокер через rdkafka.
    #[default]
    Kafka,
    /// In-process лог (без внешней инфраструктуры).
    Memory,
}

impl std::str::FromStr for TransportKind {
    type Err = BrokerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kafka" => Ok(TransportKind::Kafka),
            "memory" => Ok(TransportKind::Memory),
            other => Err(BrokerError::Configuration(format!(
                "unknown broker transport '{other}' (expected 'kafka' or 'memory')"
            ))),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  Credentials
// ═══════════════════════════════════════════════════════════════

/// SASL PLAIN credentials.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

// ═══════════════════════════════════════════════════════════════
//  Timeouts
// ═══════════════════════════════════════════════════════════════

/// Ограничения по времени на сетевые операции. Таймаут connect
/// классифицируется как ConnectionError, таймаут publish как PublishError.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerTimeouts {
    pub connect: Duration,
    pub publish: Duration,
    pub commit: Duration,
    pub disconnect: Duration,
}

impl Default for BrokerTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            publish: Duration::from_secs(30),
            commit: Duration::from_secs(10),
            disconnect: Duration::from_secs(10),
        }
    }
}

// ═══════════════════════════════════════════════════════════════
//  BrokerSettings
// ═══════════════════════════════════════════════════════════════

/// Всё, что нужно для построения клиента лога.
#[derive(Debug, Clone)]
pub struct BrokerSettings {
    /// `host:port` список.
    pub addresses: Vec<String>,
    pub credentials: Option<Credentials>,
    pub tls: bool,
    pub transport: TransportKind,
    pub timeouts: BrokerTimeouts,
}

impl BrokerSettings {
    /// Собрать настройки из env-style значений: comma-separated broker list
    /// + username/password. Проверка: в [`BrokerSettings::validate`].
    pub fn from_env_values(
        addresses: Option<&str>,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Self {
        let addresses = addresses
            .map(|list| {
                list.split(',')
                    .map(str::trim)
                    .filter(|a| !a.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let credentials = match (username, password) {
            (Some(u), Some(p)) => Some(Credentials {
                username: u.to_string(),
                password: p.to_string(),
            }),
            _ => None,
        };
        Self {
            addresses,
            credentials,
            tls: false,
            transport: TransportKind::default(),
            timeouts: BrokerTimeouts::default(),
        }
    }

    pub fn with_transport(mut self, transport: TransportKind) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_tls(mut self, tls: bool) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_timeouts(mut self, timeouts: BrokerTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Проверить, что broker list и credentials заданы и корректны.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.addresses.is_empty() {
            return Err(BrokerError::Configuration(
                "broker address list is empty".into(),
            ));
        }
        for address in &self.addresses {
            validate_address(address)?;
        }

        let creds = self.credentials.as_ref().ok_or_else(|| {
            BrokerError::Configuration("broker credentials are not defined".into())
        })?;
        if creds.username.trim().is_empty() {
            return Err(BrokerError::Configuration("broker username is empty".into()));
        }
        if creds.password.is_empty() {
            return Err(BrokerError::Configuration("broker password is empty".into()));
        }
        Ok(())
    }

    /// Broker list в формате `bootstrap.servers`.
    pub fn bootstrap_servers(&self) -> String {
        self.addresses.join(",")
    }
}

fn validate_address(address: &str) -> Result<(), BrokerError> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        BrokerError::Configuration(format!("broker address '{address}' is not host:port"))
    })?;
    if host.is_empty() {
        return Err(BrokerError::Configuration(format!(
            "broker address '{address}' has an empty host"
        )));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(BrokerError::Configuration(format!(
            "broker address '{address}' has an invalid port"
        ))),
    }
}
