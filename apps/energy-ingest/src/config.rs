use crate::cli::Args;
use crate::sink::QueueConfig;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_OUTFILE: &str = "battery_data.csv";
const DEFAULT_WS_PATH: &str = "/mqtt";
const TLS_PORTS: [u16; 2] = [8883, 8884];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid broker URL {url:?}: {source}")]
    InvalidBrokerUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("broker URL {0:?} has no host")]
    MissingHost(String),
    #[error("unsupported broker scheme {0:?} (expected mqtt, mqtts, tcp, ssl, ws or wss)")]
    UnsupportedScheme(String),
    #[error("{0} must not be empty")]
    Empty(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Tls,
    Ws,
    Wss,
}

impl TransportKind {
    fn from_scheme(scheme: &str) -> Result<Self, ConfigError> {
        match scheme.to_ascii_lowercase().as_str() {
            "mqtt" | "tcp" => Ok(TransportKind::Tcp),
            "mqtts" | "ssl" => Ok(TransportKind::Tls),
            "ws" => Ok(TransportKind::Ws),
            "wss" => Ok(TransportKind::Wss),
            other => Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn is_tls(self) -> bool {
        matches!(self, TransportKind::Tls | TransportKind::Wss)
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, TransportKind::Ws | TransportKind::Wss)
    }

    fn default_port(self) -> u16 {
        if self.is_tls() {
            8883
        } else {
            1883
        }
    }

    fn with_tls(self) -> Self {
        match self {
            TransportKind::Tcp => TransportKind::Tls,
            TransportKind::Ws => TransportKind::Wss,
            tls => tls,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            TransportKind::Tcp => "mqtt",
            TransportKind::Tls => "mqtts",
            TransportKind::Ws => "ws",
            TransportKind::Wss => "wss",
        }
    }
}

/// Where and how to reach the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerTarget {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    /// Websocket path; ignored for plain and TLS sockets.
    pub path: String,
}

impl BrokerTarget {
    /// Accepts `scheme://host[:port][/path]` or a bare host name.
    ///
    /// A port written in the URL wins over `port`. Ports 8883 and 8884 always
    /// imply TLS.
    pub fn resolve(broker: &str, port: Option<u16>) -> Result<Self, ConfigError> {
        let broker = broker.trim();
        if broker.is_empty() {
            return Err(ConfigError::Empty("broker"));
        }

        let (host, ports, transport, path) = if broker.contains("://") {
            let url = Url::parse(broker).map_err(|source| ConfigError::InvalidBrokerUrl {
                url: broker.to_string(),
                source,
            })?;
            let transport = TransportKind::from_scheme(url.scheme())?;
            let host = url
                .host_str()
                .filter(|h| !h.is_empty())
                .ok_or_else(|| ConfigError::MissingHost(broker.to_string()))?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            let path = match url.path() {
                "" | "/" => DEFAULT_WS_PATH.to_string(),
                other => other.to_string(),
            };
            let ports = match url.port() {
                Some(explicit) => (Some(explicit), None),
                // ws/wss are special schemes; `url` drops their default ports
                None if transport.is_websocket() => (None, url.port_or_known_default()),
                None => (None, None),
            };
            (host, ports, transport, path)
        } else {
            (
                broker.to_string(),
                (None, None),
                TransportKind::Tcp,
                DEFAULT_WS_PATH.to_string(),
            )
        };

        let (url_port, scheme_port) = ports;
        let port = url_port
            .or(port)
            .or(scheme_port)
            .unwrap_or(transport.default_port());
        let transport = if TLS_PORTS.contains(&port) {
            transport.with_tls()
        } else {
            transport
        };

        Ok(Self {
            host,
            port,
            transport,
            path,
        })
    }

    /// Full URL handed to the websocket transport as the broker address.
    pub fn websocket_url(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.transport.scheme(),
            self.host,
            self.port,
            self.path
        )
    }
}

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub target: BrokerTarget,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic_filter: String,
    pub client_id: String,
    pub keepalive: Duration,
    /// `None` retries forever.
    pub reconnect_max_attempts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct TabularConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct DocumentConfig {
    pub uri: String,
    pub database: String,
    pub collection: String,
}

#[derive(Debug, Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub table: String,
    pub timeout: Duration,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mqtt: MqttConfig,
    pub tabular: Option<TabularConfig>,
    pub document: Option<DocumentConfig>,
    pub remote: Option<RemoteConfig>,
    pub drain_timeout: Duration,
}

impl Config {
    pub fn from_args(args: Args) -> Result<Self, ConfigError> {
        let target = BrokerTarget::resolve(&args.broker, args.port)?;
        let topic_filter = args.topic.trim().to_string();
        if topic_filter.is_empty() {
            return Err(ConfigError::Empty("topic"));
        }
        let client_id = non_empty(args.client_id).unwrap_or_else(default_client_id);

        let mqtt = MqttConfig {
            target,
            username: non_empty(args.username),
            password: args.password,
            topic_filter,
            client_id,
            keepalive: Duration::from_secs(args.keepalive_secs.max(5)),
            reconnect_max_attempts: (args.reconnect_max_attempts > 0)
                .then_some(args.reconnect_max_attempts),
        };

        let drain_timeout = Duration::from_secs(args.drain_timeout_secs);

        let document = non_empty(args.mongo_uri).map(|uri| DocumentConfig {
            uri,
            database: args.mongo_db,
            collection: args.mongo_collection,
        });

        let remote = match (non_empty(args.remote_url), non_empty(args.remote_key)) {
            (Some(base_url), Some(api_key)) => Some(RemoteConfig {
                base_url,
                api_key,
                table: args.remote_table,
                timeout: Duration::from_secs(args.remote_timeout_secs.max(1)),
                queue: QueueConfig {
                    capacity: args.remote_queue.max(1),
                    max_attempts: args.remote_max_attempts.max(1),
                    drain_timeout,
                    ..QueueConfig::default()
                },
            }),
            (None, None) => None,
            _ => {
                tracing::warn!(
                    "remote store needs both REMOTE_STORE_URL and REMOTE_STORE_KEY; remote sink disabled"
                );
                None
            }
        };

        let mut tabular = args.outfile.map(|path| TabularConfig { path });
        if tabular.is_none() && document.is_none() && remote.is_none() {
            tabular = Some(TabularConfig {
                path: PathBuf::from(DEFAULT_OUTFILE),
            });
        }

        Ok(Self {
            mqtt,
            tabular,
            document,
            remote,
            drain_timeout,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("energy-ingest-{}", &id[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["energy-ingest"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn bare_host_defaults_to_plain_tcp() {
        let target = BrokerTarget::resolve("localhost", None).unwrap();
        assert_eq!(target.host, "localhost");
        assert_eq!(target.port, 1883);
        assert_eq!(target.transport, TransportKind::Tcp);
    }

    #[test]
    fn bare_host_on_tls_port_uses_tls() {
        for port in [8883, 8884] {
            let target = BrokerTarget::resolve("broker.example.com", Some(port)).unwrap();
            assert_eq!(target.transport, TransportKind::Tls, "{port}");
        }
        let target = BrokerTarget::resolve("broker.example.com", Some(1884)).unwrap();
        assert_eq!(target.transport, TransportKind::Tcp);
    }

    #[test]
    fn url_schemes_select_transport_and_port() {
        let cases = [
            ("mqtt://broker:1999", TransportKind::Tcp, 1999),
            ("tcp://broker", TransportKind::Tcp, 1883),
            ("mqtts://broker", TransportKind::Tls, 8883),
            ("ssl://broker:9883", TransportKind::Tls, 9883),
            ("ws://broker:9001", TransportKind::Ws, 9001),
            ("wss://broker:8884/mqtt", TransportKind::Wss, 8884),
            ("mqtt://broker:8883", TransportKind::Tls, 8883),
        ];
        for (url, transport, port) in cases {
            let target = BrokerTarget::resolve(url, None).unwrap();
            assert_eq!(target.host, "broker", "{url}");
            assert_eq!(target.transport, transport, "{url}");
            assert_eq!(target.port, port, "{url}");
        }
    }

    #[test]
    fn url_port_wins_over_flag() {
        let target = BrokerTarget::resolve("mqtt://broker:2000", Some(3000)).unwrap();
        assert_eq!(target.port, 2000);
        let target = BrokerTarget::resolve("mqtt://broker", Some(3000)).unwrap();
        assert_eq!(target.port, 3000);
    }

    #[test]
    fn websocket_path_and_url() {
        let target = BrokerTarget::resolve("wss://abc.s1.eu.hivemq.cloud:8884/mqtt", None).unwrap();
        assert_eq!(target.path, "/mqtt");
        assert_eq!(
            target.websocket_url(),
            "wss://abc.s1.eu.hivemq.cloud:8884/mqtt"
        );

        let target = BrokerTarget::resolve("ws://broker:9001/custom/path", None).unwrap();
        assert_eq!(target.websocket_url(), "ws://broker:9001/custom/path");

        let target = BrokerTarget::resolve("ws://broker:9001", None).unwrap();
        assert_eq!(target.path, "/mqtt");
    }

    #[test]
    fn unknown_scheme_is_rejected() {
        let err = BrokerTarget::resolve("http://broker", None).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(s) if s == "http"));
        assert!(matches!(
            BrokerTarget::resolve("   ", None),
            Err(ConfigError::Empty("broker"))
        ));
    }

    #[test]
    fn csv_is_the_fallback_sink() {
        let config = Config::from_args(args(&[])).unwrap();
        assert_eq!(
            config.tabular.map(|t| t.path),
            Some(PathBuf::from(DEFAULT_OUTFILE))
        );
        assert!(config.document.is_none());
        assert!(config.remote.is_none());
    }

    #[test]
    fn mongo_only_has_no_csv() {
        let config = Config::from_args(args(&["--mongo-uri", "mongodb://db:27017"])).unwrap();
        assert!(config.tabular.is_none());
        let document = config.document.unwrap();
        assert_eq!(document.database, "battery_monitor");
        assert_eq!(document.collection, "telemetry");
    }

    #[test]
    fn remote_requires_url_and_key() {
        let config = Config::from_args(args(&[
            "--outfile",
            "out.csv",
            "--remote-url",
            "https://store.example.com",
        ]))
        .unwrap();
        assert!(config.remote.is_none());

        let config = Config::from_args(args(&[
            "--remote-url",
            "https://store.example.com",
            "--remote-key",
            "k",
            "--remote-queue",
            "16",
            "--drain-timeout-secs",
            "2",
        ]))
        .unwrap();
        let remote = config.remote.unwrap();
        assert_eq!(remote.table, "telemetry");
        assert_eq!(remote.queue.capacity, 16);
        assert_eq!(remote.queue.max_attempts, 3);
        assert_eq!(remote.queue.drain_timeout, Duration::from_secs(2));
        assert!(config.tabular.is_none());
    }

    #[test]
    fn mqtt_defaults() {
        let config = Config::from_args(args(&["--reconnect-max-attempts", "0"])).unwrap();
        assert_eq!(config.mqtt.topic_filter, "energy/+/+/telemetry");
        assert_eq!(config.mqtt.keepalive, Duration::from_secs(60));
        assert_eq!(config.mqtt.reconnect_max_attempts, None);
        assert!(config.mqtt.client_id.starts_with("energy-ingest-"));
        assert_eq!(config.mqtt.client_id.len(), "energy-ingest-".len() + 8);
    }
}
