use crate::config::{MqttConfig, TransportKind};
use crate::pipeline::{InboundMessage, Pipeline};
use anyhow::{bail, Result};
use chrono::Utc;
use rumqttc::{
    AsyncClient, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS, SubscribeReasonCode,
    Transport,
};
use std::fmt;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const DISCONNECT_FLUSH: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Subscribed,
    ShuttingDown,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkState::Disconnected => "disconnected",
            LinkState::Connecting => "connecting",
            LinkState::Subscribed => "subscribed",
            LinkState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

struct Link {
    state: LinkState,
}

impl Link {
    fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
        }
    }

    fn transition(&mut self, next: LinkState) {
        if self.state != next {
            tracing::debug!(from=%self.state, to=%next, "mqtt link state");
            self.state = next;
        }
    }
}

/// Doubling reconnect delay, reset once the broker accepts a connection.
#[derive(Debug)]
pub struct Backoff {
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            current: INITIAL_BACKOFF,
            failures: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.failures = self.failures.saturating_add(1);
        self.current = (self.current * 2).min(MAX_BACKOFF);
        delay
    }

    pub fn reset(&mut self) {
        self.current = INITIAL_BACKOFF;
        self.failures = 0;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

enum SessionEnd {
    Cancelled,
    Dropped { connected: bool },
}

/// Both rumqttc and reqwest pull in rustls with different backends, so the
/// process-level provider has to be chosen before any TLS config is built.
pub fn install_crypto_provider() {
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("rustls crypto provider already installed");
    }
}

pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let target = &config.target;
    let broker = if target.transport.is_websocket() {
        target.websocket_url()
    } else {
        target.host.clone()
    };
    let mut options = MqttOptions::new(config.client_id.clone(), broker, target.port);
    options.set_keep_alive(config.keepalive);
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    match target.transport {
        TransportKind::Tcp => {}
        TransportKind::Tls => {
            options.set_transport(Transport::tls_with_default_config());
        }
        TransportKind::Ws => {
            options.set_transport(Transport::Ws);
        }
        TransportKind::Wss => {
            options.set_transport(Transport::wss_with_default_config());
        }
    }
    options
}

/// Receives until `cancel` fires, reconnecting with backoff. Returns an error
/// only when the broker stays unreachable past the configured attempt limit.
pub async fn run_listener(
    config: MqttConfig,
    pipeline: Pipeline,
    cancel: CancellationToken,
) -> Result<()> {
    let stats = pipeline.stats();
    let mut link = Link::new();
    let mut backoff = Backoff::new();

    tracing::info!(
        host=%config.target.host,
        port = config.target.port,
        transport = ?config.target.transport,
        client_id=%config.client_id,
        topic=%config.topic_filter,
        "starting MQTT listener"
    );

    loop {
        link.transition(LinkState::Connecting);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&config), REQUEST_CAPACITY);

        let end = run_session(
            &config,
            &client,
            &mut eventloop,
            &pipeline,
            &cancel,
            &mut link,
            &mut backoff,
        )
        .await;
        stats.set_mqtt_connected(false);

        match end {
            SessionEnd::Cancelled => {
                link.transition(LinkState::ShuttingDown);
                disconnect(&client, &mut eventloop).await;
                link.transition(LinkState::Disconnected);
                return Ok(());
            }
            SessionEnd::Dropped { connected } => {
                link.transition(LinkState::Disconnected);
                let delay = backoff.next_delay();
                if let Some(limit) = config.reconnect_max_attempts {
                    if backoff.failures() > limit {
                        bail!(
                            "MQTT broker {}:{} unreachable after {} attempts",
                            config.target.host,
                            config.target.port,
                            limit
                        );
                    }
                }
                tracing::warn!(
                    attempt = backoff.failures(),
                    delay_ms = delay.as_millis() as u64,
                    was_connected = connected,
                    "MQTT connection lost; reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        link.transition(LinkState::ShuttingDown);
                        return Ok(());
                    }
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

async fn run_session(
    config: &MqttConfig,
    client: &AsyncClient,
    eventloop: &mut EventLoop,
    pipeline: &Pipeline,
    cancel: &CancellationToken,
    link: &mut Link,
    backoff: &mut Backoff,
) -> SessionEnd {
    let stats = pipeline.stats();
    let mut connected = false;

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => return SessionEnd::Cancelled,
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                connected = true;
                backoff.reset();
                stats.set_mqtt_connected(true);
                tracing::info!(session_present = ack.session_present, "connected to MQTT broker");
                if let Err(err) = client
                    .subscribe(config.topic_filter.clone(), QoS::AtLeastOnce)
                    .await
                {
                    tracing::warn!(error=%err, topic=%config.topic_filter, "failed to queue subscribe");
                    return SessionEnd::Dropped { connected };
                }
            }
            Ok(Event::Incoming(Incoming::SubAck(suback))) => {
                if suback
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    tracing::error!(topic=%config.topic_filter, "broker rejected subscription");
                } else {
                    link.transition(LinkState::Subscribed);
                    tracing::info!(topic=%config.topic_filter, "subscribed to telemetry feed");
                }
            }
            Ok(Event::Incoming(Incoming::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic,
                    payload: publish.payload,
                    received_at: Utc::now(),
                };
                pipeline.process(message).await;
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                tracing::warn!("broker sent DISCONNECT");
                return SessionEnd::Dropped { connected };
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error=%err, "MQTT connection error");
                return SessionEnd::Dropped { connected };
            }
        }
    }
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if let Err(err) = client.disconnect().await {
        tracing::debug!(error=%err, "failed to queue MQTT disconnect");
        return;
    }
    let flushed = timeout(DISCONNECT_FLUSH, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                Ok(_) => {}
                Err(_) => break,
            }
        }
    })
    .await;
    if flushed.is_err() {
        tracing::debug!("MQTT disconnect not flushed before timeout");
    } else {
        tracing::info!("disconnected from MQTT broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerTarget;

    fn config(broker: &str) -> MqttConfig {
        MqttConfig {
            target: BrokerTarget::resolve(broker, None).unwrap(),
            username: Some("battery".to_string()),
            password: None,
            topic_filter: "energy/+/+/telemetry".to_string(),
            client_id: "energy-ingest-test".to_string(),
            keepalive: Duration::from_secs(60),
            reconnect_max_attempts: Some(2),
        }
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let mut backoff = Backoff::new();
        let delays: Vec<u64> = (0..7).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.failures(), 7);
    }

    #[test]
    fn backoff_reset_restarts_sequence() {
        let mut backoff = Backoff::new();
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.failures(), 0);
        assert_eq!(backoff.next_delay(), INITIAL_BACKOFF);
    }

    #[test]
    fn options_carry_identity_and_keepalive() {
        let options = mqtt_options(&config("mqtt://broker:1883"));
        assert_eq!(options.client_id(), "energy-ingest-test");
        assert_eq!(options.broker_address(), ("broker".to_string(), 1883));
        assert_eq!(options.keep_alive(), Duration::from_secs(60));
    }

    #[test]
    fn websocket_options_use_full_url() {
        install_crypto_provider();
        let options = mqtt_options(&config("wss://abc.hivemq.cloud:8884/mqtt"));
        assert_eq!(
            options.broker_address(),
            ("wss://abc.hivemq.cloud:8884/mqtt".to_string(), 8884)
        );
    }

    #[test]
    fn secure_schemes_build_options() {
        install_crypto_provider();
        let tls = mqtt_options(&config("mqtts://broker.example.com"));
        assert_eq!(tls.broker_address(), ("broker.example.com".to_string(), 8883));
        assert!(matches!(tls.transport(), Transport::Tls(_)));

        let wss = mqtt_options(&config("wss://broker.example.com:8884/mqtt"));
        assert!(matches!(wss.transport(), Transport::Wss(_)));
    }

    #[tokio::test]
    async fn unreachable_broker_gives_up_after_limit() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config("127.0.0.1");
        config.target.port = port;
        config.reconnect_max_attempts = Some(1);

        let pipeline = Pipeline::new(Vec::new());
        let cancel = CancellationToken::new();
        let result = timeout(
            Duration::from_secs(10),
            run_listener(config, pipeline.clone(), cancel),
        )
        .await
        .expect("listener did not give up");
        assert!(result.is_err());
        assert!(!pipeline.stats().mqtt_connected.load(std::sync::atomic::Ordering::Relaxed));
    }

    #[tokio::test]
    async fn cancellation_stops_reconnect_wait() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut config = config("127.0.0.1");
        config.target.port = port;
        config.reconnect_max_attempts = None;

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_listener(config, Pipeline::new(Vec::new()), cancel.clone()));
        sleep(Duration::from_millis(200)).await;
        cancel.cancel();

        let result = timeout(Duration::from_secs(1), task)
            .await
            .expect("listener ignored cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
