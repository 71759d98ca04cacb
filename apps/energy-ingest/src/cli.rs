use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "energy-ingest",
    version,
    about = "Normalize MQTT energy telemetry into CSV, MongoDB and a remote table"
)]
pub struct Args {
    /// Broker host or URL (`mqtt://`, `mqtts://`, `ws://`, `wss://`).
    #[arg(long, env = "MQTT_URL", default_value = "localhost")]
    pub broker: String,
    #[arg(long, env = "MQTT_PORT")]
    pub port: Option<u16>,
    #[arg(long, env = "MQTT_USERNAME")]
    pub username: Option<String>,
    #[arg(long, env = "MQTT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
    #[arg(long, env = "MQTT_TOPIC_FILTER", default_value = "energy/+/+/telemetry")]
    pub topic: String,
    #[arg(long, env = "MQTT_CLIENT_ID")]
    pub client_id: Option<String>,
    #[arg(long, env = "MQTT_KEEPALIVE_SECS", default_value_t = 60)]
    pub keepalive_secs: u64,
    /// Consecutive failed connection attempts before giving up; 0 retries forever.
    #[arg(long, env = "MQTT_RECONNECT_MAX_ATTEMPTS", default_value_t = 10)]
    pub reconnect_max_attempts: u32,

    /// CSV output. Used as `battery_data.csv` when no other sink is configured.
    #[arg(long, env = "CSV_OUTFILE")]
    pub outfile: Option<PathBuf>,

    #[arg(long, env = "MONGO_URI", hide_env_values = true)]
    pub mongo_uri: Option<String>,
    #[arg(long, env = "MONGO_DB", default_value = "battery_monitor")]
    pub mongo_db: String,
    #[arg(long, env = "MONGO_COLLECTION", default_value = "telemetry")]
    pub mongo_collection: String,

    #[arg(long, env = "REMOTE_STORE_URL")]
    pub remote_url: Option<String>,
    #[arg(long, env = "REMOTE_STORE_KEY", hide_env_values = true)]
    pub remote_key: Option<String>,
    #[arg(long, env = "REMOTE_STORE_TABLE", default_value = "telemetry")]
    pub remote_table: String,
    #[arg(long, env = "REMOTE_STORE_TIMEOUT_SECS", default_value_t = 10)]
    pub remote_timeout_secs: u64,
    #[arg(long, env = "REMOTE_STORE_QUEUE", default_value_t = 1024)]
    pub remote_queue: usize,
    #[arg(long, env = "REMOTE_STORE_MAX_ATTEMPTS", default_value_t = 3)]
    pub remote_max_attempts: u32,

    /// Upper bound on flushing queued readings at shutdown.
    #[arg(long, env = "DRAIN_TIMEOUT_SECS", default_value_t = 5)]
    pub drain_timeout_secs: u64,
}
