/// Tag written for the first-generation battery firmware, which publishes on
/// `battery/data` and never puts its identity in the topic.
pub const LEGACY_BATTERY_DEVICE_TYPE: &str = "esp32";
/// Every legacy battery reading is attributed to this id, so two boards on the
/// old firmware cannot be told apart.
pub const LEGACY_BATTERY_DEVICE_ID: &str = "esp32_1";

const ENERGY_PREFIX: &str = "energy";
const BATTERY_PREFIX: &str = "battery";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopicClass {
    pub device_type: String,
    pub device_id: String,
}

impl TopicClass {
    pub fn is_classified(&self) -> bool {
        !self.device_type.is_empty() || !self.device_id.is_empty()
    }
}

/// Maps a topic to `(device_type, device_id)`.
///
/// `energy/{type}/{id}/...` carries both in the path; anything under
/// `battery` is the legacy board. Unknown topics come back empty rather than
/// as an error.
pub fn classify(topic: &str) -> TopicClass {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() >= 4 && parts[0] == ENERGY_PREFIX {
        return TopicClass {
            device_type: parts[1].to_string(),
            device_id: parts[2].to_string(),
        };
    }
    if parts.first() == Some(&BATTERY_PREFIX) {
        return TopicClass {
            device_type: LEGACY_BATTERY_DEVICE_TYPE.to_string(),
            device_id: LEGACY_BATTERY_DEVICE_ID.to_string(),
        };
    }
    TopicClass::default()
}
