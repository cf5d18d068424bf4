use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::event_engine::Event;

/// `{"data": ..., "meta": ...}` envelope used by every Integration API response.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiEnvelope<T> {
    pub data: T,
    #[serde(default)]
    pub meta: PageMeta,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageMeta {
    #[serde(default)]
    pub total_items: Option<u64>,
    #[serde(default)]
    pub total_pages: Option<u32>,
    #[serde(default)]
    pub page: Option<u32>,
    #[serde(default)]
    pub per_page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UuidRef {
    pub uuid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventResource {
    pub attributes: EventAttributes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventAttributes {
    pub sequence_id: u64,
    pub resource_type: String,
    pub event_type: String,
    pub resource_id: UuidRef,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub resource: Option<Value>,
}

impl From<EventResource> for Event {
    fn from(raw: EventResource) -> Self {
        let attributes = raw.attributes;
        Event {
            sequence_id: attributes.sequence_id,
            resource_type: attributes.resource_type,
            event_type: attributes.event_type,
            resource_id: attributes.resource_id.uuid,
            created_at: attributes.created_at,
            resource: attributes.resource.unwrap_or(Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ListingResource {
    pub id: UuidRef,
    #[serde(default)]
    pub attributes: ListingAttributes,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAttributes {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub public_data: serde_json::Map<String, Value>,
}

impl ListingResource {
    pub fn id(&self) -> &str {
        &self.id.uuid
    }

    /// Raw `publicData.keywords`; anything that is not a string reads as empty.
    pub fn keywords(&self) -> &str {
        self.attributes
            .public_data
            .get("keywords")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[cfg(test)]
mod tests {
    use super::{ApiEnvelope, EventResource, ListingResource};
    use crate::event_engine::Event;

    #[test]
    fn event_envelope_flattens_into_engine_events() {
        let raw = r#"{
            "data": [{
                "id": {"uuid": "c1"},
                "type": "event",
                "attributes": {
                    "sequenceId": 1043,
                    "resourceType": "user",
                    "eventType": "user/created",
                    "resourceId": {"uuid": "u-1"},
                    "createdAt": "2026-01-01T12:00:00.000Z",
                    "resource": {"attributes": {"email": "a@example.com"}}
                }
            }],
            "meta": {"perPage": 100}
        }"#;

        let envelope: ApiEnvelope<Vec<EventResource>> =
            serde_json::from_str(raw).expect("fixture parses");
        assert_eq!(envelope.meta.per_page, Some(100));
        let events: Vec<Event> = envelope.data.into_iter().map(Event::from).collect();
        assert_eq!(events[0].sequence_id, 1043);
        assert_eq!(events[0].resource_id, "u-1");
        assert!(events[0].matches("user", "user/created"));
    }

    #[test]
    fn listing_keywords_default_to_empty() {
        let with_keywords: ListingResource = serde_json::from_str(
            r#"{"id": {"uuid": "l-1"}, "attributes": {"publicData": {"keywords": "Red red"}}}"#,
        )
        .expect("fixture parses");
        let without: ListingResource = serde_json::from_str(
            r#"{"id": {"uuid": "l-2"}, "attributes": {"publicData": {"keywords": 7}}}"#,
        )
        .expect("fixture parses");

        assert_eq!(with_keywords.keywords(), "Red red");
        assert_eq!(without.keywords(), "");
        assert_eq!(without.id(), "l-2");
    }
}
