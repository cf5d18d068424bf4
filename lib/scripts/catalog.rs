use crate::event_engine::Event;

/// Static description of one background event script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptDefinition {
    /// Also the checkpoint name.
    pub name: &'static str,
    pub resource_type: &'static str,
    pub event_types: &'static [&'static str],
    /// Required `publicData.listingType` of the event resource, when set.
    pub listing_type: Option<&'static str>,
    /// Send one summary per non-empty page in addition to the per-event deliveries.
    pub page_summary: bool,
}

impl ScriptDefinition {
    pub fn event_types(&self) -> Vec<String> {
        self.event_types.iter().map(|event_type| event_type.to_string()).collect()
    }

    /// Resource, event type and listing type filter applied on top of the server-side
    /// `eventTypes` filter.
    pub fn accepts(&self, event: &Event) -> bool {
        self.resource_type == event.resource_type
            && self
                .event_types
                .iter()
                .any(|candidate| *candidate == event.event_type)
            && self
                .listing_type
                .map_or(true, |expected| listing_type_of(event) == Some(expected))
    }
}

fn listing_type_of(event: &Event) -> Option<&str> {
    event
        .resource
        .pointer("/attributes/publicData/listingType")
        .and_then(|value| value.as_str())
}

pub const CATALOG: &[ScriptDefinition] = &[
    ScriptDefinition {
        name: "notifyUserCreated",
        resource_type: "user",
        event_types: &["user/created"],
        listing_type: None,
        page_summary: false,
    },
    ScriptDefinition {
        name: "notifyUserUpdated",
        resource_type: "user",
        event_types: &["user/updated"],
        listing_type: None,
        page_summary: false,
    },
    ScriptDefinition {
        name: "notifyProductListingCreated",
        resource_type: "listing",
        event_types: &["listing/created"],
        listing_type: None,
        page_summary: true,
    },
    ScriptDefinition {
        name: "notifyProfileListingUpdated",
        resource_type: "listing",
        event_types: &["listing/updated"],
        listing_type: Some("profile-listing"),
        page_summary: false,
    },
    ScriptDefinition {
        name: "notifyPortfolioListingUpdated",
        resource_type: "listing",
        event_types: &["listing/updated"],
        listing_type: Some("portfolio-listing"),
        page_summary: false,
    },
];

pub fn find(name: &str) -> Option<&'static ScriptDefinition> {
    CATALOG.iter().find(|definition| definition.name == name)
}

/// Resolves enabled script names against the catalog; an empty list enables everything.
pub fn resolve_enabled(names: &[String]) -> Result<Vec<&'static ScriptDefinition>, String> {
    if names.is_empty() {
        return Ok(CATALOG.iter().collect());
    }

    let mut resolved: Vec<&'static ScriptDefinition> = Vec::with_capacity(names.len());
    for name in names {
        let definition = find(name).ok_or_else(|| {
            let known: Vec<&str> = CATALOG.iter().map(|definition| definition.name).collect();
            format!("unknown event script `{name}` (known: {})", known.join(", "))
        })?;
        if !resolved.iter().any(|existing| existing.name == definition.name) {
            resolved.push(definition);
        }
    }
    Ok(resolved)
}
