//! # Event
//!
//! The event contract shared with the webhook gateway, and the two steps that turn raw message
//! bytes into a typed `Event`: `decode` (bytes to JSON) and `validate` (JSON to contract).
//!
//! Events are discriminated first by `source` and then by `funnelStage`; each combination fixes
//! the allowed `eventType` values and the shape of `data.engagement`.
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Raised when message bytes are not a JSON document at all.
#[derive(Error, Debug)]
#[error("payload could not be decoded: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Raised when a well-formed JSON document does not satisfy the event contract.
#[derive(Error, Debug)]
#[error("payload does not match the event contract: {0}")]
pub struct SchemaError(#[from] serde_json::Error);

/// Decode raw message bytes into an untyped JSON document.
pub fn decode(payload: &[u8]) -> Result<serde_json::Value, DecodeError> {
    Ok(serde_json::from_slice(payload)?)
}

/// Validate a decoded JSON document against the event contract.
/// Keys not part of the contract are dropped.
pub fn validate(value: serde_json::Value) -> Result<Event, SchemaError> {
    Ok(serde_json::from_value(value)?)
}

/// Result of running a payload through `decode` and `validate`.
#[derive(Debug)]
pub enum Outcome {
    Valid(Event),
    Malformed(DecodeError),
    InvalidSchema(SchemaError),
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Valid(_) => "valid",
            Outcome::Malformed(_) => "malformed",
            Outcome::InvalidSchema(_) => "invalid-schema",
        }
    }
}

/// Classify a raw payload. Both failure classes are permanent for that payload.
pub fn classify(payload: &[u8]) -> Outcome {
    let value = match decode(payload) {
        Ok(value) => value,
        Err(error) => return Outcome::Malformed(error),
    };

    match validate(value) {
        Ok(event) => Outcome::Valid(event),
        Err(error) => Outcome::InvalidSchema(error),
    }
}

/// Declare a closed set of string literals as an enum that (de)serializes to those literals.
macro_rules! wire_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $wire:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(
                #[serde(rename = $wire)]
                $variant,
            )+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire,)+
                }
            }
        }
    };
}

wire_enum!(
    /// The platform an event originates from. Also the last token of its broker subject.
    EventSource {
        Facebook => "facebook",
        Tiktok => "tiktok",
    }
);

wire_enum!(FunnelStage {
    Top => "top",
    Bottom => "bottom",
});

wire_enum!(FacebookTopEventType {
    AdView => "ad.view",
    PageLike => "page.like",
    Comment => "comment",
    VideoView => "video.view",
});

wire_enum!(FacebookBottomEventType {
    AdClick => "ad.click",
    FormSubmission => "form.submission",
    CheckoutComplete => "checkout.complete",
});

wire_enum!(TiktokTopEventType {
    VideoView => "video.view",
    Like => "like",
    Share => "share",
    Comment => "comment",
});

wire_enum!(TiktokBottomEventType {
    ProfileVisit => "profile.visit",
    Purchase => "purchase",
    Follow => "follow",
});

wire_enum!(Gender {
    Male => "male",
    Female => "female",
    NonBinary => "non-binary",
});

wire_enum!(Referrer {
    Newsfeed => "newsfeed",
    Marketplace => "marketplace",
    Groups => "groups",
});

wire_enum!(ClickPosition {
    TopLeft => "top_left",
    BottomRight => "bottom_right",
    Center => "center",
});

wire_enum!(FacebookDevice {
    Mobile => "mobile",
    Desktop => "desktop",
});

wire_enum!(Browser {
    Chrome => "Chrome",
    Firefox => "Firefox",
    Safari => "Safari",
});

wire_enum!(TiktokDevice {
    Android => "Android",
    Ios => "iOS",
    Desktop => "Desktop",
});

/// A key that must be present but may be `null`. Plain `Option` fields would also accept a
/// missing key.
fn nullable<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<String>::deserialize(deserializer)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub country: String,
    pub city: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookUser {
    pub user_id: String,
    pub name: String,
    pub age: f64,
    pub gender: Gender,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookEngagementTop {
    pub action_time: String,
    pub referrer: Referrer,
    #[serde(deserialize_with = "nullable")]
    pub video_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacebookEngagementBottom {
    pub ad_id: String,
    pub campaign_id: String,
    pub click_position: ClickPosition,
    pub device: FacebookDevice,
    pub browser: Browser,
    #[serde(deserialize_with = "nullable")]
    pub purchase_amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiktokUser {
    pub user_id: String,
    pub username: String,
    pub followers: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiktokEngagementTop {
    pub watch_time: f64,
    pub percentage_watched: f64,
    pub device: TiktokDevice,
    pub country: String,
    pub video_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TiktokEngagementBottom {
    pub action_time: String,
    #[serde(deserialize_with = "nullable")]
    pub profile_id: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub purchased_item: Option<String>,
    #[serde(deserialize_with = "nullable")]
    pub purchase_amount: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData<U, E> {
    pub user: U,
    pub engagement: E,
}

/// Fields shared by every (source, funnel stage) combination.
/// `timestamp` is kept as received; it may not be a valid date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StagedEvent<T, U, E> {
    pub event_id: String,
    pub timestamp: String,
    pub event_type: T,
    pub data: EventData<U, E>,
}

pub type FacebookTopEvent = StagedEvent<FacebookTopEventType, FacebookUser, FacebookEngagementTop>;
pub type FacebookBottomEvent =
    StagedEvent<FacebookBottomEventType, FacebookUser, FacebookEngagementBottom>;
pub type TiktokTopEvent = StagedEvent<TiktokTopEventType, TiktokUser, TiktokEngagementTop>;
pub type TiktokBottomEvent =
    StagedEvent<TiktokBottomEventType, TiktokUser, TiktokEngagementBottom>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "funnelStage", rename_all = "lowercase")]
pub enum FacebookEvent {
    Top(FacebookTopEvent),
    Bottom(FacebookBottomEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "funnelStage", rename_all = "lowercase")]
pub enum TiktokEvent {
    Top(TiktokTopEvent),
    Bottom(TiktokBottomEvent),
}

/// A behavioral event as published by the gateway. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum Event {
    Facebook(FacebookEvent),
    Tiktok(TiktokEvent),
}

impl Event {
    /// Stable external identifier, also used as the deduplication key everywhere downstream.
    pub fn event_id(&self) -> &str {
        match self {
            Event::Facebook(FacebookEvent::Top(e)) => &e.event_id,
            Event::Facebook(FacebookEvent::Bottom(e)) => &e.event_id,
            Event::Tiktok(TiktokEvent::Top(e)) => &e.event_id,
            Event::Tiktok(TiktokEvent::Bottom(e)) => &e.event_id,
        }
    }

    pub fn timestamp(&self) -> &str {
        match self {
            Event::Facebook(FacebookEvent::Top(e)) => &e.timestamp,
            Event::Facebook(FacebookEvent::Bottom(e)) => &e.timestamp,
            Event::Tiktok(TiktokEvent::Top(e)) => &e.timestamp,
            Event::Tiktok(TiktokEvent::Bottom(e)) => &e.timestamp,
        }
    }

    pub fn source(&self) -> EventSource {
        match self {
            Event::Facebook(_) => EventSource::Facebook,
            Event::Tiktok(_) => EventSource::Tiktok,
        }
    }

    pub fn funnel_stage(&self) -> FunnelStage {
        match self {
            Event::Facebook(FacebookEvent::Top(_)) | Event::Tiktok(TiktokEvent::Top(_)) => {
                FunnelStage::Top
            }
            Event::Facebook(FacebookEvent::Bottom(_)) | Event::Tiktok(TiktokEvent::Bottom(_)) => {
                FunnelStage::Bottom
            }
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Event::Facebook(FacebookEvent::Top(e)) => e.event_type.as_str(),
            Event::Facebook(FacebookEvent::Bottom(e)) => e.event_type.as_str(),
            Event::Tiktok(TiktokEvent::Top(e)) => e.event_type.as_str(),
            Event::Tiktok(TiktokEvent::Bottom(e)) => e.event_type.as_str(),
        }
    }

    /// The raw purchase amount, only carried by bottom-of-funnel engagements.
    pub fn purchase_amount(&self) -> Option<&str> {
        match self {
            Event::Facebook(FacebookEvent::Bottom(e)) => e.data.engagement.purchase_amount.as_deref(),
            Event::Tiktok(TiktokEvent::Bottom(e)) => e.data.engagement.purchase_amount.as_deref(),
            Event::Facebook(FacebookEvent::Top(_)) | Event::Tiktok(TiktokEvent::Top(_)) => None,
        }
    }
}
