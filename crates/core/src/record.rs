//! Bitemporal record shapes and their property-map encoding.
//!
//! # Bi-temporal model
//!
//! - **Valid time** (`vt_start` / `vt_end`): when the fact was true in the
//!   modeled world. `vt_end = None` means still valid.
//! - **Transaction time** (`tt_start` / `tt_end`): when the system held the
//!   record as its current belief. `tt_end = None` means current.
//!
//! Both intervals are half-open: `[start, end)`.
//!
//! Timestamps are stored as RFC 3339 UTC strings with fixed microsecond
//! precision, so a lexical comparison inside the store agrees with the
//! temporal one.

use crate::store::{Direction, Properties, Row};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const ID: &str = "id";
pub const VT_START: &str = "vt_start";
pub const VT_END: &str = "vt_end";
pub const TT_START: &str = "tt_start";
pub const TT_END: &str = "tt_end";

/// Encode a timestamp the way it is stored.
pub fn encode_time(t: DateTime<Utc>) -> JsonValue {
    JsonValue::String(t.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Decode a stored timestamp. Any RFC 3339 offset is accepted.
pub fn decode_time(value: &JsonValue) -> Option<DateTime<Utc>> {
    value
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// Read an optional timestamp field; `null` and absence both mean "open".
fn optional_time(props: &Properties, field: &str) -> Result<Option<DateTime<Utc>>, String> {
    match props.get(field) {
        None | Some(JsonValue::Null) => Ok(None),
        Some(v) => decode_time(v)
            .map(Some)
            .ok_or_else(|| format!("`{field}` is not an RFC 3339 timestamp")),
    }
}

fn required_time(props: &Properties, field: &str) -> Result<DateTime<Utc>, String> {
    optional_time(props, field)?.ok_or_else(|| format!("`{field}` is missing"))
}

/// The four temporal attributes every node and edge carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemporalStamp {
    pub vt_start: DateTime<Utc>,
    pub vt_end: Option<DateTime<Utc>>,
    pub tt_start: DateTime<Utc>,
    pub tt_end: Option<DateTime<Utc>>,
}

impl TemporalStamp {
    /// A current, still-valid stamp.
    pub fn opened(vt_start: DateTime<Utc>, tt_start: DateTime<Utc>) -> Self {
        Self {
            vt_start,
            vt_end: None,
            tt_start,
            tt_end: None,
        }
    }

    /// Is this the system's current belief?
    pub fn is_current(&self) -> bool {
        self.tt_end.is_none()
    }

    /// Was the fact true in the world at `at` (valid-time axis)?
    pub fn was_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.vt_start <= at && self.vt_end.is_none_or(|t| t > at)
    }

    /// Did the system hold this record as current at `at` (transaction-time axis)?
    pub fn was_recorded_at(&self, at: DateTime<Utc>) -> bool {
        self.tt_start <= at && self.tt_end.is_none_or(|t| t > at)
    }

    pub fn validate(&self) -> Result<(), String> {
        if let Some(end) = self.vt_end {
            if end < self.vt_start {
                return Err(format!(
                    "vt_end {end} precedes vt_start {}",
                    self.vt_start
                ));
            }
        }
        if let Some(end) = self.tt_end {
            if end < self.tt_start {
                return Err(format!(
                    "tt_end {end} precedes tt_start {}",
                    self.tt_start
                ));
            }
        }
        Ok(())
    }

    pub fn from_properties(props: &Properties) -> Result<Self, String> {
        Ok(Self {
            vt_start: required_time(props, VT_START)?,
            vt_end: optional_time(props, VT_END)?,
            tt_start: required_time(props, TT_START)?,
            tt_end: optional_time(props, TT_END)?,
        })
    }

    /// Write the stamp into `props`. Open ends are omitted rather than
    /// written as `null`.
    pub fn write_into(&self, props: &mut Properties) {
        props.insert(VT_START.to_string(), encode_time(self.vt_start));
        props.insert(TT_START.to_string(), encode_time(self.tt_start));
        match self.vt_end {
            Some(t) => props.insert(VT_END.to_string(), encode_time(t)),
            None => props.remove(VT_END),
        };
        match self.tt_end {
            Some(t) => props.insert(TT_END.to_string(), encode_time(t)),
            None => props.remove(TT_END),
        };
    }
}

fn is_reserved(key: &str) -> bool {
    matches!(key, ID | VT_START | VT_END | TT_START | TT_END)
}

/// A node as read back from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    pub label: String,
    pub stamp: TemporalStamp,
    /// Caller-owned properties; `id` and the temporal fields live above.
    pub properties: Properties,
}

impl NodeRecord {
    /// Decode a `{node, label}` row.
    pub fn from_row(row: &Row) -> Result<Self, String> {
        let props = row
            .get_object("node")
            .ok_or_else(|| "row has no `node` column".to_string())?;
        let label = row.get_str("label").unwrap_or_default().to_string();
        Self::from_properties(label, props)
    }

    pub fn from_properties(label: String, props: &Properties) -> Result<Self, String> {
        let id = props
            .get(ID)
            .and_then(JsonValue::as_str)
            .ok_or_else(|| "node has no string `id`".to_string())?
            .to_string();
        let stamp = TemporalStamp::from_properties(props)?;
        let properties = props
            .iter()
            .filter(|(k, _)| !is_reserved(k))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Ok(Self {
            id,
            label,
            stamp,
            properties,
        })
    }

    pub fn is_current(&self) -> bool {
        self.stamp.is_current()
    }

    /// The full stored property map: caller properties, `id` and stamp.
    pub fn to_properties(&self) -> Properties {
        let mut props = self.properties.clone();
        props.insert(ID.to_string(), JsonValue::String(self.id.clone()));
        self.stamp.write_into(&mut props);
        props
    }
}

/// A relationship seen from one of its endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub rel_type: String,
    pub direction: Direction,
    pub neighbor_id: String,
    /// Every stored property of the edge, temporal fields included.
    pub properties: Properties,
}

impl Relationship {
    /// Decode a `{rel_type, outgoing, neighbor_id, props}` row.
    pub fn from_row(row: &Row) -> Result<Self, String> {
        let rel_type = row
            .get_str("rel_type")
            .ok_or_else(|| "row has no `rel_type` column".to_string())?
            .to_string();
        let direction = match row.get_bool("outgoing") {
            Some(true) => Direction::Outgoing,
            Some(false) => Direction::Incoming,
            None => return Err("row has no `outgoing` column".to_string()),
        };
        let neighbor_id = row
            .get_str("neighbor_id")
            .ok_or_else(|| "row has no `neighbor_id` column".to_string())?
            .to_string();
        let properties = row.get_object("props").cloned().unwrap_or_default();
        Ok(Self {
            rel_type,
            direction,
            neighbor_id,
            properties,
        })
    }

    pub fn id(&self) -> Option<&str> {
        self.properties.get(ID).and_then(JsonValue::as_str)
    }

    pub fn stamp(&self) -> Result<TemporalStamp, String> {
        TemporalStamp::from_properties(&self.properties)
    }

    pub fn is_current(&self) -> bool {
        self.properties
            .get(TT_END)
            .is_none_or(JsonValue::is_null)
    }
}
