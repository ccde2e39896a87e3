use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// A point on the globe in decimal degrees.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    /// Builds a location, rejecting anything outside `[-90, 90]` x `[-180, 180]`.
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        let loc = Self { lat, lon };
        loc.validate()?;
        Ok(loc)
    }

    pub fn validate(&self) -> Result<()> {
        // NaN fails both range checks
        if !(-90.0..=90.0).contains(&self.lat) {
            return Err(Error::InvalidInput(format!("latitude {} out of range [-90, 90]", self.lat)));
        }
        if !(-180.0..=180.0).contains(&self.lon) {
            return Err(Error::InvalidInput(format!("longitude {} out of range [-180, 180]", self.lon)));
        }
        Ok(())
    }
}

/// The indexed unit: one geo-tagged post and a reference to its stored asset.
///
/// On the wire (index documents, search responses, cache values) a record is
/// `{user, message, location: {lat, lon}, url}`. The id is the index's
/// primary key and travels as the document id, not in the body.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Record {
    #[serde(skip)]
    pub id: String,

    #[serde(rename = "user")]
    pub author: String,

    #[serde(rename = "message")]
    pub text: String,

    pub location: Location,

    /// Empty until the asset store write has succeeded.
    #[serde(rename = "url", default)]
    pub asset_ref: String,
}

impl Record {
    pub fn new(id: Uuid, author: impl Into<String>, text: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.to_string(),
            author: author.into(),
            text: text.into(),
            location,
            asset_ref: String::new(),
        }
    }

    pub fn with_asset(mut self, asset_ref: impl Into<String>) -> Self {
        self.asset_ref = asset_ref.into();
        self
    }

    pub fn has_asset(&self) -> bool {
        !self.asset_ref.is_empty()
    }
}

/// Serialized form of a search result, shared by the HTTP body and the cache.
pub fn encode_records(records: &[Record]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(records)?)
}

pub fn decode_records(bytes: &[u8]) -> Result<Vec<Record>> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_boundary_coordinates() {
        assert!(Location::new(90.0, 180.0).is_ok());
        assert!(Location::new(-90.0, -180.0).is_ok());
        assert!(Location::new(0.0, 0.0).is_ok());
    }

    #[test]
    fn rejects_out_of_range_and_nan() {
        for (lat, lon) in [(90.5, 0.0), (-91.0, 0.0), (0.0, 180.01), (0.0, -200.0), (f64::NAN, 0.0), (0.0, f64::NAN)] {
            match Location::new(lat, lon) {
                Err(Error::InvalidInput(_)) => {}
                other => panic!("expected InvalidInput for ({lat}, {lon}), got {other:?}"),
            }
        }
    }

    #[test]
    fn record_uses_reference_field_names() {
        let rec = Record::new(Uuid::new_v4(), "alice", "hello", Location { lat: 37.0, lon: -122.0 })
            .with_asset("https://example.test/a");
        let value = serde_json::to_value(&rec).unwrap();

        assert_eq!(value["user"], "alice");
        assert_eq!(value["message"], "hello");
        assert_eq!(value["location"]["lat"], 37.0);
        assert_eq!(value["url"], "https://example.test/a");
        assert!(value.get("id").is_none());
    }

    #[test]
    fn record_starts_without_asset() {
        let rec = Record::new(Uuid::new_v4(), "bob", "hi", Location { lat: 1.0, lon: 2.0 });
        assert!(!rec.has_asset());
        assert!(rec.with_asset("gs://x").has_asset());
    }

    #[test]
    fn empty_result_encodes_as_array() {
        assert_eq!(encode_records(&[]).unwrap(), b"[]");
        assert!(decode_records(b"[]").unwrap().is_empty());
    }
}
