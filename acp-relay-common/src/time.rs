//! RFC 3339 (de)serialization for `chrono::DateTime<Utc>` fields.
use chrono::{DateTime, Utc};
use serde::{self, Deserialize, Deserializer, Serializer};

/// Serializes a `DateTime<Utc>` to an RFC 3339 string.
pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&time.to_rfc3339())
}

/// Deserializes an RFC 3339 string to a `DateTime<Utc>`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(serde::de::Error::custom)
}

/// Serde module for `Option<DateTime<Utc>>` fields.
pub mod option {
    use super::*;

    /// Serializes an `Option<DateTime<Utc>>` to an RFC 3339 string, or null.
    pub fn serialize<S>(time: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match time {
            Some(t) => serializer.serialize_some(&t.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    /// Deserializes an `Option<DateTime<Utc>>` from an RFC 3339 string, or null.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct Temp(#[serde(with = "super")] DateTime<Utc>);

        let opt: Option<Temp> = Option::deserialize(deserializer)?;
        Ok(opt.map(|Temp(dt)| dt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super")]
        at: DateTime<Utc>,
    }

    #[test]
    fn round_trips_through_rfc3339() {
        let at = Utc::now();
        let json = serde_json::to_string(&Wrapper { at }).unwrap();
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.at.timestamp_millis(), at.timestamp_millis());
    }
}
