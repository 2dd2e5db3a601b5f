//! Entry metadata codec.
//!
//! Metadata travels next to the body in the key-value store and carries the
//! origin response headers as an ordered `name -> value` mapping:
//!
//! ```json
//! {"headers": {"content-type": "application/json", "etag": "\"abc\""}}
//! ```

use std::fmt;

use axum::http::{HeaderMap, HeaderName, HeaderValue, header};
use serde::{
    Deserialize, Deserializer, Serialize, Serializer,
    de::{MapAccess, Visitor},
    ser::SerializeMap,
};

/// Headers that must not be replayed to another client.
static UNREPLAYABLE_HEADERS: [HeaderName; 9] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    HeaderName::from_static("proxy-connection"),
    header::TRANSFER_ENCODING,
    header::TE,
    header::TRAILER,
    header::UPGRADE,
    header::CONTENT_LENGTH,
    header::SET_COOKIE,
];

/// Returns true for hop-by-hop headers that a proxy strips before forwarding.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    UNREPLAYABLE_HEADERS[..7].contains(name)
}

fn is_unreplayable(name: &HeaderName) -> bool {
    UNREPLAYABLE_HEADERS.contains(name)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMetadata {
    #[serde(with = "ordered_headers")]
    headers: Vec<(String, String)>,
}

impl EntryMetadata {
    pub fn new(headers: Vec<(String, String)>) -> Self {
        Self { headers }
    }

    /// Capture replayable headers, in order, from an origin response.
    ///
    /// Values that are not visible ASCII are skipped.
    pub fn capture(headers: &HeaderMap) -> Self {
        let headers = headers
            .iter()
            .filter(|(name, _)| !is_unreplayable(name))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_string(), value.to_string()))
            })
            .collect();
        Self { headers }
    }

    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Rebuild a header map, dropping entries that no longer parse.
    pub fn to_header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod ordered_headers {
    use super::*;

    pub fn serialize<S>(headers: &[(String, String)], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(Some(headers.len()))?;
        for (name, value) in headers {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_map(OrderedHeadersVisitor)
    }

    struct OrderedHeadersVisitor;

    impl<'de> Visitor<'de> for OrderedHeadersVisitor {
        type Value = Vec<(String, String)>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a map of header names to string values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut headers = Vec::with_capacity(access.size_hint().unwrap_or(0));
            while let Some((name, value)) = access.next_entry::<String, String>()? {
                headers.push((name, value));
            }
            Ok(headers)
        }
    }
}
