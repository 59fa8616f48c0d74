//! Static payload schemas for `Message::data` and `Message::metadata`.
//!
//! Both are adjacently tagged (`{"type": .., "content": {..}}`). An unknown
//! tag or an undeclared field fails deserialization. Loosely typed values
//! coming from game servers are normalised through `coerce`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Data {
    #[default]
    Empty,
    /// Server snapshot sent by the peer in answer to `initialize`.
    Init(InitData),
    /// Settings pushed to the peer during initialization.
    PostInit(PostInitData),
    Event(EventData),
    Query(QueryData),
    QueryResult(QueryResultData),
    SendToChannel(SendToChannelData),
    /// Call an extension function on the game server.
    Arma(ArmaData),
}

impl Data {
    pub fn tag(&self) -> &'static str {
        match self {
            Data::Empty => "empty",
            Data::Init(_) => "init",
            Data::PostInit(_) => "post_init",
            Data::Event(_) => "event",
            Data::Query(_) => "query",
            Data::QueryResult(_) => "query_result",
            Data::SendToChannel(_) => "send_to_channel",
            Data::Arma(_) => "arma",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct InitData {
    pub server_name: String,
    #[serde(deserialize_with = "coerce::integer")]
    pub price_per_object: i64,
    #[serde(deserialize_with = "coerce::integer")]
    pub territory_lifetime: i64,
    #[serde(default, deserialize_with = "coerce::pair_map")]
    pub territory_data: BTreeMap<String, Value>,
    #[serde(deserialize_with = "coerce::datetime")]
    pub server_start_time: DateTime<Utc>,
    #[serde(deserialize_with = "coerce::string")]
    pub extension_version: String,
    #[serde(default, deserialize_with = "coerce::boolean")]
    pub vg_enabled: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostInitData {
    #[serde(deserialize_with = "coerce::string")]
    pub community_id: String,
    #[serde(default, deserialize_with = "coerce::optional_string")]
    pub extdb_path: Option<String>,
    #[serde(default, deserialize_with = "coerce::integer")]
    pub gambling_modifier: i64,
    #[serde(default, deserialize_with = "coerce::integer")]
    pub gambling_payout_base: i64,
    #[serde(default)]
    pub territory_admin_uids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventData {
    pub name: String,
    #[serde(default, deserialize_with = "coerce::pair_map")]
    pub attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryData {
    pub name: String,
    #[serde(default, deserialize_with = "coerce::pair_map")]
    pub arguments: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryResultData {
    #[serde(default)]
    pub results: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendToChannelData {
    #[serde(deserialize_with = "coerce::string")]
    pub id: String,
    pub content: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArmaData {
    pub function_name: String,
    #[serde(default)]
    pub arguments: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum Metadata {
    #[default]
    Empty,
    /// Attached to messages triggered by an in-game player command.
    Command(CommandMetadata),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandMetadata {
    #[serde(deserialize_with = "coerce::string")]
    pub player_uid: String,
    #[serde(default, deserialize_with = "coerce::optional_string")]
    pub target_uid: Option<String>,
}

/// `deserialize_with` helpers that accept the loose forms game servers send.
pub mod coerce {
    use std::collections::BTreeMap;

    use chrono::{DateTime, Utc};
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Integers, or strings holding one (`"42"`).
    pub fn integer<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| D::Error::custom(format!("expected an integer, got {n}"))),
            Value::String(s) => s
                .trim()
                .parse()
                .map_err(|_| D::Error::custom(format!("expected an integer, got {s:?}"))),
            other => Err(D::Error::custom(format!("expected an integer, got {other}"))),
        }
    }

    /// Booleans, or the strings `"true"`/`"false"` in any case.
    pub fn boolean<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Bool(b) => Ok(b),
            Value::String(s) if s.eq_ignore_ascii_case("true") => Ok(true),
            Value::String(s) if s.eq_ignore_ascii_case("false") => Ok(false),
            other => Err(D::Error::custom(format!("expected a boolean, got {other}"))),
        }
    }

    /// RFC 3339 timestamps, or unix seconds.
    pub fn datetime<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => DateTime::parse_from_rfc3339(s.trim())
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| D::Error::custom(format!("invalid timestamp {s:?}: {e}"))),
            Value::Number(n) => n
                .as_i64()
                .and_then(|secs| DateTime::from_timestamp(secs, 0))
                .ok_or_else(|| D::Error::custom(format!("invalid unix timestamp {n}"))),
            other => Err(D::Error::custom(format!("expected a timestamp, got {other}"))),
        }
    }

    /// Strings, with numbers rendered to text (Steam and Discord ids arrive as either).
    pub fn string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
        scalar_text(Value::deserialize(deserializer)?)
    }

    pub fn optional_string<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<String>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(None),
            value => scalar_text(value).map(Some),
        }
    }

    fn scalar_text<E: Error>(value: Value) -> Result<String, E> {
        match value {
            Value::String(s) => Ok(s),
            Value::Number(n) => Ok(n.to_string()),
            other => Err(E::custom(format!("expected a string, got {other}"))),
        }
    }

    /// Objects, or lists of `[key, value]` pairs. Nested pair lists become
    /// nested objects.
    pub fn pair_map<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<String, Value>, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::Null => Ok(BTreeMap::new()),
            Value::Object(map) => Ok(map.into_iter().map(|(k, v)| (k, normalize(v))).collect()),
            Value::Array(items) => pairs_to_map(items).ok_or_else(|| {
                D::Error::custom("expected a list of [key, value] pairs")
            }),
            other => Err(D::Error::custom(format!("expected a map, got {other}"))),
        }
    }

    fn pairs_to_map(items: Vec<Value>) -> Option<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        for item in items {
            let Value::Array(mut pair) = item else {
                return None;
            };
            if pair.len() != 2 {
                return None;
            }
            let value = pair.pop()?;
            let Value::String(key) = pair.pop()? else {
                return None;
            };
            map.insert(key, normalize(value));
        }
        Some(map)
    }

    fn is_pair_list(items: &[Value]) -> bool {
        !items.is_empty()
            && items.iter().all(|item| {
                matches!(item, Value::Array(pair) if pair.len() == 2 && pair[0].is_string())
            })
    }

    fn normalize(value: Value) -> Value {
        match value {
            Value::Array(items) if is_pair_list(&items) => match pairs_to_map(items) {
                Some(map) => Value::Object(map.into_iter().collect()),
                None => Value::Null,
            },
            Value::Array(items) => Value::Array(items.into_iter().map(normalize).collect()),
            Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
            }
            other => other,
        }
    }
}
