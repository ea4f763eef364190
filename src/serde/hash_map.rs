//! YAML mapping keys are strings, so maps keyed by chain ids are (de)serialized with their keys
//! rendered via [`ToString`] and parsed back via [`FromStr`].

use alloy::primitives::map::HashMap;
use serde::{self, Deserialize, Deserializer, Serialize, Serializer, de::Error};
use std::{collections::BTreeMap, fmt::Display, hash::Hash, str::FromStr};

/// Serializes a [`HashMap`] with stringified keys, sorted for stable output.
pub fn serialize<S, K, V>(map: &HashMap<K, V>, serializer: S) -> Result<S::Ok, S::Error>
where
    K: ToString + Hash + Eq,
    V: Serialize,
    S: Serializer,
{
    map.iter().map(|(k, v)| (k.to_string(), v)).collect::<BTreeMap<_, _>>().serialize(serializer)
}

/// Deserializes a map with string keys into a [`HashMap`].
pub fn deserialize<'de, K, V, D>(deserializer: D) -> Result<HashMap<K, V>, D::Error>
where
    K: FromStr<Err: Display> + Hash + Eq,
    V: Deserialize<'de>,
    D: Deserializer<'de>,
{
    BTreeMap::<String, V>::deserialize(deserializer).and_then(|map| {
        map.into_iter()
            .map(|(k, v)| K::from_str(&k).map(|k| (k, v)).map_err(D::Error::custom))
            .collect()
    })
}
