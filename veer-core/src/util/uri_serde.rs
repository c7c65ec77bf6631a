use http::Uri;
use serde::{de, Deserialize, Deserializer, Serializer};

pub fn deserialize<'de, D>(deserializer: D) -> Result<Uri, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.parse().map_err(de::Error::custom)
}

pub fn serialize<S>(uri: &Uri, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&uri.to_string())
}

/// Same as the sibling functions but for `Vec<Uri>` fields (LB endpoint
/// lists).
pub mod vec {
    use http::Uri;
    use serde::{de, ser::SerializeSeq, Deserialize, Deserializer, Serializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Uri>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|s| s.parse().map_err(de::Error::custom))
            .collect()
    }

    pub fn serialize<S>(uris: &[Uri], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut seq = serializer.serialize_seq(Some(uris.len()))?;
        for uri in uris {
            seq.serialize_element(&uri.to_string())?;
        }
        seq.end()
    }
}
