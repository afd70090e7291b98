use serde::{de, Deserialize};
use url::Url;

// Deserialiser functions for metainfo.

pub fn opt_url_deserialize<'de, D>(deserializer: D) -> Result<Option<Url>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    Url::parse(&s).map(Some).map_err(de::Error::custom)
}

pub fn announce_list_deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<Vec<Url>>>, D::Error>
where
    D: de::Deserializer<'de>,
{
    let raw = Vec::<Vec<String>>::deserialize(deserializer)?;
    let mut announce_list = Vec::new();

    for tier in raw {
        let mut urls = Vec::new();
        for url in tier {
            urls.push(Url::parse(&url).map_err(de::Error::custom)?);
        }
        if !urls.is_empty() {
            announce_list.push(urls);
        }
    }

    let total = announce_list.iter().map(|v| v.len()).sum::<usize>();
    if total == 0 { Ok(None) } else { Ok(Some(announce_list)) }
}
