//! Durations in configuration are written as (fractional) seconds.
use std::time::Duration;

use serde::{de::Error, Deserialize, Deserializer};

pub(crate) fn parse(value: f64) -> Result<Duration, String> {
    Duration::try_from_secs_f64(value).map_err(|e| format!("invalid duration {value}: {e}"))
}

pub(crate) fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    parse(f64::deserialize(deserializer)?).map_err(D::Error::custom)
}

pub(crate) fn deserialize_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<f64>::deserialize(deserializer)?
        .map(parse)
        .transpose()
        .map_err(D::Error::custom)
}
