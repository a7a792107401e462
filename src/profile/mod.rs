//! Per destination transfer settings.
//!
//! A [`ProfileRegistry`] hands out one shared [`Profile`] per key. The first
//! caller for a key decides its initial settings; later callers get the same
//! instance and see whatever other holders wrote into it.
use std::{collections::HashMap, str::FromStr, sync::Arc, time::Duration};

use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use smol_str::SmolStr;

use crate::{secs, transfer::TransferOptions, Result, TransportError};

/// Optional overrides; `None` keeps the engine default.
#[derive(Deserialize, Default, Clone, Debug, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SiteProfile {
    #[serde(deserialize_with = "secs::deserialize_opt")]
    pub timeout: Option<Duration>,
    #[serde(deserialize_with = "secs::deserialize_opt")]
    pub connect_timeout: Option<Duration>,
    /// Bytes per second below which a transfer counts as too slow.
    pub low_speed_limit: Option<u32>,
    #[serde(deserialize_with = "secs::deserialize_opt")]
    pub low_speed_time: Option<Duration>,
    pub max_send_speed: Option<u64>,
    pub max_recv_speed: Option<u64>,
    pub max_connects: Option<u32>,
    pub fresh_connect: Option<bool>,
    pub forbid_reuse: Option<bool>,
}

impl SiteProfile {
    pub const FIELDS: &'static [&'static str] = &[
        "timeout",
        "connect_timeout",
        "low_speed_limit",
        "low_speed_time",
        "max_send_speed",
        "max_recv_speed",
        "max_connects",
        "fresh_connect",
        "forbid_reuse",
    ];

    /// Set one field from its textual form. Durations are seconds.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "timeout" => self.timeout = Some(duration(name, value)?),
            "connect_timeout" => self.connect_timeout = Some(duration(name, value)?),
            "low_speed_limit" => self.low_speed_limit = Some(number(name, value)?),
            "low_speed_time" => self.low_speed_time = Some(duration(name, value)?),
            "max_send_speed" => self.max_send_speed = Some(number(name, value)?),
            "max_recv_speed" => self.max_recv_speed = Some(number(name, value)?),
            "max_connects" => self.max_connects = Some(number(name, value)?),
            "fresh_connect" => self.fresh_connect = Some(flag(name, value)?),
            "forbid_reuse" => self.forbid_reuse = Some(flag(name, value)?),
            _ => {
                return Err(TransportError::config(format!(
                    "name '{name}' is not defined"
                )))
            }
        }
        Ok(())
    }

    /// Copy every field that is set onto `options`.
    pub fn apply(&self, options: &mut TransferOptions) {
        if let Some(v) = self.timeout {
            options.timeout = Some(v);
        }
        if let Some(v) = self.connect_timeout {
            options.connect_timeout = Some(v);
        }
        if let Some(v) = self.low_speed_limit {
            options.low_speed_limit = Some(v);
        }
        if let Some(v) = self.low_speed_time {
            options.low_speed_time = Some(v);
        }
        if let Some(v) = self.max_send_speed {
            options.max_send_speed = Some(v);
        }
        if let Some(v) = self.max_recv_speed {
            options.max_recv_speed = Some(v);
        }
        if let Some(v) = self.max_connects {
            options.max_connects = Some(v);
        }
        if let Some(v) = self.fresh_connect {
            options.fresh_connect = Some(v);
        }
        if let Some(v) = self.forbid_reuse {
            options.forbid_reuse = Some(v);
        }
    }
}

fn duration(name: &str, value: &str) -> Result<Duration> {
    let seconds: f64 = number(name, value)?;
    secs::parse(seconds).map_err(|e| TransportError::config(format!("{name}: {e}")))
}

fn number<T: FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| TransportError::config(format!("invalid value {value:?} for {name}: {e}")))
}

fn flag(name: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(TransportError::config(format!(
            "invalid value {value:?} for {name}: expected a boolean"
        ))),
    }
}

/// A registered profile, shared by everything talking to one destination.
#[derive(Debug)]
pub struct Profile {
    key: SmolStr,
    settings: RwLock<SiteProfile>,
}

impl Profile {
    #[inline]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Snapshot of the current settings.
    pub fn settings(&self) -> SiteProfile {
        self.settings.read().clone()
    }

    /// Mutate the shared settings in place.
    pub fn update<R>(&self, f: impl FnOnce(&mut SiteProfile) -> R) -> R {
        f(&mut self.settings.write())
    }

    pub fn apply(&self, options: &mut TransferOptions) {
        self.settings.read().apply(options);
    }
}

#[derive(Default, Debug)]
pub struct ProfileRegistry {
    profiles: Mutex<HashMap<SmolStr, Arc<Profile>>>,
}

impl ProfileRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the profile for `key`, creating an empty one if absent.
    pub fn get(&self, key: &str) -> Arc<Profile> {
        self.get_or_insert(key, SiteProfile::default())
    }

    /// Like [`get`](Self::get), applying textual overrides when the profile
    /// is created. Overrides are validated even if the profile already
    /// exists, and then ignored.
    pub fn get_with<'a, I>(&self, key: &str, overrides: I) -> Result<Arc<Profile>>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut settings = SiteProfile::default();
        for (name, value) in overrides {
            settings.set_option(name, value)?;
        }
        Ok(self.get_or_insert(key, settings))
    }

    pub fn get_or_insert(&self, key: &str, settings: SiteProfile) -> Arc<Profile> {
        self.profiles
            .lock()
            .entry(SmolStr::new(key))
            .or_insert_with_key(|key| {
                #[cfg(feature = "logging")]
                tracing::debug!("register site profile {}", key);
                Arc::new(Profile {
                    key: key.clone(),
                    settings: RwLock::new(settings),
                })
            })
            .clone()
    }

    /// Register profiles from a JSON object keyed by destination. Keys that
    /// are already registered keep their current settings. Returns the
    /// number of newly registered profiles.
    ///
    /// Malformed JSON is a [`TransportError::Json`]; well formed JSON with
    /// unknown fields or bad values is a [`TransportError::Config`].
    pub fn load_json(&self, json: &str) -> Result<usize> {
        let parsed: HashMap<String, SiteProfile> =
            serde_json::from_str(json).map_err(|e| match e.classify() {
                serde_json::error::Category::Data => TransportError::config(e.to_string()),
                _ => TransportError::Json(e),
            })?;
        let mut profiles = self.profiles.lock();
        let before = profiles.len();
        for (key, settings) in parsed {
            profiles.entry(SmolStr::new(&key)).or_insert_with_key(|key| {
                Arc::new(Profile {
                    key: key.clone(),
                    settings: RwLock::new(settings),
                })
            });
        }
        Ok(profiles.len() - before)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.profiles.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.profiles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.lock().is_empty()
    }
}
