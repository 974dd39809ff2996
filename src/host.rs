//! Remote hosts taking part in a pipeline run.
//!
//! The host set is fixed for the lifetime of one run. It comes either from
//! the `EXISTING_NODES` environment variable (a comma-separated list handed
//! over by the CI system) or from the `hosts` section of the configuration
//! file, where each entry is a bare hostname string or a mapping. The first
//! host in input order is the master.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::str::FromStr;

use colored::*;
use colourado::Color;
use itertools::sorted;
use serde::de::{self, value::MapAccessDeserializer, MapAccess, Visitor};
use serde::{Deserialize, Deserializer};
use void::Void;

use crate::error::NexusError;

#[derive(Debug, Clone, PartialEq)]
pub struct HostTarget {
    /// Hostname or address to connect to.
    pub hostname: String,
    /// Login user. Falls back to the configured default when absent.
    pub user: Option<String>,
    /// SSH port. The transport default applies when absent.
    pub port: Option<u16>,
    /// Extra per-host parameters used to fill in command templates.
    pub params: HashMap<String, String>,
}

impl HostTarget {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            user: None,
            port: None,
            params: HashMap::new(),
        }
    }

    /// The destination string handed to the SSH client.
    pub fn destination(&self) -> String {
        let user = self
            .user
            .as_ref()
            .map(|u| format!("{}@", u))
            .unwrap_or_default();
        match self.port {
            Some(port) => format!("ssh://{}{}:{}", user, self.hostname, port),
            None => format!("{}{}", user, self.hostname),
        }
    }

    /// For pretty-printing the host name.
    /// Surrounds with brackets and colors it with the host's palette color.
    pub fn prettify(&self, color: Color) -> ColoredString {
        let r = (color.red * 256.0) as u8;
        let g = (color.green * 256.0) as u8;
        let b = (color.blue * 256.0) as u8;
        format!("{}", self).truecolor(r, g, b)
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "[")?;
        if let Some(user) = &self.user {
            write!(f, "{}@", user)?;
        }
        write!(f, "{}", self.hostname)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        if !self.params.is_empty() {
            write!(f, " (")?;
            for (i, (key, value)) in sorted(self.params.iter()).enumerate() {
                if i == 0 {
                    write!(f, "{}={}", key, value)?;
                } else {
                    write!(f, ",{}={}", key, value)?;
                }
            }
            write!(f, ")")?;
        }
        write!(f, "]")
    }
}

/// A host entry in the configuration file: a bare hostname string or a
/// mapping with at least the `hostname` key.
#[derive(Debug, Deserialize)]
pub struct HostSpec(#[serde(deserialize_with = "string_or_mapping")] HostSpecInner);

#[derive(Debug, Deserialize)]
#[serde(transparent)]
struct HostSpecInner(HashMap<String, serde_yaml::Value>);

impl FromStr for HostSpecInner {
    type Err = Void;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut map = HashMap::new();
        map.insert(
            "hostname".to_string(),
            serde_yaml::Value::String(s.to_string()),
        );
        Ok(Self(map))
    }
}

fn scalar(value: &serde_yaml::Value) -> Option<String> {
    match value {
        serde_yaml::Value::String(s) => Some(s.clone()),
        serde_yaml::Value::Number(n) => Some(n.to_string()),
        serde_yaml::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn to_target(spec: &HostSpec) -> Result<HostTarget, NexusError> {
    let HostSpec(HostSpecInner(map)) = spec;
    let hostname = map
        .get("hostname")
        .and_then(scalar)
        .ok_or_else(|| NexusError::InvalidConf("A host entry is missing the 'hostname' key.".to_string()))?;
    let mut host = HostTarget::new(hostname);
    for (key, value) in map {
        let value = match scalar(value) {
            Some(value) => value,
            None => {
                return Err(NexusError::InvalidConf(format!(
                    "Host entry key '{}' does not hold a scalar value.",
                    key
                )))
            }
        };
        match key.as_str() {
            "hostname" => {}
            "user" => host.user = Some(value),
            "port" => {
                host.port = Some(value.parse().map_err(|_| {
                    NexusError::InvalidConf(format!("Invalid port '{}' in host entry.", value))
                })?)
            }
            _ => {
                host.params.insert(key.clone(), value);
            }
        }
    }
    Ok(host)
}

/// Resolves the host set for this run. `EXISTING_NODES` wins over the
/// configuration file's `hosts` section when both are present.
pub fn get_hosts(
    specs: &[HostSpec],
    existing_nodes: Option<&str>,
    default_user: Option<&str>,
) -> Result<Vec<HostTarget>, NexusError> {
    let mut hosts = match existing_nodes {
        Some(nodes) => nodes
            .split(',')
            .map(str::trim)
            .filter(|node| !node.is_empty())
            .map(HostTarget::new)
            .collect::<Vec<_>>(),
        None => specs
            .iter()
            .map(to_target)
            .collect::<Result<Vec<_>, _>>()?,
    };

    if hosts.is_empty() {
        return Err(NexusError::InvalidConf(
            "No hosts: set EXISTING_NODES or fill in the 'hosts' section.".to_string(),
        ));
    }

    for host in hosts.iter_mut() {
        if host.user.is_none() {
            host.user = default_user.map(str::to_string);
        }
    }

    eprintln!("[nexus] Hosts detected:\n{:#?}", &hosts);
    Ok(hosts)
}

/// A Visitor implementation that is able to parse either a bare string or a mapping.
/// https://serde.rs/string-or-struct.html
fn string_or_mapping<'de, T, D>(deserializer: D) -> Result<T, D::Error>
where
    T: Deserialize<'de> + FromStr<Err = Void>,
    D: Deserializer<'de>,
{
    struct StringOrMapping<T>(PhantomData<fn() -> T>);

    impl<'de, T> Visitor<'de> for StringOrMapping<T>
    where
        T: Deserialize<'de> + FromStr<Err = Void>,
    {
        type Value = T;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("string or mapping")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(FromStr::from_str(value).unwrap())
        }

        fn visit_map<M>(self, map: M) -> Result<Self::Value, M::Error>
        where
            M: MapAccess<'de>,
        {
            Deserialize::deserialize(MapAccessDeserializer::new(map))
        }
    }

    deserializer.deserialize_any(StringOrMapping(PhantomData))
}
