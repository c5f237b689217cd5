//! ---
//! courier_section: "02-messaging-envelope"
//! courier_subsection: "module"
//! courier_type: "source"
//! courier_scope: "code"
//! courier_description: "Identity block attached to outgoing envelopes."
//! courier_version: "v0.0.0-prealpha"
//! courier_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Identity of a running component.
///
/// Built once when a producer starts and merged into the `fingerprint` of
/// every envelope it sends. `kind` classifies the component, it is not
/// related to the envelope type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Component name, usually the executable.
    pub name: String,
    /// Component classification.
    #[serde(rename = "type")]
    pub kind: String,
    /// Operating system process id.
    pub pid: String,
    /// Host running the component.
    pub host: String,
    /// User running the component.
    pub user: String,
    /// Broker virtual host the component is attached to.
    pub vhost: String,
}

impl Fingerprint {
    /// Fingerprint for the current process.
    pub fn new(name: impl Into<String>, vhost: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: "none".to_owned(),
            pid: std::process::id().to_string(),
            host: local_host(),
            user: local_user(),
            vhost: vhost.into(),
        }
    }

    /// Fingerprint named after the running executable.
    pub fn for_current_process(vhost: impl Into<String>) -> Self {
        let name = std::env::args().next().unwrap_or_else(|| "unknown".to_owned());
        Self::new(name, vhost)
    }

    /// Set the component classification.
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    /// Mapping form merged into envelopes.
    pub fn as_map(&self) -> Map<String, JsonValue> {
        let mut map = Map::new();
        map.insert("name".into(), JsonValue::from(self.name.clone()));
        map.insert("type".into(), JsonValue::from(self.kind.clone()));
        map.insert("pid".into(), JsonValue::from(self.pid.clone()));
        map.insert("host".into(), JsonValue::from(self.host.clone()));
        map.insert("user".into(), JsonValue::from(self.user.clone()));
        map.insert("vhost".into(), JsonValue::from(self.vhost.clone()));
        map
    }

    /// Positional form `(name, type, pid, host, user, vhost)`.
    pub fn as_tuple(&self) -> (&str, &str, &str, &str, &str, &str) {
        (
            &self.name,
            &self.kind,
            &self.pid,
            &self.host,
            &self.user,
            &self.vhost,
        )
    }

    /// Merge caller supplied overrides. Unknown keys are kept by the
    /// returned mapping so they still reach outgoing envelopes.
    pub fn merged_with(&self, overrides: &Map<String, JsonValue>) -> Map<String, JsonValue> {
        let mut map = self.as_map();
        for (key, value) in overrides {
            map.insert(key.clone(), value.clone());
        }
        map
    }
}

fn local_host() -> String {
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.trim().is_empty() {
            return host.trim().to_owned();
        }
    }
    std::fs::read_to_string("/etc/hostname")
        .map(|raw| raw.trim().to_owned())
        .ok()
        .filter(|host| !host.is_empty())
        .unwrap_or_else(|| "localhost".to_owned())
}

fn local_user() -> String {
    ["USER", "USERNAME", "LOGNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|user| !user.is_empty()))
        .unwrap_or_else(|| "unknown".to_owned())
}
