use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::*;

/// Service class of the private mail services.
pub const MAIL_CLASS_PRIVATE: &str = "private";

/// Client-side settings for talking to the mail services.
///
/// Every field has a default, so a JSON file only needs the values it
/// changes:
///
/// ```
/// let config = mailio::Config::from_json(r#"{ "queue_directory": "/tmp/spool" }"#)?;
/// assert_eq!(config.bounce_service, "bounce");
/// assert_eq!(
///     config.service_address("private", "bounce"),
///     "unix:/tmp/spool/private/bounce"
/// );
/// # Ok::<(), mailio::Error>(())
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub queue_directory: PathBuf,
    pub bounce_service: String,
    pub defer_service: String,
    pub trace_service: String,
    /// Deadline for a reply, and bound on blocking socket I/O.
    pub ipc_timeout_secs: u64,
    pub connect_attempts: u32,
    pub connect_retry_delay_ms: u64,
    /// `"class/name"` to address overrides, e.g.
    /// `"private/bounce": "tcp:127.0.0.1:10025"`.
    pub services: BTreeMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            queue_directory: PathBuf::from("/var/spool/postfix"),
            bounce_service: "bounce".into(),
            defer_service: "defer".into(),
            trace_service: "trace".into(),
            ipc_timeout_secs: 3600,
            connect_attempts: 5,
            connect_retry_delay_ms: 1000,
            services: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_json(s: &str) -> Result<Config> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
        let s = fs::read_to_string(path)?;
        Config::from_json(&s)
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_secs(self.ipc_timeout_secs)
    }

    pub fn connect_retry_delay(&self) -> Duration {
        Duration::from_millis(self.connect_retry_delay_ms)
    }

    /// Address of service `name` in `class`: the override from `services`,
    /// or the UNIX socket `<queue_directory>/<class>/<name>`.
    pub fn service_address(&self, class: &str, name: &str) -> String {
        let key = format!("{}/{}", class, name);
        match self.services.get(&key) {
            Some(address) => address.clone(),
            None => format!(
                "unix:{}",
                self.queue_directory.join(class).join(name).display()
            ),
        }
    }
}
