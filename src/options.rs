//! Options for connecting to a single server.

use std::collections::BTreeMap;
use std::time::Duration;

use mysql_async::{Opts, OptsBuilder};

use crate::error::{Error, Result};

/// Schema used when the caller does not name one.
pub(crate) const DEFAULT_DATABASE: &str = "information_schema";

/// The server kills sessions idle for 8 hours; we preemptively reconnect
/// after 7 so the next statement never observes the dead socket.
const DEFAULT_MAX_IDLE_TIME: Duration = Duration::from_secs(7 * 3600);

/// Options which can be used to configure how a connection is opened.
///
/// Defaults match the wire surface: port 3306, user `root`, empty password,
/// the `information_schema` database. Extra driver knobs go through
/// [`driver_option`](ConnectOptions::driver_option); the knob map is ordered
/// and participates in pool-key identity, so two option sets are
/// interchangeable only when they are element-wise equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectOptions {
    host: String,
    port: u16,
    user: String,
    password: String,
    database: Option<String>,
    max_idle_time: Duration,
    driver: BTreeMap<String, String>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions::new("127.0.0.1")
    }
}

impl ConnectOptions {
    pub fn new(host: impl Into<String>) -> Self {
        ConnectOptions {
            host: host.into(),
            port: 3306,
            user: "root".to_owned(),
            password: String::new(),
            database: None,
            max_idle_time: DEFAULT_MAX_IDLE_TIME,
            driver: BTreeMap::new(),
        }
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// How long a session may sit unused before the next statement silently
    /// reconnects it.
    pub fn max_idle_time(mut self, max_idle_time: Duration) -> Self {
        self.max_idle_time = max_idle_time;
        self
    }

    /// Sets a driver knob. Recognised knobs: `connect_timeout` (seconds),
    /// `wait_timeout` (seconds), `tcp_keepalive` (milliseconds). An
    /// unrecognised knob fails with [`Error::Usage`] when the connection is
    /// opened.
    pub fn driver_option(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.driver.insert(name.into(), value.into());
        self
    }

    pub fn get_host(&self) -> &str {
        &self.host
    }

    pub fn get_port(&self) -> u16 {
        self.port
    }

    pub fn get_user(&self) -> &str {
        &self.user
    }

    pub fn get_password(&self) -> &str {
        &self.password
    }

    pub fn get_database(&self) -> Option<&str> {
        self.database.as_deref()
    }

    pub fn get_max_idle_time(&self) -> Duration {
        self.max_idle_time
    }

    pub fn get_driver_options(&self) -> &BTreeMap<String, String> {
        &self.driver
    }

    pub(crate) fn database_or_default(&self) -> &str {
        self.database.as_deref().unwrap_or(DEFAULT_DATABASE)
    }

    pub(crate) fn set_database(&mut self, database: &str) {
        self.database = Some(database.to_owned());
    }

    /// The TCP connect timeout, if one was configured. Enforced around the
    /// driver's connect future since the driver has no knob for it.
    pub(crate) fn connect_timeout(&self) -> Result<Option<Duration>> {
        match self.driver.get("connect_timeout") {
            None => Ok(None),
            Some(raw) => Ok(Some(Duration::from_secs(parse_knob(
                "connect_timeout",
                raw,
            )?))),
        }
    }

    pub(crate) fn to_driver_opts(&self) -> Result<Opts> {
        let mut builder = OptsBuilder::default()
            .ip_or_hostname(self.host.clone())
            .tcp_port(self.port)
            .user(Some(self.user.clone()))
            .pass(Some(self.password.clone()))
            .db_name(Some(self.database_or_default().to_owned()))
            .setup(vec!["SET NAMES utf8".to_owned()]);

        for (name, value) in &self.driver {
            builder = match name.as_str() {
                // handled in `connect_timeout`, validated here
                "connect_timeout" => {
                    parse_knob::<u64>(name, value)?;
                    builder
                }
                "wait_timeout" => {
                    let seconds: usize = parse_knob(name, value)?;
                    builder.wait_timeout(Some(seconds))
                }
                "tcp_keepalive" => {
                    let milliseconds: u32 = parse_knob(name, value)?;
                    builder.tcp_keepalive(Some(milliseconds))
                }
                _ => {
                    return Err(Error::Usage(format!(
                        "unrecognised driver option {name:?}"
                    )))
                }
            };
        }

        Ok(Opts::from(builder))
    }
}

fn parse_knob<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| Error::Usage(format!("invalid value {raw:?} for driver option {name:?}")))
}
