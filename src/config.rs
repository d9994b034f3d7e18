//! Loading of the operator settings file.
//!
//! The settings live in an INI file with a `keystone` section:
//!
//! ```ini
//! [keystone]
//! tenantname = admin
//! username = admin
//! password = secret
//! region = Spain2
//! # optional
//! url = http://cloud.lab.fi-ware.org:4730
//! timeout = 60
//! ```
use crate::{Error, Result};
use ini::Ini;
use std::{
    ffi::OsString,
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable pointing at the settings file.
pub const SETTINGS_ENV: &str = "FIWARE_USERS_SETTINGS_FILE";
/// Location used when neither a path nor [`SETTINGS_ENV`] is given.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/fiware.d/fiware-users.ini";

const SECTION: &str = "keystone";
const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub tenant_name: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("tenant_name", &self.tenant_name)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub credentials: Credentials,
    pub region: String,
    pub url: String,
    pub timeout: Duration,
}

/// Picks the settings file: an explicit path wins over the environment, which wins over
/// [`DEFAULT_SETTINGS_PATH`]. An empty environment value counts as unset.
pub fn settings_path(explicit: Option<PathBuf>, env: Option<OsString>) -> PathBuf {
    explicit
        .or_else(|| env.filter(|v| !v.is_empty()).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETTINGS_PATH))
}

impl Settings {
    /// Loads the file chosen by [`settings_path`] using the process environment.
    pub fn locate(explicit: Option<PathBuf>) -> Result<Self> {
        let path = settings_path(explicit, std::env::var_os(SETTINGS_ENV));
        Self::load(&path)
    }

    pub fn load(path: &Path) -> Result<Self> {
        tracing::debug!(path = %path.display(), "reading settings");
        let ini = Ini::load_from_file(path).map_err(|e| {
            Error::Config(format!(
                "cannot read {}: {}. Set {} to point at the settings file or create {}",
                path.display(),
                e,
                SETTINGS_ENV,
                DEFAULT_SETTINGS_PATH
            ))
        })?;
        Self::from_ini(&ini, path)
    }

    fn from_ini(ini: &Ini, origin: &Path) -> Result<Self> {
        let section = ini.section(Some(SECTION)).ok_or_else(|| {
            Error::Config(format!(
                "{} has no [{}] section",
                origin.display(),
                SECTION
            ))
        })?;
        let required = |key: &str| {
            section.get(key).map(str::to_owned).ok_or_else(|| {
                Error::Config(format!(
                    "{} is missing key '{}' in [{}]",
                    origin.display(),
                    key,
                    SECTION
                ))
            })
        };

        let timeout = match section.get("timeout") {
            Some(raw) => raw.trim().parse::<u64>().map_err(|_| {
                Error::Config(format!(
                    "{}: timeout must be a whole number of seconds, got {:?}",
                    origin.display(),
                    raw
                ))
            })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        Ok(Settings {
            credentials: Credentials {
                tenant_name: required("tenantname")?,
                username: required("username")?,
                password: required("password")?,
            },
            region: required("region")?,
            url: section
                .get("url")
                .unwrap_or(crate::DEFAULT_KEYSTONE_URI)
                .to_owned(),
            timeout: Duration::from_secs(timeout),
        })
    }
}

impl std::str::FromStr for Settings {
    type Err = Error;

    fn from_str(contents: &str) -> Result<Self> {
        let ini = Ini::load_from_str(contents).map_err(|e| Error::Config(e.to_string()))?;
        Self::from_ini(&ini, Path::new("<string>"))
    }
}
