use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use mokapapp_core::{Colour, PanelError};
use mokapapp_panelapp::PanelAppEndpoints;
use serde::Deserialize;

const DEFAULT_MIN_PANEL_COUNT: usize = 500;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(default)]
    mokapapp: SettingsSection,
    endpoints: Option<EndpointsSection>,
    #[serde(default)]
    database: BTreeMap<String, DatabaseSection>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct SettingsSection {
    min_panel_count: usize,
    colours: Vec<String>,
    http_timeout_secs: u64,
}

impl Default for SettingsSection {
    fn default() -> Self {
        Self {
            min_panel_count: DEFAULT_MIN_PANEL_COUNT,
            colours: vec!["Green".to_string(), "Amber".to_string()],
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EndpointsSection {
    panels: String,
    signed_off_panels: String,
}

#[derive(Debug, Deserialize)]
struct DatabaseSection {
    path: PathBuf,
}

/// Validated run configuration.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Config {
    pub min_panel_count: usize,
    pub colours: BTreeSet<Colour>,
    pub http_timeout: Duration,
    pub endpoints: PanelAppEndpoints,
    pub databases: BTreeMap<String, PathBuf>,
}

impl Config {
    /// # Errors
    /// Returns [`PanelError::Configuration`] when the file cannot be read or
    /// fails validation.
    pub fn load(path: &Path) -> Result<Self, PanelError> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            PanelError::Configuration(format!("failed to read config {}: {err}", path.display()))
        })?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            PanelError::Configuration(message) => {
                PanelError::Configuration(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// # Errors
    /// Returns [`PanelError::Configuration`] for invalid TOML, a missing
    /// `[endpoints]` table, an empty or unknown colour, or a zero timeout.
    pub fn from_toml_str(raw: &str) -> Result<Self, PanelError> {
        let file: ConfigFile =
            toml::from_str(raw).map_err(|err| PanelError::Configuration(err.to_string()))?;

        let endpoints = file
            .endpoints
            .ok_or_else(|| PanelError::Configuration("missing [endpoints] section".to_string()))?;
        for (name, value) in [
            ("endpoints.panels", &endpoints.panels),
            ("endpoints.signed_off_panels", &endpoints.signed_off_panels),
        ] {
            if value.trim().is_empty() {
                return Err(PanelError::Configuration(format!("{name} must not be empty")));
            }
        }

        if file.mokapapp.colours.is_empty() {
            return Err(PanelError::Configuration(
                "mokapapp.colours must name at least one colour".to_string(),
            ));
        }
        let colours = file
            .mokapapp
            .colours
            .iter()
            .map(|name| {
                Colour::parse(name).ok_or_else(|| {
                    PanelError::Configuration(format!(
                        "unknown colour {name:?} in mokapapp.colours"
                    ))
                })
            })
            .collect::<Result<BTreeSet<_>, _>>()?;

        if file.mokapapp.http_timeout_secs == 0 {
            return Err(PanelError::Configuration(
                "mokapapp.http_timeout_secs must be positive".to_string(),
            ));
        }

        Ok(Self {
            min_panel_count: file.mokapapp.min_panel_count,
            colours,
            http_timeout: Duration::from_secs(file.mokapapp.http_timeout_secs),
            endpoints: PanelAppEndpoints {
                panels: endpoints.panels,
                signed_off_panels: endpoints.signed_off_panels,
            },
            databases: file
                .database
                .into_iter()
                .map(|(name, section)| (name, section.path))
                .collect(),
        })
    }

    /// Resolves `[database.<section>]` to an existing database file.
    ///
    /// # Errors
    /// Returns [`PanelError::Configuration`] when the section is absent or its
    /// path does not exist.
    pub fn database_path(&self, section: &str) -> Result<&Path, PanelError> {
        let path = self.databases.get(section).ok_or_else(|| {
            PanelError::Configuration(format!("no [database.{section}] section in config"))
        })?;
        if !path.is_file() {
            return Err(PanelError::Configuration(format!(
                "database {} for section {section} does not exist",
                path.display()
            )));
        }
        Ok(path)
    }
}
