use std::{
    collections::HashMap,
    io::{self, ErrorKind, Write},
    path::PathBuf,
    time::Duration,
};

use atomic_write_file::AtomicWriteFile;
use directories_next::ProjectDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    args::Args,
    profile::{builtin_profiles, ProfileConfig, ProfileError, ProfileRegistry},
    rcon::ClientTimeouts,
    store::ServerDescriptor,
    watchdog,
};

pub const CONFIG_FILE_NAME: &str = "config.yaml";

#[derive(Debug, Clone, Copy)]
pub struct AppDetails<'a> {
    pub qualifier: &'a str,
    pub organization: &'a str,
    pub application: &'a str,
}

#[derive(Debug, Error)]
pub enum ConfigFilesError {
    #[error("No valid home directory found")]
    NoValidHome,
    #[error("IO({0})")]
    IO(#[from] io::Error),
    #[error("Yaml{0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("No config file path is set")]
    NoConfigSet,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    #[serde(skip)]
    pub config_path: Option<PathBuf>,

    pub web_port: u16,
    pub watchdog_interval_secs: u64,
    pub connect_timeout_secs: u64,
    pub command_timeout_secs: u64,

    /// Game servers the relay keeps connections to.
    pub servers: Vec<ServerDescriptor>,
    /// Extra game profiles. One with the same name as a builtin profile
    /// replaces it.
    pub profiles: Vec<ProfileConfig>,
    /// Session token -> user id, for UI clients.
    pub api_tokens: HashMap<String, String>,
}

impl Settings {
    /// Attempts to locate the default file location for the settings config file
    ///
    /// # Errors
    /// If an appropriate location could not be found
    pub fn default_file_location(app_details: AppDetails) -> Result<PathBuf, ConfigFilesError> {
        Ok(Self::locate_config_directory(app_details)?.join(CONFIG_FILE_NAME))
    }

    /// Attempts to load the [Settings] at the specified location.
    /// If it cannot be found, new [Settings] will be
    /// created at that location.
    ///
    /// # Errors
    /// * `IO` - If the file could not be loaded from some reason
    /// * `Yaml` - If the contents of the file were not valid
    pub fn load_or_create(config_file_path: PathBuf) -> Result<Self, ConfigFilesError> {
        match Self::load_from(config_file_path.clone()) {
            Ok(settings) => Ok(settings),
            Err(ConfigFilesError::IO(e)) if e.kind() == ErrorKind::NotFound => {
                tracing::warn!("Could not locate {config_file_path:?}, creating new file.");
                Ok(Self {
                    config_path: Some(config_file_path),
                    ..Default::default()
                })
            }
            Err(e) => Err(e),
        }
    }

    /// # Errors
    /// If the file couldn't be read or isn't valid settings
    pub fn load_from(config_file_path: PathBuf) -> Result<Self, ConfigFilesError> {
        let contents = std::fs::read_to_string(&config_file_path)?;
        let mut settings = serde_yaml::from_str::<Self>(&contents)?;
        tracing::debug!("Successfully loaded {config_file_path:?}");
        settings.config_path = Some(config_file_path);
        Ok(settings)
    }

    /// Attempt to save the settings back to the loaded configuration file
    ///
    /// # Errors
    /// If the settings could not be serialized or written back to disk
    pub fn save(&self) -> Result<(), ConfigFilesError> {
        let config_path = self
            .config_path
            .as_ref()
            .ok_or(ConfigFilesError::NoConfigSet)?;

        let mut file = AtomicWriteFile::open(config_path)?;
        write!(&mut file, "{}", serde_yaml::to_string(self)?)?;
        file.commit()?;

        Ok(())
    }

    pub fn save_ok(&self) {
        match self.save() {
            Ok(()) => tracing::debug!("Successfully saved settings to {:?}", self.config_path),
            Err(e) => tracing::error!("Failed to save settings to {:?}: {e}", self.config_path),
        }
    }

    /// Attempts to find (and create) a directory to be used for configuration
    /// files
    ///
    /// # Errors
    /// If a valid config file directory could not be found (usually because a
    /// valid home directory was not found)
    pub fn locate_config_directory(app_details: AppDetails) -> Result<PathBuf, ConfigFilesError> {
        let dirs = ProjectDirs::from(
            app_details.qualifier,
            app_details.organization,
            app_details.application,
        )
        .ok_or(ConfigFilesError::NoValidHome)?;
        let dir = dirs.config_dir();
        std::fs::create_dir_all(dir)?;
        Ok(PathBuf::from(dir))
    }

    /// Command line options win over the file. They are not saved back.
    pub fn apply_args(&mut self, args: &Args) {
        if let Some(port) = args.web_port {
            self.web_port = port;
        }
        if let Some(secs) = args.watchdog_interval {
            self.watchdog_interval_secs = secs;
        }
    }

    #[must_use]
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_secs(self.watchdog_interval_secs.max(1))
    }

    #[must_use]
    pub fn client_timeouts(&self) -> ClientTimeouts {
        ClientTimeouts {
            connect: Duration::from_secs(self.connect_timeout_secs.max(1)),
            command: Duration::from_secs(self.command_timeout_secs.max(1)),
            ..ClientTimeouts::default()
        }
    }

    /// The builtin game profiles with the configured ones layered on top.
    ///
    /// # Errors
    /// If a configured profile doesn't compile
    pub fn profile_registry(&self) -> Result<ProfileRegistry, ProfileError> {
        let builtin = builtin_profiles();
        ProfileRegistry::from_configs(builtin.iter().chain(&self.profiles))
    }
}

impl Default for Settings {
    fn default() -> Self {
        let timeouts = ClientTimeouts::default();
        Self {
            config_path: None,
            web_port: 3622,
            watchdog_interval_secs: watchdog::DEFAULT_INTERVAL.as_secs(),
            connect_timeout_secs: timeouts.connect.as_secs(),
            command_timeout_secs: timeouts.command.as_secs(),
            servers: Vec::new(),
            profiles: Vec::new(),
            api_tokens: HashMap::new(),
        }
    }
}
