// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//======================================================================================================================
// Imports
//======================================================================================================================

use crate::runtime::fail::Fail;
use ::std::{
    fs::File,
    io::Read,
    ops::Index,
    str::FromStr,
    time::Duration,
};
use ::yaml_rust::{
    Yaml,
    YamlLoader,
};

//======================================================================================================================
// Constants
//======================================================================================================================

// Scheduler options. Every one of them is optional.
mod kds_config {
    pub const SECTION_NAME: &str = "kds";
    pub const WORKER_IDLE_TIMEOUT_US: &str = "worker_idle_timeout_us";
    pub const WORKER_BUSY_POLL_US: &str = "worker_busy_poll_us";
    pub const ABORT_RETRY_INTERVAL_US: &str = "abort_retry_interval_us";
    pub const ABORT_POLL_INTERVAL_US: &str = "abort_poll_interval_us";
    pub const ABORT_MAX_POLLS: &str = "abort_max_polls";
    pub const ABORT_HANG_TIMEOUT_MS: &str = "abort_hang_timeout_ms";
    pub const ECHO: &str = "echo";
    pub const ERT: &str = "ert";
}

//======================================================================================================================
// Structures
//======================================================================================================================

/// Scheduler configuration.
#[derive(Clone, Debug)]
pub struct Config(pub Yaml);

//======================================================================================================================
// Associated Functions
//======================================================================================================================

impl Config {
    /// Reads a configuration file into a [Config] object.
    pub fn new(config_path: &str) -> Result<Self, Fail> {
        let mut config_s: String = String::new();
        File::open(config_path)?.read_to_string(&mut config_s)?;
        config_s.parse()
    }

    /// Bounded wait of an idle CU worker.
    pub fn worker_idle_timeout(&self) -> Result<Option<Duration>, Fail> {
        Ok(self.get_u64(kds_config::WORKER_IDLE_TIMEOUT_US)?.map(Duration::from_micros))
    }

    /// Pause between completion polls of a busy CU worker.
    pub fn worker_busy_poll(&self) -> Result<Option<Duration>, Fail> {
        Ok(self.get_u64(kds_config::WORKER_BUSY_POLL_US)?.map(Duration::from_micros))
    }

    /// Backoff after an abort request that would block.
    pub fn abort_retry_interval(&self) -> Result<Option<Duration>, Fail> {
        Ok(self.get_u64(kds_config::ABORT_RETRY_INTERVAL_US)?.map(Duration::from_micros))
    }

    /// Backoff between polls for abort completion.
    pub fn abort_poll_interval(&self) -> Result<Option<Duration>, Fail> {
        Ok(self.get_u64(kds_config::ABORT_POLL_INTERVAL_US)?.map(Duration::from_micros))
    }

    pub fn abort_max_polls(&self) -> Result<Option<u32>, Fail> {
        match self.get_u64(kds_config::ABORT_MAX_POLLS)? {
            Some(polls) => match u32::try_from(polls) {
                Ok(polls) => Ok(Some(polls)),
                Err(_) => {
                    let message: String = format!("parameter \"{}\" is out of range", kds_config::ABORT_MAX_POLLS);
                    Err(Fail::new(libc::ERANGE, message.as_str()))
                },
            },
            None => Ok(None),
        }
    }

    /// Time started commands of an aborting client get before the CU is declared hung.
    pub fn abort_hang_timeout(&self) -> Result<Option<Duration>, Fail> {
        Ok(self.get_u64(kds_config::ABORT_HANG_TIMEOUT_MS)?.map(Duration::from_millis))
    }

    pub fn echo(&self) -> Result<Option<bool>, Fail> {
        self.get_bool(kds_config::ECHO)
    }

    pub fn ert(&self) -> Result<Option<bool>, Fail> {
        self.get_bool(kds_config::ERT)
    }

    //==================================================================================================================
    // Static Functions
    //==================================================================================================================

    /// Scheduler section, if the document has one.
    fn get_kds_config(&self) -> Result<Option<&Yaml>, Fail> {
        match self.0.index(kds_config::SECTION_NAME) {
            Yaml::BadValue => Ok(None),
            section @ Yaml::Hash(_) => Ok(Some(section)),
            _ => {
                let message: String = format!("parameter \"{}\" has unexpected type", kds_config::SECTION_NAME);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Reads an integer option from the environment variable first and then the configuration file.
    fn get_u64(&self, index: &str) -> Result<Option<u64>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        let option: &Yaml = match self.get_kds_config()? {
            Some(section) => section.index(index),
            None => return Ok(None),
        };
        match option {
            Yaml::BadValue => Ok(None),
            Yaml::Integer(value) => match u64::try_from(*value) {
                Ok(value) => Ok(Some(value)),
                Err(_) => {
                    let message: String = format!("parameter \"{}\" is out of range", index);
                    Err(Fail::new(libc::ERANGE, message.as_str()))
                },
            },
            _ => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Reads a boolean option from the environment variable first and then the configuration file.
    fn get_bool(&self, index: &str) -> Result<Option<bool>, Fail> {
        if let Some(value) = Self::get_typed_env_option(index)? {
            return Ok(Some(value));
        }
        let option: &Yaml = match self.get_kds_config()? {
            Some(section) => section.index(index),
            None => return Ok(None),
        };
        match option {
            Yaml::BadValue => Ok(None),
            Yaml::Boolean(value) => Ok(Some(*value)),
            _ => {
                let message: String = format!("parameter {} has unexpected type", index);
                Err(Fail::new(libc::EINVAL, message.as_str()))
            },
        }
    }

    /// Parses the upper-cased environment variable named after `index`.
    fn get_typed_env_option<T: FromStr>(index: &str) -> Result<Option<T>, Fail> {
        if let Ok(var) = ::std::env::var(index.to_uppercase()) {
            if let Ok(value) = var.as_str().parse() {
                return Ok(Some(value));
            } else {
                let message: String = format!("parameter {} has unexpected type", index);
                return Err(Fail::new(libc::EINVAL, message.as_str()));
            }
        }
        Ok(None)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl FromStr for Config {
    type Err = Fail;

    /// Parses a configuration document.
    fn from_str(config_s: &str) -> Result<Self, Fail> {
        let config: Vec<Yaml> = match YamlLoader::load_from_str(config_s) {
            Ok(config) => config,
            Err(e) => {
                let cause: String = format!("malformed configuration ({})", e);
                error!("from_str(): {}", cause);
                return Err(Fail::new(libc::EINVAL, &cause));
            },
        };
        match &config[..] {
            [c] => Ok(Self(c.clone())),
            [] => Ok(Self(Yaml::Hash(Default::default()))),
            _ => Err(Fail::new(libc::EINVAL, "Wrong number of config objects")),
        }
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
