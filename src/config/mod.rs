use std::fs;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, trace};
use pingora::server::configuration::{Opt, ServerConf};
use pingora_error::{Error, ErrorType::*, OrErr, Result};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::core::DescriptorSettings;

#[derive(Default, Debug, Serialize, Deserialize, Validate)]
pub struct Config {
    #[serde(default)]
    pub pingora: ServerConf,

    #[validate(length(min = 1))]
    #[validate(nested)]
    pub listeners: Vec<Listener>,

    #[validate(nested)]
    #[serde(default)]
    pub application: Application,
}

// Config file load and validation
impl Config {
    // Does not have to be async until we want runtime reload
    pub fn load_from_yaml<P>(path: P) -> Result<Self>
    where
        P: AsRef<std::path::Path> + std::fmt::Display,
    {
        let conf_str = fs::read_to_string(&path).or_err_with(ReadError, || {
            format!("Unable to read conf file from {path}")
        })?;
        debug!("Conf file read from {path}");
        Self::from_yaml(&conf_str)
    }

    // config file load entry point
    pub fn load_yaml_with_opt_override(opt: &Opt) -> Result<Self> {
        if let Some(path) = &opt.conf {
            let mut conf = Self::load_from_yaml(path)?;
            conf.merge_with_opt(opt);
            Ok(conf)
        } else {
            Error::e_explain(ReadError, "No path specified")
        }
    }

    pub fn from_yaml(conf_str: &str) -> Result<Self> {
        trace!("Read conf file: {conf_str}");
        let conf: Config = serde_yaml::from_str(conf_str).or_err_with(ReadError, || {
            format!("Unable to parse yaml conf {conf_str}")
        })?;

        trace!("Loaded conf: {conf:?}");

        // use validator to validate conf file
        conf.validate()
            .or_err_with(FileReadError, || "Conf file valid failed")?;

        Ok(conf)
    }

    pub fn merge_with_opt(&mut self, opt: &Opt) {
        if opt.daemon {
            self.pingora.daemon = true;
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Listener::validate_tls_for_offer_h2"))]
pub struct Listener {
    pub address: SocketAddr,
    pub tls: Option<Tls>,
    #[serde(default)]
    pub offer_h2: bool,
}

impl Listener {
    fn validate_tls_for_offer_h2(&self) -> Result<(), ValidationError> {
        if self.offer_h2 && self.tls.is_none() {
            Err(ValidationError::new("tls_required_for_h2"))
        } else {
            Ok(())
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Tls {
    pub cert_path: String,
    pub key_path: String,
}

/// Descriptor settings of the served application. Durations are in seconds.
#[derive(Clone, Debug, Serialize, Deserialize, Validate)]
#[validate(schema(function = "Application::validate_cookie_name"))]
pub struct Application {
    #[serde(default = "Application::default_name")]
    #[validate(length(min = 1))]
    pub name: String,

    #[serde(default = "Application::default_application_timeout")]
    #[validate(range(min = 1))]
    pub application_timeout: u64,

    #[serde(default = "Application::default_true")]
    pub session_management: bool,

    #[serde(default = "Application::default_session_timeout")]
    #[validate(range(min = 1))]
    pub session_timeout: u64,

    #[serde(default = "Application::default_true")]
    pub set_client_cookies: bool,

    #[serde(default)]
    #[validate(range(min = 1))]
    pub request_timeout: Option<u64>,

    #[serde(default = "Application::default_session_cookie_name")]
    pub session_cookie_name: String,

    /// How often idle scopes are swept
    #[serde(default = "Application::default_sweep_interval")]
    #[validate(range(min = 1))]
    pub sweep_interval: u64,
}

impl Default for Application {
    fn default() -> Self {
        Self {
            name: Self::default_name(),
            application_timeout: Self::default_application_timeout(),
            session_management: true,
            session_timeout: Self::default_session_timeout(),
            set_client_cookies: true,
            request_timeout: None,
            session_cookie_name: Self::default_session_cookie_name(),
            sweep_interval: Self::default_sweep_interval(),
        }
    }
}

impl Application {
    fn default_name() -> String {
        "Application".to_string()
    }

    fn default_application_timeout() -> u64 {
        300
    }

    fn default_session_timeout() -> u64 {
        1200
    }

    fn default_true() -> bool {
        true
    }

    fn default_session_cookie_name() -> String {
        "CFID".to_string()
    }

    fn default_sweep_interval() -> u64 {
        1
    }

    // cookie names are RFC 6265 tokens
    fn validate_cookie_name(&self) -> Result<(), ValidationError> {
        let name = &self.session_cookie_name;
        let is_token = !name.is_empty()
            && name.bytes().all(|b| {
                b.is_ascii_graphic() && !b"()<>@,;:\\\"/[]?={}".contains(&b)
            });
        if is_token {
            Ok(())
        } else {
            Err(ValidationError::new("invalid_session_cookie_name"))
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval)
    }

    /// Runtime settings for the descriptor
    pub fn to_settings(&self) -> DescriptorSettings {
        DescriptorSettings {
            name: self.name.clone(),
            application_timeout: Duration::from_secs(self.application_timeout),
            session_management: self.session_management,
            session_timeout: Duration::from_secs(self.session_timeout),
            set_client_cookies: self.set_client_cookies,
            request_timeout: self.request_timeout.map(Duration::from_secs),
            session_cookie_name: self.session_cookie_name.clone(),
        }
    }
}
