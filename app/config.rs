use std::{env, net::IpAddr, path::PathBuf};

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use stream_hub::group::RelayPushConfig;

use crate::{
    cli::AppCli,
    errors::{AppError, AppResult},
    util::parse_log_level,
};

#[derive(Debug, Deserialize)]
pub(crate) struct Logger {
    pub(crate) level: String,
    pub(crate) dir: PathBuf,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HttpStreamServer {
    pub(crate) enable: bool,
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HttpApiServer {
    pub(crate) enable: bool,
    pub(crate) address: IpAddr,
    pub(crate) port: u16,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AppConfig {
    pub(crate) server_id: String,
    pub(crate) logger: Logger,
    pub(crate) http_stream_server: HttpStreamServer,
    pub(crate) http_api_server: HttpApiServer,
    #[serde(default)]
    pub(crate) relay_push: RelayPushConfig,
}

impl AppConfig {
    pub(crate) fn new(config_path: Option<String>) -> AppResult<Self> {
        let config_path_composed = config_path.or_else(|| env::var("RILL_CONFIG").ok());
        if config_path_composed.is_none() {
            return Err(AppError::ConfigError(ConfigError::NotFound(
                "no config file is provided".to_owned(),
            )));
        }
        let result = Config::builder()
            .add_source(File::with_name(config_path_composed.unwrap().as_str()))
            .add_source(Environment::with_prefix("rill"))
            .build()?;
        let config = result.try_deserialize()?;
        Ok(config)
    }

    pub(crate) fn apply(&mut self, cli_args: &AppCli) -> AppResult<()> {
        if let Some(level) = &cli_args.log_level {
            self.logger.level = level.clone();
        }

        if let Some(port) = cli_args.http_stream_port {
            self.http_stream_server.port = port;
        }

        if let Some(port) = cli_args.http_api_port {
            self.http_api_server.port = port;
        }

        Ok(())
    }

    pub(crate) fn validate(&self) -> AppResult<()> {
        let _ = parse_log_level(&self.logger.level)?;

        if self.logger.dir.clone().into_os_string().is_empty() {
            return Err(AppError::ConfigError(ConfigError::Message(format!(
                "the log dir config is empty: {:?}",
                self.logger.dir.to_str()
            ))));
        }

        if self.relay_push.enable && self.relay_push.addr_list.is_empty() {
            return Err(AppError::ConfigError(ConfigError::Message(
                "relay push is enabled but addr_list is empty".to_string(),
            )));
        }

        Ok(())
    }
}
