use std::{net::SocketAddr, sync::Arc};

use clap::Parser;
use http_api_server::HttpApiServer;
use stream_hub::{
    http_server_handler::{HttpServerHandler, HttpServerHandlerObserver},
    relay_factory::TcpTransportFactory,
    server_manager::{ServerManager, StreamHubConfig},
};
use time::macros::format_description;
use tokio::signal;
use tracing::{self, Dispatch};
use tracing_subscriber::{self, EnvFilter, fmt::time::LocalTime};

mod cli;
mod config;
mod errors;
mod util;

use cli::AppCli;
use config::AppConfig;

#[tokio::main]
async fn main() {
    let cli_args = AppCli::parse();
    let mut app_config = match AppConfig::new(
        cli_args
            .config
            .as_ref()
            .and_then(|path| path.to_str().map(str::to_string)),
    ) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("load config failed: {}", err);
            std::process::exit(1);
        }
    };
    if let Err(err) = app_config.apply(&cli_args) {
        eprintln!("bad config: {}", err);
        std::process::exit(1);
    }
    if let Err(err) = app_config.validate() {
        eprintln!("bad config: {}", err);
        std::process::exit(1);
    }

    let log_level =
        util::parse_log_level(&app_config.logger.level).expect("level validated above");
    let file_appender = tracing_appender::rolling::daily(&app_config.logger.dir, "rill_server.log");
    let (file_writer, _appender_guard) = tracing_appender::non_blocking(file_appender);
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_timer(LocalTime::new(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        )))
        .compact()
        .with_file(true)
        .with_line_number(true)
        .with_thread_names(true)
        .with_target(true)
        .with_writer(file_writer)
        .with_env_filter(EnvFilter::new(&app_config.logger.level))
        .finish();
    tracing::dispatcher::set_global_default(Dispatch::new(subscriber))
        .expect("set global tracing dispatcher");

    tracing::info!("rill server starting, server_id: {}", app_config.server_id);

    let manager = ServerManager::new(
        StreamHubConfig {
            server_id: app_config.server_id.clone(),
            relay_push: app_config.relay_push.clone(),
        },
        Arc::new(TcpTransportFactory),
        None,
    );

    if app_config.http_stream_server.enable {
        let observer = Arc::clone(&manager) as Arc<dyn HttpServerHandlerObserver>;
        let handler = Arc::new(HttpServerHandler::new(observer, None));
        let addr = SocketAddr::new(
            app_config.http_stream_server.address,
            app_config.http_stream_server.port,
        );
        tokio::spawn(async move {
            if let Err(err) = handler.run(addr).await {
                tracing::error!("http stream server exit with err: {}", err);
            }
        });
    }

    if app_config.http_api_server.enable {
        let api_server = HttpApiServer::new(Arc::clone(&manager));
        let addr = SocketAddr::new(
            app_config.http_api_server.address,
            app_config.http_api_server.port,
        );
        tokio::spawn(async move {
            if let Err(err) = api_server.run(addr).await {
                tracing::error!("http api server exit with err: {}", err);
            }
        });
    }

    let _ = signal::ctrl_c().await;
    tracing::info!("rill server shutting down");
}
