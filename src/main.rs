use std::sync::Arc;

use pingora_core::listeners::tls::TlsSettings;
use pingora_core::server::configuration::Opt;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;

use cfscope::app::HitCounterApplication;
use cfscope::config::{Config, Tls};
use cfscope::pipeline::RequestPipeline;
use cfscope::service::{http::DescriptorHttpApp, sweeper::ExpirySweeper};

fn main() {
    // Initialize logging
    env_logger::init();

    // Read command-line arguments
    let opt = Opt::parse_args();

    // Load configuration with optional override
    let config = Config::load_yaml_with_opt_override(&opt).expect("Failed to load configuration");

    // Build the application lifecycle
    log::info!("Loading application '{}'...", config.application.name);
    let descriptor = Arc::new(HitCounterApplication::new(config.application.to_settings()));
    let pipeline = Arc::new(RequestPipeline::new(descriptor));

    // Create Pingora server with optional configuration
    let mut cfscope_server = Server::new_with_opt_and_conf(Some(opt), config.pingora);

    let mut http_service = DescriptorHttpApp::descriptor_http_service(pipeline.clone());

    // Add listeners from configuration
    log::info!("Adding listeners...");
    for list_cfg in config.listeners {
        match list_cfg.tls {
            Some(Tls {
                cert_path,
                key_path,
            }) => {
                let mut settings = TlsSettings::intermediate(&cert_path, &key_path)
                    .expect("Adding TLS listener shouldn't fail");
                if list_cfg.offer_h2 {
                    settings.enable_h2();
                }
                http_service.add_tls_with_settings(&list_cfg.address.to_string(), None, settings);
            }
            None => {
                http_service.add_tcp(&list_cfg.address.to_string());
            }
        }
    }

    let sweeper = background_service(
        "scope expiry",
        ExpirySweeper::new(pipeline, config.application.sweep_interval()),
    );

    // Bootstrapping and server startup
    log::info!("Bootstrapping...");
    cfscope_server.bootstrap();

    log::info!("Bootstrapped. Adding Services...");
    cfscope_server.add_service(http_service);
    cfscope_server.add_service(sweeper);

    log::info!("Starting Server...");
    cfscope_server.run_forever();
}
