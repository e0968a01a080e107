use std::process::ExitCode;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Parser;
use kube::Client;
use tracing::{error, info};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;

use prom_authz::auth::{ApiTokenReviewer, TokenAuthenticator, Tokens};
use prom_authz::config::{AgentArgs, AgentConfig};
use prom_authz::grpc::GrpcProxy;
use prom_authz::proxy::{PromApiClient, ReverseProxy};
use prom_authz::rbac::view::{self, RbacView};
use prom_authz::routes::{self, AgentState};

#[actix_web::main]
async fn main() -> ExitCode {
    let args = AgentArgs::parse();

    let config = match AgentConfig::from_args(args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("invalid configuration: {err}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config);
    info!("{config}");

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("agent failed: {err}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(config: &AgentConfig) {
    let default_level = if config.log_debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    let kube_client = Client::try_default().await?;

    let tokens: Arc<dyn TokenAuthenticator> =
        Arc::new(Tokens::new(ApiTokenReviewer::new(kube_client.clone())));

    // Resolve our own identity once; per-request self-detection compares
    // against it instead of re-reviewing the token.
    let self_user = tokens.authenticate(&config.self_token).await?;
    info!(
        username = self_user.username.as_deref().unwrap_or_default(),
        "resolved agent identity"
    );

    let view = RbacView::new();
    tokio::spawn(view::run(view.clone(), kube_client));

    let state = web::Data::new(AgentState {
        self_token: config.self_token.clone(),
        self_user,
        filter_reader_labels: config.filter_reader_labels.clone(),
        tokens,
        namespaces: view,
        proxy: ReverseProxy::new(config.proxy_url.clone())?,
        grpc_proxy: GrpcProxy::new(config.proxy_url.clone())?,
        backend: PromApiClient::new(config.proxy_url.clone())?,
    });

    info!("start listening for connections on {}", config.listen_address);
    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(TracingLogger::default())
            .configure(routes::configure)
    })
    .max_connections(config.max_connections)
    .client_request_timeout(config.read_timeout)
    .bind_auto_h2c(&config.listen_address)?
    .run()
    .await?;

    info!("agent shut down");
    Ok(())
}
