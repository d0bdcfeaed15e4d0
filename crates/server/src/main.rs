use std::path::PathBuf;
use std::sync::Arc;

use alexa::driver::PageDriver;
use alexa::{
    CdpDriver, Credentials, DeviceCache, Dispatcher, DriverOptions, RemoteCallExecutor,
    SessionMachine, Viewport,
};
use anyhow::Context;
use clap::Parser;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use alexa_server::{cli::Cli, config::Config, logging, routes};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    if let Err(err) = run(cli).await {
        error!(target: "alexa", error = %err, "fatal");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(cli.config.as_deref())?;
    config.validate()?;

    let (driver, mut loads) = CdpDriver::connect(&DriverOptions {
        cdp_endpoint: config.browser.cdp_endpoint.clone(),
        user_agent: Some(config.browser.user_agent.clone()),
        viewport: Some(Viewport {
            width: config.browser.viewport.width,
            height: config.browser.viewport.height,
        }),
    })
    .await
    .context("failed to attach to the browser")?;
    let driver: Arc<dyn PageDriver> = driver;

    let executor = Arc::new(RemoteCallExecutor::new(
        Arc::clone(&driver),
        config.api.url.clone(),
    ));
    let cache = DeviceCache::new(Arc::clone(&executor), config.cache_lifetime());
    let session = Arc::new(Mutex::new(SessionMachine::new(
        Arc::clone(&driver),
        Credentials {
            username: config.amazon.username.clone(),
            password: config.amazon.password.clone(),
        },
        PathBuf::from(&config.server.screenshot),
        config.assist_url(),
    )));
    let dispatcher = Arc::new(Dispatcher::new(cache, executor, Arc::clone(&session)));

    // Page-load pump: every observed navigation advances the state machine.
    let pump_session = Arc::clone(&session);
    tokio::spawn(async move {
        while let Some(load) = loads.recv().await {
            let mut session = pump_session.lock().await;
            if let Err(e) = session.on_page_loaded(&load).await {
                warn!(target: "alexa", error = %e, "session transition failed");
            }
        }
    });

    session.lock().await.start().await?;

    let app = routes::create_router(routes::AppState {
        dispatcher,
        session,
        assist_url: config.assist_url(),
        screenshot: PathBuf::from(&config.server.screenshot),
    });

    let addr = config.bind_addr();
    info!(target: "alexa", %addr, "starting REST server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await?;
    Ok(())
}
