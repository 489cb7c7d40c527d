use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};

use crate::catalog;
use crate::config;
use crate::logging;
use crate::preview;
use crate::runtime::{self, Services, SessionOptions};
use crate::server;
use crate::transport::LocalTerminal;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub config_file: Option<PathBuf>,
    /// Run a single session on the controlling terminal instead of serving SSH.
    pub local: bool,
}

/// Serves SSH sessions until interrupted, or one local session with `local`.
pub fn run(options: RunOptions) -> Result<()> {
    let cfg = config::load(config::LoadOptions {
        config_file: options.config_file.clone(),
        env_prefix: None,
    })
    .context("load config")?;
    logging::init(&cfg.log).context("init logging")?;
    info!(version = crate::VERSION, "e6tui starting");

    let client = catalog::Client::new(catalog::ClientConfig {
        endpoint: cfg.catalog.endpoint.clone(),
        user_agent: cfg.catalog.user_agent.clone(),
        page_limit: cfg.catalog.page_limit,
        timeout: Some(cfg.catalog.timeout),
        http_client: None,
    })
    .context("create catalog client")?;

    let pipeline = preview::Pipeline::new(preview::PipelineConfig {
        user_agent: cfg.catalog.user_agent.clone(),
        program: cfg.renderer.program.clone(),
        args: cfg.renderer.args.clone(),
        download_timeout: Some(cfg.renderer.download_timeout),
        temp_dir: cfg.renderer.temp_dir.clone(),
        http_client: None,
    })
    .context("create preview pipeline")?;

    let services = Services {
        search: Arc::new(client),
        preview: Arc::new(pipeline),
    };
    let session_options = SessionOptions {
        renderer_program: cfg.renderer.program.clone(),
    };

    if options.local {
        return run_local(services, &session_options);
    }

    let result = server::serve(&cfg.server, services, session_options);
    if let Err(err) = &result {
        error!(error = ?err, "server failed");
    }
    info!("e6tui exiting");
    result
}

fn run_local(services: Services, session_options: &SessionOptions) -> Result<()> {
    let (mut terminal, connection) = LocalTerminal::open().context("open terminal")?;
    let result = runtime::run_session(connection, services, session_options);
    terminal.restore().context("restore terminal")?;

    if let Err(err) = &result {
        error!(error = ?err, "session failed");
    }
    info!("e6tui exiting");
    result
}
