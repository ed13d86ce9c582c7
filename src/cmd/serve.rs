//! The `serve` subcommand.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use clap::{ArgAction, Args, builder::BoolishValueParser};
use tokio::{net::TcpListener, signal};

use crate::{
    jobs::{JobOrchestrator, JobRunner, workspace::JobStore},
    ocr::{
        DEFAULT_LANGUAGES, LanguageSet,
        engines::{
            EngineFactory,
            tesseract::{TesseractEngineFactory, TesseractOpts},
        },
        pool::EnginePool,
    },
    pipeline::DocumentPipeline,
    prelude::*,
    raster::PopplerRasterizer,
    server::{AppState, DEFAULT_MAX_UPLOAD_BYTES, router},
};

/// Serve command line arguments.
#[derive(Debug, Args)]
pub struct ServeOpts {
    /// Address to listen on.
    #[clap(long, env = "FORM_OCR_HOST", default_value_t = IpAddr::V4(Ipv4Addr::LOCALHOST))]
    pub host: IpAddr,

    /// Port to listen on.
    #[clap(long, env = "PORT", default_value_t = 8080)]
    pub port: u16,

    /// Directory holding one subdirectory per job.
    #[clap(long, env = "FORM_OCR_UPLOADS_DIR", default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// How many jobs to run at once.
    #[clap(
        long,
        env = "FORM_OCR_WORKERS",
        default_value_t = 2,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub workers: u64,

    /// How many jobs may wait for a worker before uploads are refused.
    #[clap(
        long,
        env = "FORM_OCR_QUEUE_CAPACITY",
        default_value_t = 32,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub queue_capacity: u64,

    /// Largest request body we accept, in bytes.
    #[clap(long, env = "FORM_OCR_MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES)]
    pub max_upload_bytes: usize,

    /// Languages for the engine built at startup.
    #[clap(long, env = "OCR_PREWARM_LANGS", default_value = DEFAULT_LANGUAGES)]
    pub prewarm_languages: LanguageSet,

    /// Ask the engine built at startup to use a GPU.
    #[clap(
        long,
        env = "OCR_PREWARM_GPU",
        action = ArgAction::Set,
        value_parser = BoolishValueParser::new(),
        num_args = 0..=1,
        default_value = "false",
        default_missing_value = "true"
    )]
    pub prewarm_gpu: bool,

    /// Don't build an engine at startup. Every job builds its own.
    #[clap(long)]
    pub no_prewarm: bool,

    #[clap(flatten)]
    pub tesseract: TesseractOpts,
}

/// The `serve` subcommand.
#[instrument(level = "debug", skip_all)]
pub async fn cmd_serve(opts: &ServeOpts) -> Result<()> {
    let factory: Arc<dyn EngineFactory> =
        Arc::new(TesseractEngineFactory::new(opts.tesseract.clone()));
    let pool = if opts.no_prewarm {
        EnginePool::empty()
    } else {
        EnginePool::prewarm(factory.as_ref(), &opts.prewarm_languages, opts.prewarm_gpu)
            .await
    };
    let pipeline = DocumentPipeline::new(Arc::new(PopplerRasterizer::default()), factory);
    let store = JobStore::new(opts.uploads_dir.clone())?;
    let (orchestrator, worker) = JobOrchestrator::start(
        store,
        JobRunner::new(pipeline, pool),
        usize::try_from(opts.workers).context("too many workers")?,
        usize::try_from(opts.queue_capacity).context("queue capacity too large")?,
    );
    let app = router(
        AppState {
            orchestrator: Arc::new(orchestrator),
        },
        opts.max_upload_bytes,
    );

    let addr = SocketAddr::new(opts.host, opts.port);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to listen on {}", addr))?;
    info!(
        %addr,
        uploads_dir = %opts.uploads_dir.display(),
        workers = opts.workers,
        "Listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server failed")?;

    // The router, and with it the last handle to the job queue, is gone now.
    info!("Waiting for queued jobs to finish");
    worker.join().await
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
