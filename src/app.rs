use crate::logging::init_logging;
use cluster_diag_collector::{
    Catalog,
    Orchestrator,
    OutputWriter,
    RunError,
    RunManifest,
};
use cluster_diag_config::{
    Args,
    Config,
};
use color_eyre::Result;
use eyre::{
    bail,
    Context as _,
};
use std::path::Path;

pub struct App {
    config: Config,
}

impl App {
    pub fn new(args: Args) -> Result<Self> {
        let config = Config::new(args).wrap_err("Failed to load the configuration")?;
        config.validate()?;
        Ok(Self { config })
    }

    /// Fails only when nothing could be collected: bad catalog, unwritable output or no
    /// reachable seed. Degraded runs still succeed, their manifest tells what is missing.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        let catalog = match &config.catalog {
            Some(path) => Catalog::load(path, &config.variables)?,
            None => Catalog::builtin(&config.variables)?,
        };
        catalog.component(&config.component)?;

        let writer = OutputWriter::create(&config.output_dir, &config.component).await?;
        let log_path = init_logging(config.verbose, writer.root())?;
        info!(
            component = %config.component,
            mode = %config.mode,
            seeds = config.seeds.len(),
            concurrency = config.concurrency,
            "starting collection"
        );
        debug!(log = %log_path.display(), "logging to file");

        let orchestrator = Orchestrator::new(config, catalog, writer);
        let cancel = orchestrator.cancellation_token();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling the run");
                cancel.cancel();
            }
        });

        let result = orchestrator.run().await;
        interrupt.abort();

        match result {
            Ok(manifest) => {
                log_summary(&manifest, &orchestrator.writer().manifest_path());
                Ok(())
            }
            Err(RunError::Fatal { reason, manifest }) => {
                error!(
                    seeds = ?manifest.seeds,
                    "Nothing was collected, no manifest written to {}",
                    orchestrator.writer().root().display()
                );
                bail!("No seed target could be reached: {reason}")
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn log_summary(manifest: &RunManifest, manifest_path: &Path) {
    for node in &manifest.nodes {
        info!(
            node = %node.target.key,
            name = %node.target.name,
            version = node.version.as_deref().unwrap_or("unknown"),
            status = %node.status,
            "collected"
        );
    }
    let summary = &manifest.summary;
    info!(
        status = %manifest.status,
        cancelled = manifest.cancelled,
        succeeded = summary.succeeded,
        failed = summary.failed,
        timed_out = summary.timed_out,
        skipped = summary.skipped,
        "Run finished, manifest written to {}",
        manifest_path.display()
    );
}
