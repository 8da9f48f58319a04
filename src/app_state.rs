use crate::config::Config;
use crate::processor::Processor;
use crate::workspace::init_workspace;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub processor: Arc<Processor>,
    pub permits: Arc<Semaphore>,
    pub jobs_dir: PathBuf,
    pub upload_limit: usize,
}

impl AppState {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let jobs_dir = init_workspace(Path::new(&config.workspace))?;
        let processor = Processor::from_config(config);

        info!(
            jobs_dir = %jobs_dir.display(),
            processor = %processor.command_line(),
            permits = config.permits,
            "Relay state initialized"
        );

        Ok(Self {
            processor: Arc::new(processor),
            permits: Arc::new(Semaphore::new(config.permits)),
            jobs_dir,
            upload_limit: config.upload_limit_bytes(),
        })
    }

    pub fn jobs_dir(&self) -> &Path {
        self.jobs_dir.as_path()
    }
}
