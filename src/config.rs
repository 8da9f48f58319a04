use anyhow::Result;
use clap::ArgAction::Append;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration structure that can be loaded from CLI or a config file
///
/// Example configuration file content
/// # Video Relay Configuration
///
/// # Server configuration
/// host = "0.0.0.0"
/// listen_on_port = 8080
/// workspace = "./data"
///
/// # External processor
/// processor = "python"
/// processor_args = ["python/infer_test.py"]
/// output_file = "video_with_audio.mp4"
/// timeout_secs = 600
/// permits = 4
///
/// # Upload bound (MiB)
/// upload_limit_mb = 1024
#[derive(Debug, Clone, Serialize, Deserialize, Parser)]
#[serde(default)]
#[command(version, about, long_about = None)]
pub struct Config {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080)]
    #[serde(default = "default_port")]
    pub listen_on_port: u16,

    /// Working directory, per-request output dirs are created under `<workspace>/jobs`
    #[arg(short = 'w', long, default_value = ".")]
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// Configuration file path (overrides all other arguments)
    #[arg(short, long)]
    #[serde(skip)]
    pub config: Option<String>,

    /// External processor program, receives the uploaded video on stdin
    #[arg(long, default_value = "python")]
    #[serde(default = "default_processor")]
    pub processor: String,

    /// Processor argument, can be specified multiple times.
    /// `{output_dir}` and `{output_path}` are replaced with the request's scoped paths.
    #[arg(long = "processor-arg", action = Append, allow_hyphen_values = true)]
    #[serde(default = "default_processor_args")]
    pub processor_args: Vec<String>,

    /// File name the processor writes inside its output dir
    #[arg(long, default_value = "video_with_audio.mp4")]
    #[serde(default = "default_output_file")]
    pub output_file: String,

    /// Seconds to wait for the processor before killing it
    #[arg(short, long, default_value_t = 600)]
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Number of concurrently running processors
    #[arg(short, long, default_value_t = 4)]
    #[serde(default = "default_permits")]
    pub permits: usize,

    /// Maximum request body size in MiB
    #[arg(long, default_value_t = 1024)]
    #[serde(default = "default_upload_limit_mb")]
    pub upload_limit_mb: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            listen_on_port: default_port(),
            workspace: default_workspace(),
            config: None,
            processor: default_processor(),
            processor_args: default_processor_args(),
            output_file: default_output_file(),
            timeout_secs: default_timeout_secs(),
            permits: default_permits(),
            upload_limit_mb: default_upload_limit_mb(),
        }
    }
}

impl Config {
    /// Load configuration from CLI args, optionally merging with a config file
    pub fn load() -> Result<Self> {
        let mut config = Config::parse();
        if config.processor_args.is_empty() {
            config.processor_args = default_processor_args();
        }

        if let Some(config_path) = &config.config {
            let file_config = Self::from_file(Path::new(config_path))?;
            config = config.merge_with_file(file_config);
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Merge with file config, CLI args take precedence
    fn merge_with_file(mut self, file_config: Config) -> Self {
        // If CLI value is default, use file value
        if self.host == default_host() {
            self.host = file_config.host;
        }
        if self.listen_on_port == default_port() {
            self.listen_on_port = file_config.listen_on_port;
        }
        if self.workspace == default_workspace() {
            self.workspace = file_config.workspace;
        }
        if self.processor == default_processor() {
            self.processor = file_config.processor;
        }
        if self.processor_args == default_processor_args() {
            self.processor_args = file_config.processor_args;
        }
        if self.output_file == default_output_file() {
            self.output_file = file_config.output_file;
        }
        if self.timeout_secs == default_timeout_secs() {
            self.timeout_secs = file_config.timeout_secs;
        }
        if self.permits == default_permits() {
            self.permits = file_config.permits;
        }
        if self.upload_limit_mb == default_upload_limit_mb() {
            self.upload_limit_mb = file_config.upload_limit_mb;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.processor.trim().is_empty() {
            return Err(anyhow::anyhow!("Processor program cannot be empty"));
        }

        if self.output_file.is_empty()
            || self.output_file.contains('/')
            || self.output_file.contains('\\')
            || self.output_file == "."
            || self.output_file == ".."
        {
            return Err(anyhow::anyhow!(
                "Output file must be a plain file name, got {:?}",
                self.output_file
            ));
        }

        if self.timeout_secs == 0 {
            return Err(anyhow::anyhow!("Processor timeout must be greater than 0"));
        }
        if self.permits == 0 {
            return Err(anyhow::anyhow!("Permits must be greater than 0"));
        }
        if self.upload_limit_mb == 0 {
            return Err(anyhow::anyhow!("Upload limit must be greater than 0"));
        }

        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.listen_on_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn upload_limit_bytes(&self) -> usize {
        self.upload_limit_mb.saturating_mul(1024 * 1024)
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_workspace() -> String {
    ".".to_string()
}

fn default_processor() -> String {
    "python".to_string()
}

fn default_processor_args() -> Vec<String> {
    vec!["python/infer_test.py".to_string()]
}

fn default_output_file() -> String {
    "video_with_audio.mp4".to_string()
}

fn default_timeout_secs() -> u64 {
    600
}

fn default_permits() -> usize {
    4
}

fn default_upload_limit_mb() -> usize {
    1024
}
