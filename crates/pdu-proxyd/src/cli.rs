use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pdu-proxyd", version, about = "Intercepting proxy for framed game traffic")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(short, long, default_value = "config.yaml")]
    pub config: PathBuf,

    /// Listen address (overrides config file setting)
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream server address (overrides config file setting)
    #[arg(long)]
    pub upstream: Option<String>,

    /// Log level filter (overrides config file setting)
    #[arg(long)]
    pub log_level: Option<String>,
}
