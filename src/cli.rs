use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::Config;

#[derive(Parser, Debug)]
#[command(name = "zipfetch")]
#[command(version)]
#[command(about = "Fetch single files out of remote ZIP archives with HTTP Range requests", long_about = None)]
#[command(after_help = "Examples:\n  \
  zipfetch -l https://example.com/archive.zip          list files from remote ZIP\n  \
  zipfetch -p https://example.com/archive.zip a.json   send one entry to stdout\n  \
  zipfetch -t photos.zip                               show the folder tree of a local ZIP")]
pub struct Cli {
    /// ZIP file path or HTTP URL
    #[arg(value_name = "FILE")]
    pub file: String,

    /// Files to extract (default: all)
    #[arg(value_name = "FILES")]
    pub files: Vec<String>,

    /// List files (short format)
    #[arg(short = 'l')]
    pub list: bool,

    /// List verbosely
    #[arg(short = 'v')]
    pub verbose: bool,

    /// Show the folder tree with sizes
    #[arg(short = 't')]
    pub tree: bool,

    /// Extract files to pipe, no messages
    #[arg(short = 'p')]
    pub pipe: bool,

    /// Extract files into exdir
    #[arg(short = 'd', value_name = "DIR")]
    pub extract_dir: Option<String>,

    /// Exclude files that follow
    #[arg(short = 'x', value_name = "FILE", num_args = 1..)]
    pub exclude: Vec<String>,

    /// Never overwrite existing files
    #[arg(short = 'n')]
    pub never_overwrite: bool,

    /// Overwrite files WITHOUT prompting
    #[arg(short = 'o')]
    pub overwrite: bool,

    /// Junk paths (do not make directories)
    #[arg(short = 'j')]
    pub junk_paths: bool,

    /// Quiet mode (-qq => quieter)
    #[arg(short = 'q', action = clap::ArgAction::Count)]
    pub quiet: u8,

    /// Cache directory (default: platform cache dir)
    #[arg(long = "cache-dir", value_name = "DIR")]
    pub cache_dir: Option<PathBuf>,

    /// Do not read or write the durable cache
    #[arg(long = "no-cache")]
    pub no_cache: bool,

    /// Drop the durable cache of this archive before running
    #[arg(long = "refresh")]
    pub refresh: bool,

    /// Request timeout in seconds
    #[arg(long = "timeout", value_name = "SECS", default_value_t = 30)]
    pub timeout: u64,

    /// Retries of failed connections
    #[arg(long = "retries", value_name = "N", default_value_t = 10)]
    pub retries: u32,
}

impl Cli {
    pub fn is_http_url(&self) -> bool {
        self.file.starts_with("http://") || self.file.starts_with("https://")
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet > 0 || self.pipe
    }

    pub fn is_very_quiet(&self) -> bool {
        self.quiet > 1
    }

    /// Runtime configuration selected by the flags.
    ///
    /// Local archives are never cached; reading them is as cheap as the cache.
    pub fn config(&self) -> Config {
        Config {
            cache_dir: self.cache_dir.clone(),
            durable_cache: !self.no_cache && self.is_http_url(),
            request_timeout: Duration::from_secs(self.timeout),
            max_retry: self.retries,
            ..Config::default()
        }
    }
}
