//! Main entry point for the zipfetch CLI application.
//!
//! Lists, extracts or pipes entries of a ZIP archive given as a local path
//! or an HTTP URL. Remote archives are read with Range requests and cached
//! between runs.

use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing_subscriber::EnvFilter;

use zipfetch::{
    ArchiveManager, ArchiveRegistry, Cli, Entry, Folder, HttpRangeFetcher, LocalFileFetcher,
    RangeFetch,
};

/// Application entry point.
///
/// Parses command-line arguments and dispatches to the appropriate handler
/// based on whether the input is a local file or HTTP URL.
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli);

    let config = cli.config();

    if cli.is_http_url() {
        // Handle remote ZIP file via HTTP Range requests
        let fetcher = Arc::new(HttpRangeFetcher::new(&config)?);
        let registry = ArchiveRegistry::with_config(fetcher.clone(), config).await?;
        let manager = registry.manager(&cli.file);
        if cli.refresh {
            manager.clear_cache().await?;
        }

        process_zip(&manager, &cli).await?;

        // Display network transfer statistics for HTTP sources
        if !cli.is_quiet() {
            eprintln!(
                "\nTotal bytes transferred: {}",
                format_size(fetcher.transferred_bytes())
            );
        }
    } else {
        // Handle local ZIP file
        let fetcher = Arc::new(LocalFileFetcher::new());
        let manager = ArchiveManager::new(cli.file.clone(), fetcher, None, &config);
        process_zip(&manager, &cli).await?;
    }

    Ok(())
}

/// Install the stderr log subscriber.
///
/// `RUST_LOG` wins; otherwise warnings only, or info for this crate with `-v`.
fn init_tracing(cli: &Cli) {
    let default = if cli.verbose && !cli.is_very_quiet() {
        "warn,zipfetch=info"
    } else if cli.is_very_quiet() {
        "error"
    } else {
        "warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Process a ZIP archive based on CLI options.
///
/// - List mode (`-l` or `-v`): Display archive contents
/// - Tree mode (`-t`): Display the folder tree
/// - Extract mode: Extract files matching the specified filters
async fn process_zip<F: RangeFetch + 'static>(manager: &ArchiveManager<F>, cli: &Cli) -> Result<()> {
    let catalog = manager.load_catalog().await?;

    if cli.tree {
        print_folder(&Folder::from_entries(catalog.entries()), 0);
        return Ok(());
    }

    if cli.list || cli.verbose {
        list_files(catalog.entries(), cli.verbose);
        return Ok(());
    }

    // Apply filters to determine which files to extract:
    // 1. Skip directories (they are created automatically during extraction)
    // 2. If specific files are requested, only include matching entries
    // 3. Exclude files matching the exclusion patterns
    let files_to_extract: Vec<&Entry> = catalog
        .entries()
        .iter()
        .filter(|e| !e.is_directory())
        .filter(|e| cli.files.is_empty() || cli.files.iter().any(|f| matches_file(f, e)))
        .filter(|e| {
            !cli
                .exclude
                .iter()
                .any(|x| e.path.contains(x.as_str()) || glob_match(x, &e.path))
        })
        .collect();

    let multiple_files = cli.pipe && files_to_extract.len() > 1;
    for entry in files_to_extract {
        extract_file(manager, entry, cli, multiple_files).await?;
    }

    Ok(())
}

/// Whether a positional FILES argument selects `entry`.
///
/// Patterns with wildcards use glob matching; plain names match the full
/// path or the base name.
fn matches_file(pattern: &str, entry: &Entry) -> bool {
    if has_glob_chars(pattern) {
        glob_match(pattern, &entry.path)
    } else {
        entry.path == pattern || entry.file_name() == pattern
    }
}

/// List files in the ZIP archive.
///
/// Supports two output formats:
/// - Simple format (`-l`): Just file names, one per line
/// - Verbose format (`-v`): Detailed table with size, compression ratio and timestamps
fn list_files(entries: &[Entry], verbose: bool) {
    if !verbose {
        for entry in entries {
            println!("{}", entry.path);
        }
        return;
    }

    println!(
        "{:>10}  {:>10}  {:>5}  {:>10}  {:>5}  {:>8}  Name",
        "Length", "Size", "Cmpr", "Date", "Time", "CRC-32"
    );
    println!("{}", "-".repeat(80));

    // Track totals for summary line
    let mut total_uncompressed = 0u64;
    let mut total_compressed = 0u64;
    let mut file_count = 0usize;

    for entry in entries {
        let (year, month, day) = entry.mod_date();
        let (hour, minute, _second) = entry.mod_time();

        println!(
            "{:>10}  {:>10}  {}  {:04}-{:02}-{:02}  {:02}:{:02}  {:08x}  {}",
            entry.uncompressed_size,
            entry.compressed_size,
            ratio(entry.compressed_size, entry.uncompressed_size),
            year,
            month,
            day,
            hour,
            minute,
            entry.crc32,
            entry.path
        );

        if !entry.is_directory() {
            total_uncompressed += entry.uncompressed_size;
            total_compressed += entry.compressed_size;
            file_count += 1;
        }
    }

    println!("{}", "-".repeat(80));
    println!(
        "{:>10}  {:>10}  {}  {:>31}  {} files",
        total_uncompressed,
        total_compressed,
        ratio(total_compressed, total_uncompressed),
        "",
        file_count
    );
}

/// Compression ratio as percentage saved
fn ratio(compressed: u64, uncompressed: u64) -> String {
    if uncompressed > 0 && compressed <= uncompressed {
        format!("{:>4}%", 100 - (compressed * 100 / uncompressed))
    } else {
        "  0%".to_string()
    }
}

fn print_folder(folder: &Folder, depth: usize) {
    let indent = "  ".repeat(depth);
    println!("{}{}/  ({})", indent, folder.name.trim_end_matches('/'), format_size(folder.size));
    for sub in &folder.subfolders {
        print_folder(sub, depth + 1);
    }
    for entry in &folder.entries {
        println!(
            "{}  {}  ({})",
            indent,
            entry.file_name(),
            format_size(entry.compressed_size)
        );
    }
}

/// Extract a single file from the archive.
///
/// Handles various extraction options:
/// - Pipe mode (`-p`): Write to stdout instead of file
/// - Custom output directory (`-d`): Extract to specified directory
/// - Junk paths (`-j`): Ignore directory structure in archive
/// - Overwrite control (`-n`, `-o`): Handle existing files
async fn extract_file<F: RangeFetch + 'static>(
    manager: &ArchiveManager<F>,
    entry: &Entry,
    cli: &Cli,
    show_filename: bool,
) -> Result<()> {
    // Pipe mode: write file contents directly to stdout
    if cli.pipe {
        let data = manager.fetch_entry_data(&entry.path).await?;
        let mut stdout = tokio::io::stdout();
        if show_filename {
            stdout
                .write_all(format!("--- {} ---\n", entry.path).as_bytes())
                .await?;
        }
        stdout.write_all(&data).await?;
        stdout.flush().await?;
        return Ok(());
    }

    let output_path = output_path(entry, cli);

    // Handle existing files based on overwrite options
    if output_path.exists() {
        if cli.never_overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (file exists)", entry.path);
            }
            return Ok(());
        }

        if !cli.overwrite {
            if !cli.is_quiet() {
                eprintln!("Skipping: {} (use -o to overwrite)", entry.path);
            }
            return Ok(());
        }
    }

    if !cli.is_quiet() {
        println!("  extracting: {}", entry.path);
    }

    let data = manager.fetch_entry_data(&entry.path).await?;

    if let Some(parent) = output_path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&output_path, &data).await?;

    Ok(())
}

/// Destination of an extracted entry, honoring `-d` and `-j`.
fn output_path(entry: &Entry, cli: &Cli) -> PathBuf {
    let file_name = if cli.junk_paths {
        entry.file_name().to_string()
    } else {
        // Never write outside the target directory
        Path::new(&entry.path)
            .components()
            .filter(|c| matches!(c, std::path::Component::Normal(_)))
            .collect::<PathBuf>()
            .to_string_lossy()
            .to_string()
    };

    match cli.extract_dir {
        Some(ref dir) => PathBuf::from(dir).join(file_name),
        None => PathBuf::from(file_name),
    }
}

/// Check if a pattern contains glob wildcard characters.
fn has_glob_chars(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Simple glob pattern matching supporting `*` and `?` wildcards.
///
/// - `*` matches zero or more characters
/// - `?` matches exactly one character
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern_chars: Vec<char> = pattern.chars().collect();
    let text_chars: Vec<char> = text.chars().collect();

    fn do_match(pattern: &[char], text: &[char]) -> bool {
        match (pattern.first(), text.first()) {
            (None, None) => true,
            // Star matches zero characters, or one and stays for more
            (Some('*'), _) => {
                do_match(&pattern[1..], text) || (!text.is_empty() && do_match(pattern, &text[1..]))
            }
            (Some('?'), Some(_)) => do_match(&pattern[1..], &text[1..]),
            (Some(p), Some(t)) if *p == *t => do_match(&pattern[1..], &text[1..]),
            _ => false,
        }
    }

    do_match(&pattern_chars, &text_chars)
}

/// Format a byte size into a human-readable string.
fn format_size(size: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if size >= GB {
        format!("{:.2} GB", size as f64 / GB as f64)
    } else if size >= MB {
        format!("{:.2} MB", size as f64 / MB as f64)
    } else if size >= KB {
        format!("{:.2} KB", size as f64 / KB as f64)
    } else {
        format!("{} bytes", size)
    }
}
