//! lbx: lockbox vault CLI
//!
//! Commands:
//!   init                      - create a config with a fresh KDF salt
//!   put <file>                - encrypt a file into the vault
//!   get <id> [-o <path>]      - decrypt an object to disk
//!   ls                        - list objects (optionally by folder or tag)
//!   info <id>                 - show decrypted metadata
//!   rm <id>                   - delete every blob of an object
//!   range <id> <start> <end>  - write plaintext bytes start..end to stdout
//!   stream <id> -o <path>     - progressively decrypt to a file
//!   status                    - probe vault storage
//!   config show               - display current configuration

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use secrecy::SecretString;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lbx_core::config::{expand_tilde, LbxConfig};
use lbx_core::{Layout, ObjectId, ObjectMetadata};
use lbx_crypto::EncryptionKey;
use lbx_store::{ListFilter, SaveRequest};
use lbx_stream::{ArtifactSink, LoaderState, Vault};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "lbx",
    version,
    about = "Lockbox encrypted vault",
    long_about = "lbx: store, list, stream and remove files in a password-encrypted vault"
)]
struct Cli {
    /// Path to lockbox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "LBX_CONFIG",
        default_value = "~/.config/lockbox/lockbox.toml"
    )]
    config: PathBuf,

    /// Log level filter (overrides `[log] level`; RUST_LOG wins over both)
    #[arg(long, env = "LBX_LOG")]
    log: Option<String>,

    /// Log output format (overrides `[log] format`)
    #[arg(long, env = "LBX_LOG_FORMAT", value_enum)]
    log_format: Option<LogFormat>,

    /// Vault password; prompted for when unset
    #[arg(long, env = "LBX_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a config file with a newly generated KDF salt
    Init {
        /// Vault directory (default: keep the configured root)
        #[arg(long)]
        root: Option<PathBuf>,
        /// Replace an existing salt. Objects stored under the old one become unreadable.
        #[arg(long)]
        force: bool,
    },

    /// Encrypt a local file into the vault
    Put {
        file: PathBuf,
        /// Display name (default: the file name)
        #[arg(long)]
        name: Option<String>,
        /// MIME type (default: guessed from the extension)
        #[arg(long)]
        mime: Option<String>,
        /// Folder path, segments separated by '/'
        #[arg(long, short = 'f')]
        folder: Option<String>,
        /// Tag to attach; repeatable
        #[arg(long = "tag", short = 't')]
        tags: Vec<String>,
        /// Preview image stored alongside image objects
        #[arg(long)]
        preview: Option<PathBuf>,
    },

    /// Decrypt an object to disk
    Get {
        id: String,
        /// Output path (default: the display name in the current directory)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },

    /// List stored objects, newest first
    Ls {
        /// Only objects at or below this folder ('/'-separated)
        #[arg(long, short = 'f')]
        folder: Option<String>,
        /// Only objects carrying this tag
        #[arg(long, short = 't')]
        tag: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show decrypted metadata of an object
    Info {
        id: String,
        #[arg(long)]
        json: bool,
    },

    /// Delete an object and all of its blobs
    Rm { id: String },

    /// Write plaintext bytes start..end (end exclusive) to stdout
    Range { id: String, start: u64, end: u64 },

    /// Progressively decrypt an object into a file
    Stream {
        id: String,
        #[arg(long, short = 'o')]
        output: PathBuf,
        /// Chunks decrypted before the prefix is usable (overrides config)
        #[arg(long)]
        initial: Option<u32>,
    },

    /// Probe vault storage
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigAction {
    /// Print the active configuration as TOML
    Show,
}

// ── Entry point ────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let config = LbxConfig::load(&config_path)
        .with_context(|| format!("loading config: {}", config_path.display()))?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli
        .log_format
        .unwrap_or(if config.log.format == "json" { LogFormat::Json } else { LogFormat::Text });
    init_logging(&level, format);

    match cli.command {
        Commands::Init { ref root, force } => cmd_init(&config_path, config, root.clone(), force),
        Commands::Config {
            action: ConfigAction::Show,
        } => cmd_config_show(&config, &config_path),
        Commands::Status => {
            let vault = open_vault(&config)?;
            cmd_status(&vault, &config).await
        }
        ref command => {
            let vault = open_vault(&config)?;
            let key = unlock(&vault, &config, cli.password.as_deref()).await?;
            run_keyed(command, &vault, &key).await
        }
    }
}

async fn run_keyed(command: &Commands, vault: &Vault, key: &EncryptionKey) -> Result<()> {
    match command {
        Commands::Put {
            file,
            name,
            mime,
            folder,
            tags,
            preview,
        } => {
            cmd_put(
                vault,
                key,
                file,
                name.as_deref(),
                mime.as_deref(),
                folder.as_deref(),
                tags,
                preview.as_deref(),
            )
            .await
        }
        Commands::Get { id, output } => cmd_get(vault, key, id, output.as_deref()).await,
        Commands::Ls { folder, tag, json } => {
            cmd_ls(vault, key, folder.as_deref(), tag.clone(), *json).await
        }
        Commands::Info { id, json } => cmd_info(vault, key, id, *json).await,
        Commands::Rm { id } => cmd_rm(vault, id).await,
        Commands::Range { id, start, end } => cmd_range(vault, key, id, *start, *end).await,
        Commands::Stream {
            id,
            output,
            initial,
        } => cmd_stream(vault, key, id, output, *initial).await,
        Commands::Init { .. } | Commands::Status | Commands::Config { .. } => Ok(()),
    }
}

// ── Logging ────────────────────────────────────────────────────────────────────

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // Logs go to stderr so `range` output stays clean
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

// ── Vault + key ────────────────────────────────────────────────────────────────

fn open_vault(config: &LbxConfig) -> Result<Vault> {
    Vault::open(config).with_context(|| {
        format!(
            "opening {} vault at {}",
            config.vault.backend,
            config.vault.root.display()
        )
    })
}

fn decode_salt(config: &LbxConfig) -> Result<Vec<u8>> {
    let encoded = config
        .crypto
        .salt
        .as_deref()
        .context("no KDF salt configured; run `lbx init` first")?;
    BASE64
        .decode(encoded.trim())
        .context("crypto.salt is not valid base64")
}

async fn unlock(vault: &Vault, config: &LbxConfig, password: Option<&str>) -> Result<EncryptionKey> {
    let salt = decode_salt(config)?;
    let password = match password {
        Some(p) => SecretString::from(p.to_owned()),
        None => SecretString::from(
            rpassword::prompt_password("Vault password: ").context("reading password")?,
        ),
    };

    let spinner = make_spinner("deriving key...");
    let key = vault.derive_key(&password, &salt).await;
    spinner.finish_and_clear();
    Ok(key?)
}

fn parse_id(id: &str) -> Result<ObjectId> {
    ObjectId::parse_str(id.trim()).with_context(|| format!("invalid object id: {id}"))
}

fn parse_folder(folder: &str) -> Vec<String> {
    folder
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

// ── Init / config ──────────────────────────────────────────────────────────────

fn cmd_init(path: &Path, mut config: LbxConfig, root: Option<PathBuf>, force: bool) -> Result<()> {
    if config.crypto.salt.is_some() && !force {
        bail!(
            "{} already has a KDF salt; pass --force to replace it (existing objects become unreadable)",
            path.display()
        );
    }
    if let Some(root) = root {
        config.vault.root = root;
    }
    config.crypto.salt = Some(BASE64.encode(lbx_crypto::generate_salt()));
    config
        .save(path)
        .with_context(|| format!("writing config: {}", path.display()))?;

    // Creates the fs root
    open_vault(&config)?;

    println!("Initialized vault");
    println!("  config: {}", path.display());
    println!("  root:   {}", expand_tilde(&config.vault.root).display());
    println!("  kdf:    PBKDF2-HMAC-SHA256, {} iterations", config.crypto.kdf_iterations);
    Ok(())
}

fn cmd_config_show(config: &LbxConfig, config_path: &Path) -> Result<()> {
    let mut shown = config.clone();
    if shown.crypto.salt.is_some() {
        shown.crypto.salt = Some("<set>".into());
    }
    let toml_str = toml::to_string_pretty(&shown).context("serializing config to TOML")?;
    println!("# Configuration from: {}", config_path.display());
    println!("{toml_str}");
    Ok(())
}

async fn cmd_status(vault: &Vault, config: &LbxConfig) -> Result<()> {
    let spinner = make_spinner("probing storage...");
    let result = vault.health().await;
    spinner.finish_and_clear();

    println!("lbx v{}", env!("CARGO_PKG_VERSION"));
    println!("  backend:  {}", config.vault.backend);
    println!("  root:     {}", expand_tilde(&config.vault.root).display());
    println!(
        "  salt:     {}",
        if config.crypto.salt.is_some() { "configured" } else { "missing (run `lbx init`)" }
    );
    match result {
        Ok(blobs) => {
            println!("  storage:  ok ({blobs} blobs)");
            Ok(())
        }
        Err(e) => {
            println!("  storage:  unreachable");
            Err(e).context("vault storage health check failed")
        }
    }
}

// ── Object commands ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn cmd_put(
    vault: &Vault,
    key: &EncryptionKey,
    file: &Path,
    name: Option<&str>,
    mime: Option<&str>,
    folder: Option<&str>,
    tags: &[String],
    preview: Option<&Path>,
) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;
    let name = match name {
        Some(n) => n.to_owned(),
        None => file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("cannot derive a name from the path; pass --name")?,
    };
    let mime = mime.map(str::to_owned).unwrap_or_else(|| guess_mime(file).to_owned());

    let mut req = SaveRequest::new(name, mime).tags(tags.iter().cloned());
    if let Some(folder) = folder {
        req = req.folder(parse_folder(folder));
    }
    if let Some(preview) = preview {
        let bytes = tokio::fs::read(preview)
            .await
            .with_context(|| format!("reading preview {}", preview.display()))?;
        req = req.preview(bytes);
    }

    let spinner = make_spinner(&format!("encrypting {} ({})", file.display(), fmt_bytes(data.len() as u64)));
    let result = vault.save_object(Bytes::from(data), req, key).await;
    spinner.finish_and_clear();
    let meta = result.with_context(|| format!("storing {}", file.display()))?;

    println!("{}", meta.id);
    tracing::info!(
        id = %meta.id,
        name = %meta.display_name,
        size = meta.size,
        chunked = meta.layout.is_chunked(),
        "object stored"
    );
    Ok(())
}

async fn cmd_get(vault: &Vault, key: &EncryptionKey, id: &str, output: Option<&Path>) -> Result<()> {
    let id = parse_id(id)?;
    let spinner = make_spinner("decrypting...");
    let result = vault.load_object(&id, key, None).await;
    spinner.finish_and_clear();
    let (data, meta) = result.with_context(|| format!("loading {id}"))?;

    let out = match output {
        Some(p) => p.to_path_buf(),
        None => PathBuf::from(safe_file_name(&meta.display_name)),
    };
    tokio::fs::write(&out, &data)
        .await
        .with_context(|| format!("writing {}", out.display()))?;

    println!("{} -> {} ({})", id, out.display(), fmt_bytes(data.len() as u64));
    Ok(())
}

async fn cmd_ls(
    vault: &Vault,
    key: &EncryptionKey,
    folder: Option<&str>,
    tag: Option<String>,
    json: bool,
) -> Result<()> {
    let filter = ListFilter {
        folder_prefix: folder.map(parse_folder),
        tag,
    };
    let objects = vault.list_objects(key, &filter).await.context("listing objects")?;

    if json {
        let rows: Vec<_> = objects.iter().map(metadata_json).collect();
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if objects.is_empty() {
        println!("(no objects)");
        return Ok(());
    }
    for meta in &objects {
        println!(
            "{}  {:>10}  {}  {}",
            meta.id,
            fmt_bytes(meta.size),
            meta.created_at.format("%Y-%m-%d %H:%M"),
            display_path(meta),
        );
    }
    println!("{} object(s)", objects.len());
    Ok(())
}

async fn cmd_info(vault: &Vault, key: &EncryptionKey, id: &str, json: bool) -> Result<()> {
    let id = parse_id(id)?;
    let meta = vault
        .load_metadata(&id, key)
        .await
        .with_context(|| format!("loading metadata of {id}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&metadata_json(&meta))?);
        return Ok(());
    }

    println!("id:       {}", meta.id);
    println!("name:     {}", meta.display_name);
    println!("path:     {}", display_path(&meta));
    println!("type:     {}", meta.mime_type);
    println!("size:     {} ({} bytes)", fmt_bytes(meta.size), meta.size);
    println!("created:  {}", meta.created_at.to_rfc3339());
    match meta.layout {
        Layout::Single => println!("layout:   single blob"),
        Layout::Chunked {
            chunk_size,
            chunk_count,
            ..
        } => println!("layout:   {chunk_count} chunks of {}", fmt_bytes(chunk_size)),
    }
    if !meta.tags.is_empty() {
        let tags: Vec<_> = meta.tags.iter().map(String::as_str).collect();
        println!("tags:     {}", tags.join(", "));
    }
    println!("preview:  {}", if meta.has_preview { "yes" } else { "no" });
    Ok(())
}

async fn cmd_rm(vault: &Vault, id: &str) -> Result<()> {
    let id = parse_id(id)?;
    let report = vault
        .delete_object(&id)
        .await
        .with_context(|| format!("deleting {id}"))?;

    for (name, err) in &report.failed {
        eprintln!("  failed: {name}: {err}");
    }
    println!("removed {} blob(s) of {id}", report.removed.len());
    if !report.is_complete() {
        bail!("{} blob(s) of {id} could not be removed", report.failed.len());
    }
    Ok(())
}

async fn cmd_range(vault: &Vault, key: &EncryptionKey, id: &str, start: u64, end: u64) -> Result<()> {
    let id = parse_id(id)?;
    let data = vault
        .get_chunk_range(&id, start, end, key)
        .await
        .with_context(|| format!("reading bytes {start}..{end} of {id}"))?;
    vault.close_stream(&id);

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&data).context("writing to stdout")?;
    stdout.flush()?;
    Ok(())
}

async fn cmd_stream(
    vault: &Vault,
    key: &EncryptionKey,
    id: &str,
    output: &Path,
    initial: Option<u32>,
) -> Result<()> {
    let id = parse_id(id)?;
    let mut opts = vault
        .progressive_options()
        .with_sink(ArtifactSink::File(output.to_path_buf()));
    if let Some(initial) = initial {
        opts.initial_chunk_budget = initial;
    }

    let stream = vault
        .open_progressive_stream(&id, key, opts)
        .await
        .with_context(|| format!("starting stream of {id}"))?;
    let meta = stream.metadata().clone();
    println!(
        "{} ready: {} of {} decrypted to {}",
        meta.display_name,
        fmt_bytes(stream.initial_len()),
        fmt_bytes(meta.size),
        output.display()
    );

    let pb = make_progress_bar(meta.size, "stream");
    pb.set_position(stream.artifact().len());
    let mut progress = stream.artifact().subscribe();
    let ticker = {
        let pb = pb.clone();
        tokio::spawn(async move {
            while progress.changed().await.is_ok() {
                let len = *progress.borrow_and_update();
                pb.set_position(len);
            }
        })
    };

    let result = tokio::select! {
        r = stream.wait() => r,
        _ = tokio::signal::ctrl_c() => {
            pb.set_message("cancelling");
            stream.cancel();
            stream.wait().await
        }
    };
    ticker.abort();

    match result {
        Ok(len) => {
            pb.set_position(len);
            pb.finish_with_message("done");
            println!("{} -> {} ({})", id, output.display(), fmt_bytes(len));
            Ok(())
        }
        Err(e) => {
            pb.abandon_with_message(format!("{:?}", stream.state()));
            if stream.state() == LoaderState::Failed {
                eprintln!(
                    "kept {} verified bytes in {}",
                    stream.artifact().len(),
                    output.display()
                );
            }
            Err(e).with_context(|| format!("streaming {id}"))
        }
    }
}

// ── Output helpers ─────────────────────────────────────────────────────────────

fn metadata_json(meta: &ObjectMetadata) -> serde_json::Value {
    serde_json::json!({
        "id": meta.id,
        "name": meta.display_name,
        "type": meta.mime_type,
        "size": meta.size,
        "folderPath": meta.folder_path,
        "tags": meta.tags,
        "createdAt": meta.created_at.to_rfc3339(),
        "chunked": meta.layout.is_chunked(),
        "blobs": meta.layout.blob_count(),
        "hasPreview": meta.has_preview,
    })
}

fn display_path(meta: &ObjectMetadata) -> String {
    if meta.folder_path.is_empty() {
        meta.display_name.clone()
    } else {
        format!("{}/{}", meta.folder_path.join("/"), meta.display_name)
    }
}

/// Strip path separators so a stored display name cannot escape the cwd.
fn safe_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "object.bin".into(),
        _ => cleaned,
    }
}

fn guess_mime(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "json" => "application/json",
        "txt" | "md" => "text/plain",
        _ => "application/octet-stream",
    }
}

fn make_progress_bar(total: u64, prefix: &str) -> ProgressBar {
    let pb = ProgressBar::new(total);
    let style = ProgressStyle::with_template(
        "{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());
    pb.set_style(style);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn make_spinner(msg: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    let style = ProgressStyle::with_template("{spinner:.green} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    pb.set_style(style);
    pb.set_message(msg.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    pb
}

fn fmt_bytes(n: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if n >= GB {
        format!("{:.1} GB", n as f64 / GB as f64)
    } else if n >= MB {
        format!("{:.1} MB", n as f64 / MB as f64)
    } else if n >= KB {
        format!("{:.1} KB", n as f64 / KB as f64)
    } else {
        format!("{n} B")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_put_with_repeated_tags() {
        let cli = Cli::try_parse_from([
            "lbx", "put", "clip.mp4", "--folder", "trips/2024", "-t", "beach", "-t", "sun",
        ])
        .unwrap();
        match cli.command {
            Commands::Put { tags, folder, .. } => {
                assert_eq!(tags, vec!["beach", "sun"]);
                assert_eq!(folder.as_deref(), Some("trips/2024"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn folder_segments_skip_empty_parts() {
        assert_eq!(parse_folder("/a//b/"), vec!["a", "b"]);
        assert!(parse_folder("").is_empty());
    }

    #[test]
    fn mime_guess_by_extension() {
        assert_eq!(guess_mime(Path::new("x/Movie.MOV")), "video/quicktime");
        assert_eq!(guess_mime(Path::new("photo.jpeg")), "image/jpeg");
        assert_eq!(guess_mime(Path::new("noext")), "application/octet-stream");
    }

    #[test]
    fn display_names_cannot_escape_cwd() {
        assert_eq!(safe_file_name("../etc/passwd"), ".._etc_passwd");
        assert_eq!(safe_file_name(".."), "object.bin");
        assert_eq!(safe_file_name("report.pdf"), "report.pdf");
    }

    #[test]
    fn salt_must_be_configured_and_base64() {
        let mut config = LbxConfig::default();
        assert!(decode_salt(&config).is_err());
        config.crypto.salt = Some("not base64!".into());
        assert!(decode_salt(&config).is_err());
        config.crypto.salt = Some(BASE64.encode([7u8; 16]));
        assert_eq!(decode_salt(&config).unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn init_writes_salt_and_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lockbox.toml");
        let mut config = LbxConfig::default();
        config.vault.backend = "memory".into();

        cmd_init(&path, config, None, false).unwrap();
        let written = LbxConfig::load(&path).unwrap();
        assert_eq!(decode_salt(&written).unwrap().len(), lbx_crypto::SALT_SIZE);

        assert!(cmd_init(&path, written.clone(), None, false).is_err());
        cmd_init(&path, written.clone(), None, true).unwrap();
        let replaced = LbxConfig::load(&path).unwrap();
        assert_ne!(replaced.crypto.salt, written.crypto.salt);
    }

    #[test]
    fn fmt_bytes_units() {
        assert_eq!(fmt_bytes(512), "512 B");
        assert_eq!(fmt_bytes(2048), "2.0 KB");
        assert_eq!(fmt_bytes(5 * 1024 * 1024), "5.0 MB");
    }
}
