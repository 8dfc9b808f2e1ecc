//! OpenDAL Operator factory for lockbox vault backends

use anyhow::{Context, Result};
use lbx_core::config::{expand_tilde, VaultConfig};
use opendal::Operator;

/// Build an OpenDAL Operator for the configured vault backend.
///
/// - `fs`: blobs are plain files under `vault.root` (created if missing)
/// - `memory`: process-local, lost on exit (tests, dry runs)
pub fn build_operator(cfg: &VaultConfig) -> Result<Operator> {
    match cfg.backend.as_str() {
        "fs" => {
            let root = expand_tilde(&cfg.root);
            std::fs::create_dir_all(&root)
                .with_context(|| format!("creating vault root: {}", root.display()))?;

            // opendal 0.55: builders use the consuming pattern
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());

            let op = Operator::new(builder)
                .context("creating OpenDAL fs operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(3)
                        .with_jitter(),
                )
                .finish();
            Ok(op)
        }
        "memory" => memory_operator(),
        other => anyhow::bail!("unknown vault backend {other:?} (expected \"fs\" or \"memory\")"),
    }
}

/// In-memory operator; contents vanish with the operator.
pub fn memory_operator() -> Result<Operator> {
    let op = Operator::new(opendal::services::Memory::default())
        .context("creating OpenDAL memory operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .finish();
    Ok(op)
}
