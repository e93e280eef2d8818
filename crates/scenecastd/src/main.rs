//! scenecastd: resource file tooling for scenecast.
//!
//!   scenecastd pack <out.scrf> <type> <file>...
//!   scenecastd inspect [<file.scrf>...]
//!   scenecastd verify [<file.scrf>...]
//!
//! `inspect` and `verify` act on the resource files listed in the config
//! plus any given on the command line.

use std::path::PathBuf;

use anyhow::{bail, Result};

use scenecast_core::config::ScenecastConfig;
use scenecast_core::hash;
use scenecast_services::PeerId;

mod commands;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = ScenecastConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let config = ScenecastConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        ScenecastConfig::default()
    });

    let mut args = std::env::args().skip(1);
    let command = args.next().unwrap_or_else(|| "inspect".to_string());
    let rest: Vec<String> = args.collect();

    match command.as_str() {
        "pack" => {
            let [out, kind, inputs @ ..] = rest.as_slice() else {
                bail!("usage: scenecastd pack <out.scrf> <type> <file>...");
            };
            let inputs: Vec<PathBuf> = inputs.iter().map(PathBuf::from).collect();
            commands::pack(&config, &PathBuf::from(out), kind, &inputs)
        }
        "inspect" => commands::inspect(&resource_files(&config, &rest)),
        "verify" => {
            let ok = commands::verify(&config, local_peer(&config), &resource_files(&config, &rest)).await?;
            if !ok {
                bail!("verification failed");
            }
            Ok(())
        }
        other => bail!("unknown command {other:?} (expected pack, inspect or verify)"),
    }
}

fn resource_files(config: &ScenecastConfig, extra: &[String]) -> Vec<PathBuf> {
    config
        .cache
        .resource_files
        .iter()
        .cloned()
        .chain(extra.iter().map(PathBuf::from))
        .collect()
}

/// Configured peer id, or one derived from host and pid.
fn local_peer(config: &ScenecastConfig) -> PeerId {
    if let Some(bytes) = config.peer_id_bytes() {
        return PeerId(bytes);
    }
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    let seed = format!("{}-{}", host, std::process::id());
    let peer = PeerId(hash::hash(seed.as_bytes()));
    tracing::info!(peer = %peer, "derived peer id");
    peer
}
