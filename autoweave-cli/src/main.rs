// Developer tooling for plugin authors: validate a plugin directory the
// way the loader will, and sign its manifest over the covered files.

use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use autoweave_manifest::{
    sign_manifest_value, verify_signature, ManifestDocument, DEFAULT_DENYLIST, MANIFEST_FILE_NAME,
};
use autoweave_permissions::PermissionSet;

#[derive(Parser)]
#[command(name = "autoweave-cli", about = "AutoWeave plugin tooling")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate a plugin directory: schema, field patterns, and content
    /// signature, exactly as the loader enforces them.
    Validate {
        /// Path to the plugin directory.
        plugin_dir: PathBuf,
    },
    /// Recompute the content digest and write it into the manifest's
    /// signature record.
    Sign {
        /// Path to the plugin directory.
        plugin_dir: PathBuf,
        /// Provenance string recorded in signature.signer.
        #[arg(long, default_value = "autoweave-cli")]
        signer: String,
    },
    /// Print the permission set the evaluator will derive.
    Permissions {
        /// Path to the plugin directory.
        plugin_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Command::Validate { plugin_dir } => validate(&plugin_dir),
        Command::Sign { plugin_dir, signer } => sign(&plugin_dir, &signer),
        Command::Permissions { plugin_dir } => permissions(&plugin_dir),
    }
}

fn load_document(plugin_dir: &PathBuf) -> Result<ManifestDocument> {
    let path = plugin_dir.join(MANIFEST_FILE_NAME);
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    Ok(ManifestDocument::parse(&bytes)?)
}

fn validate(plugin_dir: &PathBuf) -> Result<()> {
    let document = load_document(plugin_dir)?;
    let manifest = document.validate(plugin_dir)?;
    verify_signature(&manifest, &document, plugin_dir, DEFAULT_DENYLIST)?;
    println!(
        "ok: {} v{} validates and its signature covers the tree",
        manifest.name, manifest.version
    );
    Ok(())
}

fn sign(plugin_dir: &PathBuf, signer: &str) -> Result<()> {
    let path = plugin_dir.join(MANIFEST_FILE_NAME);
    let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
    let mut value: serde_json::Value = serde_json::from_slice(&bytes)?;
    let Some(signature) = value.get_mut("signature") else {
        bail!("manifest has no signature record to fill in");
    };
    signature["signer"] = serde_json::Value::String(signer.to_string());

    let signed = sign_manifest_value(value, plugin_dir, DEFAULT_DENYLIST)?;
    fs::write(&path, serde_json::to_string_pretty(&signed)?)?;
    println!(
        "signed: {}",
        signed["signature"]["value"].as_str().unwrap_or_default()
    );
    Ok(())
}

fn permissions(plugin_dir: &PathBuf) -> Result<()> {
    let document = load_document(plugin_dir)?;
    let manifest = document.validate(plugin_dir)?;
    let set = PermissionSet::from_declaration(&manifest.permissions);
    println!("{}", serde_json::to_string_pretty(&set)?);
    Ok(())
}
