use crate::challenge::passphrase_digest;
use crate::output::print_json;
use anyhow::Context;
use clap::Subcommand;
use powerguard_core::config::{Config, WarnLevel};
use std::io::BufRead;
use std::path::Path;

// ---------------------------------------------------------------------------
// Subcommand types
// ---------------------------------------------------------------------------

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print the effective config (defaults filled in)
    Show,

    /// Validate the config for common mistakes
    Validate,

    /// Set the passphrase used to arm, disarm, and cancel (read from stdin)
    Passphrase,
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub fn run(path: &Path, subcmd: ConfigSubcommand, json: bool) -> anyhow::Result<()> {
    match subcmd {
        ConfigSubcommand::Init { force } => init(path, force, json),
        ConfigSubcommand::Show => show(path, json),
        ConfigSubcommand::Validate => validate(path, json),
        ConfigSubcommand::Passphrase => passphrase(path, json),
    }
}

// ---------------------------------------------------------------------------
// init
// ---------------------------------------------------------------------------

fn init(path: &Path, force: bool, json: bool) -> anyhow::Result<()> {
    let data = serde_yaml::to_string(&Config::default())?;
    let written = if force {
        powerguard_core::io::atomic_write(path, data.as_bytes())?;
        true
    } else {
        powerguard_core::io::write_if_missing(path, data.as_bytes())?
    };

    if json {
        print_json(&serde_json::json!({
            "path": path,
            "written": written,
        }))?;
    } else if written {
        println!("Wrote {}", path.display());
    } else {
        println!(
            "Config already exists at {} (use --force to overwrite)",
            path.display()
        );
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// show
// ---------------------------------------------------------------------------

fn show(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    if json {
        print_json(&config)?;
    } else {
        print!("{}", serde_yaml::to_string(&config)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// validate
// ---------------------------------------------------------------------------

fn validate(path: &Path, json: bool) -> anyhow::Result<()> {
    let config = Config::load(path).context("failed to load config")?;
    let warnings = config.validate();

    if json {
        let value = serde_json::json!({
            "warnings": warnings,
        });
        print_json(&value)?;
    } else if warnings.is_empty() {
        println!("Config is valid. No warnings.");
    } else {
        for w in &warnings {
            let prefix = match w.level {
                WarnLevel::Warning => "warning",
                WarnLevel::Error => "error",
            };
            println!("[{prefix}] {}", w.message);
        }
    }

    if Config::has_errors(&warnings) {
        anyhow::bail!("config validation found errors");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// passphrase
// ---------------------------------------------------------------------------

fn passphrase(path: &Path, json: bool) -> anyhow::Result<()> {
    let mut line = String::new();
    std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("failed to read passphrase from stdin")?;
    let phrase = line.trim_end_matches(['\r', '\n']);
    if phrase.trim().is_empty() {
        anyhow::bail!("passphrase must not be empty");
    }

    let mut config = Config::load_or_default(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.auth.passphrase_sha256 = Some(passphrase_digest(phrase));
    config
        .save(path)
        .with_context(|| format!("failed to write {}", path.display()))?;

    if json {
        print_json(&serde_json::json!({ "path": path, "updated": true }))?;
    } else {
        println!("Passphrase updated in {}", path.display());
    }
    Ok(())
}
