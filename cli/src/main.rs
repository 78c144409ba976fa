//! ink-ls binary: a language server that drives `inklecate` for ink stories.
//!
//! ```text
//! main() -> init_tracing() -> InkLsConfig::load() -> serve(stdin, stdout)
//!                                                        |
//!                                                        v
//!                                   SessionEnd::Exit | InputClosed -> exit code
//! ```
//!
//! Stdout carries the protocol, so logs go to a file (or stderr when no
//! log file can be opened).

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use ink_ls_engine::{InkLsConfig, config_path};
use ink_ls_lsp::{ServerOptions, SessionEnd, serve};

const LOG_ENV: &str = "INK_LS_LOG";

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"))
}

fn init_tracing() {
    let (log_file, init_warnings) = open_log_file();

    match log_file {
        Some((log_path, file)) => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
                .with(env_filter())
                .init();
            tracing::info!(path = %log_path.display(), "Logging initialized");
        }
        None => {
            tracing_subscriber::registry()
                .with(fmt::layer().with_ansi(false).with_writer(std::io::stderr))
                .with(env_filter())
                .init();
        }
    }

    for warning in init_warnings {
        tracing::warn!("{warning}");
    }
}

fn open_log_file() -> (Option<(PathBuf, File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => warnings.push(format!(
                "Failed to open log file {}: {e}",
                candidate.display()
            )),
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // ~/.ink-ls/logs/ink-ls.log, next to the config file
    if let Some(config) = config_path()
        && let Some(dir) = config.parent()
    {
        candidates.push(dir.join("logs").join("ink-ls.log"));
    }

    candidates.push(PathBuf::from(".ink-ls").join("logs").join("ink-ls.log"));

    candidates
}

fn load_config() -> InkLsConfig {
    match InkLsConfig::load() {
        Ok(Some(config)) => {
            tracing::info!("Loaded config");
            config
        }
        Ok(None) => InkLsConfig::default(),
        Err(e) => {
            tracing::warn!(path = %e.path().display(), "Using built-in defaults: {e}");
            InkLsConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_tracing();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ink-ls starting");

    let config = load_config();
    let options = ServerOptions::from_config(&config);

    let end = tokio::select! {
        end = serve(tokio::io::stdin(), tokio::io::stdout(), options) => end?,
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                tracing::warn!("Failed to listen for interrupt: {e}");
            }
            tracing::info!("Interrupted");
            SessionEnd::InputClosed
        }
    };

    Ok(match end.exit_code() {
        0 => ExitCode::SUCCESS,
        _ => ExitCode::FAILURE,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_log_file_is_the_last_resort() {
        let candidates = log_file_candidates();
        assert_eq!(
            candidates.last(),
            Some(&PathBuf::from(".ink-ls/logs/ink-ls.log"))
        );
        if let Some(config) = config_path() {
            let dir = config.parent().unwrap();
            assert_eq!(candidates[0], dir.join("logs").join("ink-ls.log"));
        }
    }
}
