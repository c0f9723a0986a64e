// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional diagnostic output. The measurement crates only emit `tracing`
//! events; nothing is printed unless a subscriber is installed, either by
//! the host application or by [`init`].

use crate::MeasurementError;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogTarget {
    Out,
    #[default]
    Err,
}

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Installs a global subscriber writing compact lines to `target`, filtered
/// by `RUST_LOG` (default `info`). Returns `Ok(false)` if this function
/// already installed one.
pub fn init(target: LogTarget) -> Result<bool, MeasurementError> {
    if INSTALLED.swap(true, Ordering::AcqRel) {
        return Ok(false);
    }
    let layer = match target {
        LogTarget::Out => std_layer().with_writer(std::io::stdout).boxed(),
        LogTarget::Err => std_layer().with_writer(std::io::stderr).boxed(),
    };
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(layer);
    match tracing::subscriber::set_global_default(subscriber) {
        Ok(()) => Ok(true),
        Err(e) => {
            INSTALLED.store(false, Ordering::Release);
            Err(MeasurementError::Logger(e.to_string()))
        }
    }
}

fn std_layer<S>() -> fmt::Layer<S> {
    fmt::layer()
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_target(true)
        .with_ansi(false)
}

/// Create environment filter with default to INFO level.
fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(LevelFilter::INFO.to_string().to_lowercase()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        // Another test binary may already own the global subscriber; the
        // second call must report "already installed" either way.
        let first = init(LogTarget::Err);
        assert!(matches!(first, Ok(true) | Err(MeasurementError::Logger(_))));
        if first.is_ok() {
            assert!(matches!(init(LogTarget::Out), Ok(false)));
        }
    }
}
