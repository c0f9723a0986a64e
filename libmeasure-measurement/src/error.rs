// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use libmeasure_definitions::{DefinitionError, UnifyError};
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum MeasurementError {
    #[error("cannot create a {total_memory} byte arena with {page_size} byte pages")]
    Arena {
        total_memory: usize,
        page_size: usize,
    },
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    #[error("unification failed: {0}")]
    Unify(#[from] UnifyError),
    #[error("cannot install the logger: {0}")]
    Logger(String),
}

/// How bad a reported fault is. Every kind disables only the subsystem that
/// raised it; the instrumented program keeps running.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// The arena ran out of pages.
    ResourceExhausted,
    /// The event stream contradicts the recorded state, e.g. an exit of a
    /// region that is not open.
    Consistency,
    /// A collective step of unification failed.
    Unification,
}

impl fmt::Display for FaultKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FaultKind::ResourceExhausted => "resource exhausted",
            FaultKind::Consistency => "consistency violation",
            FaultKind::Unification => "unification failure",
        })
    }
}

/// A fault as seen by a user installed handler.
#[derive(Clone, Debug)]
pub struct Fault {
    pub subsystem: &'static str,
    pub kind: FaultKind,
    pub message: String,
}

type Handler = Arc<dyn Fn(&Fault) + Send + Sync>;

/// The process-wide "report, then degrade" channel. Cloning yields another
/// handle to the same reporter.
#[derive(Clone, Default)]
pub struct ErrorReporter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    reported: AtomicU64,
    handler: RwLock<Option<Handler>>,
}

impl ErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the handler called for every subsequent report.
    pub fn set_handler(&self, handler: impl Fn(&Fault) + Send + Sync + 'static) {
        *self.inner.handler.write() = Some(Arc::new(handler));
    }

    #[cold]
    pub fn report(&self, subsystem: &'static str, kind: FaultKind, err: &dyn std::error::Error) {
        self.inner.reported.fetch_add(1, Ordering::Relaxed);
        error!(subsystem, %kind, "{err}");
        let handler = self.inner.handler.read().clone();
        if let Some(handler) = handler {
            handler(&Fault {
                subsystem,
                kind,
                message: err.to_string(),
            });
        }
    }

    /// Number of faults reported so far.
    pub fn reported(&self) -> u64 {
        self.inner.reported.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for ErrorReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorReporter")
            .field("reported", &self.reported())
            .finish_non_exhaustive()
    }
}
