//! Format resolver: pick the backend for a file
//!
//! Order is fixed: mime type, then extension (after stripping at most one
//! compound wrapper suffix), then trial execution of every backend of the
//! domain in priority order. A trial that fails or returns non-zero is
//! expected and only moves on to the next candidate.

use crate::bindings::Domain;
use crate::error::{BridgeError, Result};
use crate::executor::ExecutionResult;
use std::future::Future;
use tracing::{debug, info};

/// Wrapper suffixes removed before the extension lookup (case-insensitive)
pub const COMPOUND_SUFFIXES: [&str; 4] = ["gz", "cbor", "zst", "zip"];

/// Lookup extension of `file_name`, lowercased
///
/// Only one wrapper suffix is stripped: `scan.nii.gz` → `nii`,
/// `volume.iwi.cbor.zst` → `cbor`.
pub fn extension(file_name: &str) -> Option<String> {
    let base = file_name.rsplit(['/', '\\']).next().unwrap_or(file_name);
    let (rest, last) = base.rsplit_once('.')?;
    let extension = if COMPOUND_SUFFIXES
        .iter()
        .any(|suffix| last.eq_ignore_ascii_case(suffix))
    {
        rest.rsplit_once('.')?.1
    } else {
        last
    };
    if extension.is_empty() {
        return None;
    }
    Some(extension.to_lowercase())
}

/// Outcome of one trial execution
#[derive(Debug)]
pub enum TrialOutcome {
    /// The candidate ran and returned 0
    Accepted(ExecutionResult),

    /// The candidate could not handle the input
    Rejected { reason: String },
}

impl TrialOutcome {
    pub fn from_execution(result: Result<ExecutionResult>) -> Self {
        match result {
            Ok(result) if result.succeeded() => Self::Accepted(result),
            Ok(result) => Self::Rejected {
                reason: format!("returned {}", result.return_value),
            },
            Err(e) => Self::Rejected {
                reason: e.to_string(),
            },
        }
    }
}

/// How a backend was chosen
#[derive(Debug)]
pub enum Resolution {
    Mime(&'static str),
    Extension(&'static str),
    /// Chosen by trial; carries the accepted run so it need not be repeated
    Trial {
        backend: &'static str,
        result: ExecutionResult,
    },
}

impl Resolution {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Mime(backend) | Self::Extension(backend) => *backend,
            Self::Trial { backend, .. } => *backend,
        }
    }
}

/// Trial candidates of a domain, in priority order
#[derive(Debug, Clone)]
pub struct Candidates {
    remaining: std::slice::Iter<'static, &'static str>,
}

impl Iterator for Candidates {
    type Item = &'static str;

    fn next(&mut self) -> Option<Self::Item> {
        self.remaining.next().copied()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.remaining.size_hint()
    }
}

impl ExactSizeIterator for Candidates {}

pub fn candidates(domain: Domain) -> Candidates {
    Candidates {
        remaining: domain.bindings().priority.iter(),
    }
}

/// Resolve from the mime and extension tables only
pub fn resolve_declared(
    domain: Domain,
    mime_type: Option<&str>,
    file_name: &str,
) -> Option<Resolution> {
    let bindings = domain.bindings();
    if let Some(backend) = mime_type.and_then(|mime| bindings.backend_for_mime(mime)) {
        debug!("{} resolved to {} by mime type", file_name, backend);
        return Some(Resolution::Mime(backend));
    }
    let backend = extension(file_name).and_then(|ext| bindings.backend_for_extension(&ext))?;
    debug!("{} resolved to {} by extension", file_name, backend);
    Some(Resolution::Extension(backend))
}

/// Resolve a backend, falling back to trial execution
///
/// `trial` is called with each candidate backend until one is accepted.
pub async fn resolve<F, Fut>(
    domain: Domain,
    mime_type: Option<&str>,
    file_name: &str,
    mut trial: F,
) -> Result<Resolution>
where
    F: FnMut(&'static str) -> Fut,
    Fut: Future<Output = TrialOutcome>,
{
    if let Some(resolution) = resolve_declared(domain, mime_type, file_name) {
        return Ok(resolution);
    }

    info!("No declared {} backend for {}, trying candidates", domain, file_name);
    for backend in candidates(domain) {
        match trial(backend).await {
            TrialOutcome::Accepted(result) => {
                info!("{} accepted by {} backend", file_name, backend);
                return Ok(Resolution::Trial { backend, result });
            }
            TrialOutcome::Rejected { reason } => {
                debug!("{} rejected {}: {}", backend, file_name, reason);
            }
        }
    }

    Err(BridgeError::FormatNotFound {
        file_name: file_name.to_string(),
    })
}
