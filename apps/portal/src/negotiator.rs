use http::{Method, StatusCode};
use tracing::debug;

use crate::{
    context::ClientDeclaration,
    error::PortalError,
    pipeline::{Pipeline, PreparedRequest, RedirectPolicy},
};

const PROBE_REDIRECT_LIMIT: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    NoWorkerDeclared,
    Outdated { declared: u32 },
    Current,
}

impl WorkerState {
    pub fn of(declaration: &ClientDeclaration, expected: u32) -> Self {
        match declaration.version {
            None => Self::NoWorkerDeclared,
            Some(version) if version == expected => Self::Current,
            Some(declared) => Self::Outdated { declared },
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Negotiation {
    /// Serve the worker install page instead of the resource.
    Bootstrap,
    Proxy,
}

/// Decides whether the request can be proxied as is.
///
/// Without a declared worker, `probe` (a body-less copy of the outbound request) is sent as
/// `HEAD`, retried as `GET` when the remote rejects `HEAD`, and only HTML documents get the
/// install page. A missing probe means the request cannot be replayed and is proxied.
pub async fn negotiate(
    state: WorkerState,
    pipeline: &Pipeline<'_>,
    probe: Option<PreparedRequest>,
) -> Result<Negotiation, PortalError> {
    match state {
        WorkerState::Current => Ok(Negotiation::Proxy),
        WorkerState::Outdated { declared } => {
            debug!(declared, "worker protocol is outdated");
            Ok(Negotiation::Bootstrap)
        }
        WorkerState::NoWorkerDeclared => match probe {
            Some(request) => sniff(pipeline, request).await,
            None => Ok(Negotiation::Proxy),
        },
    }
}

async fn sniff(pipeline: &Pipeline<'_>, mut request: PreparedRequest) -> Result<Negotiation, PortalError> {
    let fallback = request.try_clone();
    request.method = Method::HEAD;
    let mut head = pipeline
        .send(request, RedirectPolicy::Follow(PROBE_REDIRECT_LIMIT))
        .await?;

    if matches!(
        head.status,
        StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
    ) && let Some(mut get) = fallback
    {
        get.method = Method::GET;
        // Only the headers matter; the body is dropped unread.
        head = pipeline
            .send(get, RedirectPolicy::Follow(PROBE_REDIRECT_LIMIT))
            .await?;
    }

    let head = match head.error_for_status() {
        Ok(head) => head,
        Err(err) => {
            debug!(%err, "probe failed; proxying without a worker");
            return Ok(Negotiation::Proxy);
        }
    };
    if head.is_html() {
        debug!(url = %head.url, "document needs a worker");
        Ok(Negotiation::Bootstrap)
    } else {
        Ok(Negotiation::Proxy)
    }
}
