//! # Kernel Resources
//!
//! The endpoint handlers the kernel itself mounts:
//!
//! - **unix** (control socket only): `POST /1.0/control` to drive
//!   `start_api`, `DELETE /1.0/daemon` for graceful stop,
//!   `GET /1.0/ready`.
//! - **public**: `GET /1.0` server status.
//! - **internal** (trusted peers over mTLS, or the control socket):
//!   `POST /1.0/internal/cluster`, `DELETE /1.0/internal/cluster/<name>`,
//!   `PATCH /1.0/internal/database`,
//!   `POST /1.0/internal/hooks/newmember`.
//!
//! Internal handlers gate on the [`ConnectionInfo`] request extension:
//! a network caller must present a client certificate whose
//! fingerprint is in the trust store. There is no push from the store
//! to the handlers; every request re-queries the current snapshot.

use axum::extract::{Extension, RawQuery, State as AxumState};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use syndic_common::{
    ClusterMemberLocal, ControlPost, Envelope, HookNewMemberOptions, ServerStatus,
    DATABASE_VERSION_HEADER,
};
use tracing::info;

use super::router::{percent_decode, raw_trailing_segment};
use super::Resources;
use crate::endpoints::{ConnectionInfo, EndpointKind};
use crate::error::DaemonError;
use crate::state::State;
use crate::trust::{Location, Remote};

pub(crate) fn unix_resources() -> Resources {
    Resources::new("1.0", |state| {
        Router::new()
            .route("/1.0/control", post(control_post))
            .route("/1.0/daemon", delete(daemon_delete))
            .route("/1.0/ready", get(ready_get))
            .with_state(state)
    })
}

pub(crate) fn public_resources() -> Resources {
    Resources::new("1.0", |state| {
        Router::new()
            .route("/1.0", get(status_get))
            .with_state(state)
    })
}

pub(crate) fn internal_resources() -> Resources {
    Resources::new("1.0/internal", |state| {
        Router::new()
            .route("/1.0/internal/cluster", post(cluster_post))
            .route("/1.0/internal/cluster/*name", delete(cluster_delete))
            .route("/1.0/internal/database", patch(database_patch))
            .route("/1.0/internal/hooks/newmember", post(newmember_post))
            .with_state(state)
    })
}

// ════════════════════════════════════════════════════════════════════════════
// ACCESS CONTROL
// ════════════════════════════════════════════════════════════════════════════

/// Only local callers: the request must have arrived over the control
/// socket.
fn ensure_local(conn: &ConnectionInfo) -> Result<(), Envelope> {
    if conn.kind == EndpointKind::ControlSocket {
        Ok(())
    } else {
        Err(Envelope::error(
            StatusCode::FORBIDDEN,
            "only available on the local control socket",
        ))
    }
}

/// Local callers, or network callers presenting a member certificate.
fn ensure_trusted(state: &State, conn: &ConnectionInfo) -> Result<(), Envelope> {
    if conn.kind == EndpointKind::ControlSocket {
        return Ok(());
    }

    let Some(fingerprint) = conn.peer_fingerprint.as_deref() else {
        return Err(Envelope::error(
            StatusCode::FORBIDDEN,
            "no client certificate presented",
        ));
    };

    if state.remotes().contains_fingerprint(fingerprint) {
        Ok(())
    } else {
        Err(Envelope::error(
            StatusCode::FORBIDDEN,
            "certificate is not trusted by this member",
        ))
    }
}

fn failure(err: &DaemonError) -> Envelope {
    let status = match err {
        DaemonError::Unconfigured
        | DaemonError::Config(_)
        | DaemonError::AlreadyInitialized => StatusCode::BAD_REQUEST,
        DaemonError::NotRunning => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    Envelope::error(status, err.to_string())
}

// ════════════════════════════════════════════════════════════════════════════
// UNIX HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn control_post(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
    Json(body): Json<ControlPost>,
) -> Envelope {
    if let Err(denied) = ensure_local(&conn) {
        return denied;
    }

    let new_config = match (body.name, body.address) {
        (Some(name), Some(address)) => Some(Location { name, address }),
        (None, None) => None,
        _ => {
            return Envelope::error(
                StatusCode::BAD_REQUEST,
                "name and address must be supplied together",
            );
        }
    };

    match state
        .start_api(body.bootstrap, body.init_config, new_config, body.join_addresses)
        .await
    {
        Ok(()) => Envelope::empty_sync(),
        Err(err) => failure(&err),
    }
}

async fn daemon_delete(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
) -> Envelope {
    if let Err(denied) = ensure_local(&conn) {
        return denied;
    }

    info!("graceful shutdown requested over the control socket");
    let result = state.stop().await;
    let response = match &result {
        Ok(()) => Envelope::empty_sync(),
        Err(err) => failure(err),
    };

    // Hand the result to the run loop after the response is built; the
    // connection task survives listener teardown long enough to flush.
    state.post_shutdown(result);
    response
}

async fn ready_get(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
) -> Envelope {
    if let Err(denied) = ensure_local(&conn) {
        return denied;
    }

    if state.is_ready() {
        Envelope::empty_sync()
    } else {
        Envelope::unavailable("daemon is not ready yet")
    }
}

// ════════════════════════════════════════════════════════════════════════════
// PUBLIC HANDLERS
// ════════════════════════════════════════════════════════════════════════════

async fn status_get(AxumState(state): AxumState<State>) -> Envelope {
    Envelope::sync(&ServerStatus {
        name: state.name(),
        address: state.address(),
        ready: state.is_ready(),
        extensions: state.extensions().clone(),
    })
}

// ════════════════════════════════════════════════════════════════════════════
// INTERNAL HANDLERS
// ════════════════════════════════════════════════════════════════════════════

/// Records a member in the local trust store. During a join this is
/// the confirmation request: only the peer that already trusts the
/// joiner (the accepting leader) lets it through the gate, and its
/// replication layer propagates the entry onward.
async fn cluster_post(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
    Json(member): Json<ClusterMemberLocal>,
) -> Envelope {
    if let Err(denied) = ensure_trusted(&state, &conn) {
        return denied;
    }

    let remote = match Remote::try_from(&member) {
        Ok(remote) => remote,
        Err(err) => return Envelope::error(StatusCode::BAD_REQUEST, err.to_string()),
    };

    match state.trust().add(&remote) {
        Ok(()) => Envelope::empty_sync(),
        Err(err) => Envelope::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

/// Removes a member. The name segment is taken from the raw request
/// path so names containing `/` arrive intact, then decoded exactly
/// once.
async fn cluster_delete(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
    RawQuery(query): RawQuery,
    uri: Uri,
) -> Envelope {
    if let Err(denied) = ensure_trusted(&state, &conn) {
        return denied;
    }

    let Some(raw) = raw_trailing_segment(&uri, "/1.0/internal/cluster/") else {
        return Envelope::error(StatusCode::BAD_REQUEST, "missing member name");
    };
    let name = percent_decode(&raw);
    let force = query
        .as_deref()
        .map(|q| q.split('&').any(|pair| pair == "force=1"))
        .unwrap_or(false);

    if let Err(err) = state.dispatch_remove_hook(true, force).await {
        return failure(&err);
    }

    if let Err(err) = state.trust().remove(&name) {
        return Envelope::error(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
    }

    if let Err(err) = state.dispatch_remove_hook(false, force).await {
        return failure(&err);
    }

    Envelope::empty_sync()
}

/// Accepts a peer's replication wire-version announcement. The body is
/// empty; the version rides the `X-Dqlite-Version` header.
async fn database_patch(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
    headers: HeaderMap,
) -> Envelope {
    if let Err(denied) = ensure_trusted(&state, &conn) {
        return denied;
    }

    let version = headers
        .get(DATABASE_VERSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());

    match version {
        Some(version) => {
            info!(version, "peer announced database wire version");
            Envelope::empty_sync()
        }
        None => Envelope::error(
            StatusCode::BAD_REQUEST,
            format!("missing or invalid {DATABASE_VERSION_HEADER} header"),
        ),
    }
}

/// Runs the local `on_new_member` hook for a freshly-joined peer.
/// While this node is itself still coming up it answers 503, which
/// the joiner treats as skippable.
async fn newmember_post(
    AxumState(state): AxumState<State>,
    Extension(conn): Extension<ConnectionInfo>,
    Json(options): Json<HookNewMemberOptions>,
) -> Envelope {
    // Answered before the trust gate: a node that has not finished its
    // own join may not have synced the caller's trust entry yet, and
    // the caller needs the 503 (skippable) rather than a 403 (fatal).
    if !state.is_ready() {
        return Envelope::unavailable("daemon is still joining");
    }

    if let Err(denied) = ensure_trusted(&state, &conn) {
        return denied;
    }

    if options.name.is_empty() {
        return Envelope::error(StatusCode::BAD_REQUEST, "missing member name");
    }

    // Hook failures are logged, not surfaced; the joiner must not fail
    // its join because our callback misbehaved.
    state.dispatch_new_member(&options.name).await;
    Envelope::empty_sync()
}
