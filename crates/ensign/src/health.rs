//! Serving state of the node as reported by the `grpc.health.v1` probe service, the
//! `/readyz` endpoint and the `Status` RPC.

use ensign_api::health::v1::{health_check_response::ServingStatus, HealthCheckRequest, HealthCheckResponse};
use tokio::sync::watch;
use tonic::Status;

use crate::context::{Context, ENSIGN_SERVICE};
use crate::streams::Outbound;

/// The serving status shared by the default service and the Ensign service.
#[derive(Debug)]
pub struct HealthState {
    tx: watch::Sender<ServingStatus>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ServingStatus::NotServing);
        Self { tx }
    }

    pub fn set(&self, status: ServingStatus) {
        let prev = self.tx.send_replace(status);
        if prev != status {
            tracing::debug!(status = status.as_str_name(), "health status changed");
        }
    }

    pub fn serving(&self) {
        self.set(ServingStatus::Serving);
    }

    pub fn not_serving(&self) {
        self.set(ServingStatus::NotServing);
    }

    pub fn status(&self) -> ServingStatus {
        *self.tx.borrow()
    }

    pub fn is_serving(&self) -> bool {
        self.status() == ServingStatus::Serving
    }

    pub fn subscribe(&self) -> watch::Receiver<ServingStatus> {
        self.tx.subscribe()
    }
}

/// The empty service name refers to the overall health of the node.
pub fn known_service(service: &str) -> bool {
    service.is_empty() || service == ENSIGN_SERVICE
}

fn response(status: ServingStatus) -> HealthCheckResponse {
    HealthCheckResponse {
        status: status as i32,
    }
}

pub fn check(state: &HealthState, req: HealthCheckRequest) -> Result<HealthCheckResponse, Status> {
    if !known_service(&req.service) {
        return Err(Status::not_found(format!("unknown service {:?}", req.service)));
    }
    Ok(response(state.status()))
}

/// Stream the current status and every change until the client goes away. Unknown
/// services report `SERVICE_UNKNOWN` once and the stream stays open.
pub async fn watch(
    state: &HealthState,
    ctx: &Context,
    req: HealthCheckRequest,
    outbound: Outbound<HealthCheckResponse>,
) -> Result<(), Status> {
    let cancel = ctx.cancel_token();

    if !known_service(&req.service) {
        outbound.send(response(ServingStatus::ServiceUnknown)).await?;
        cancel.cancelled().await;
        return Ok(());
    }

    let mut rx = state.subscribe();
    loop {
        let status = *rx.borrow_and_update();
        if outbound.send(response(status)).await.is_err() {
            return Ok(());
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            changed = rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
            }
        }
    }
}
