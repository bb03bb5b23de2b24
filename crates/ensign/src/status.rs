use std::time::Duration;

use chrono::Utc;
use ensign_api::v1beta1::{service_state, HealthCheck, ServiceState};

use crate::server::Node;

/// Clients should not check the status again before this interval has passed.
pub const NOT_BEFORE: Duration = Duration::from_secs(60);

/// Clients should check the status again before this interval has passed.
pub const NOT_AFTER: Duration = Duration::from_secs(60 * 60);

/// Report the state of the node. Always answers, including in maintenance mode.
pub fn status(node: &Node, req: &HealthCheck) -> ServiceState {
    tracing::trace!(attempts = req.attempts, "status check");

    let status = if node.maintenance() {
        service_state::Status::Maintenance
    } else {
        service_state::Status::Healthy
    };

    let now = Utc::now();
    let window = |offset: Duration| {
        let offset = chrono::Duration::from_std(offset).unwrap_or_default();
        ensign_api::from_datetime(now + offset)
    };

    let uptime = node.uptime();
    ServiceState {
        status: status as i32,
        version: crate::VERSION.to_string(),
        uptime: Some(prost_types::Duration {
            seconds: uptime.as_secs() as i64,
            nanos: uptime.subsec_nanos() as i32,
        }),
        not_before: Some(window(NOT_BEFORE)),
        not_after: Some(window(NOT_AFTER)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::server::tests::node_with;

    #[tokio::test]
    async fn test_status() {
        let node = node_with(Config::default());
        let state = status(&node, &HealthCheck::default());
        assert_eq!(state.status(), service_state::Status::Healthy);
        assert_eq!(state.version, crate::VERSION);
        assert!(state.uptime.is_some());

        let not_before = state.not_before.unwrap();
        let not_after = state.not_after.unwrap();
        assert_eq!(not_after.seconds - not_before.seconds, 59 * 60);
        assert!(not_before.seconds > Utc::now().timestamp());
    }

    #[tokio::test]
    async fn test_status_maintenance() {
        let node = node_with(Config {
            maintenance: true,
            ..Default::default()
        });
        let state = status(&node, &HealthCheck::default());
        assert_eq!(state.status(), service_state::Status::Maintenance);
    }
}
