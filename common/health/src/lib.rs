use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

/// Health reporting for the long-running loops of a service.
///
/// Every consumer loop registers itself as a component and must keep reporting
/// before its deadline. The process is healthy only when at least one component
/// is registered and every registered component is healthy:
///   - a component that never reported is `Starting`, which fails the check,
///   - a component that reported `Unhealthy` fails the check,
///   - a component whose last healthy report is older than its deadline is
///     `Stalled`, which fails the check.
///
/// Liveness and readiness should each get their own registry.
#[derive(Default, Debug)]
pub struct HealthStatus {
    pub healthy: bool,
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    fn into_response(self) -> Response {
        let body = format!("{:?}", self);
        let code = if self.healthy {
            StatusCode::OK
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };
        (code, body).into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Set on registration, until the first report.
    Starting,
    /// Healthy, must report again before the given instant.
    HealthyUntil(OffsetDateTime),
    Unhealthy,
    /// Computed when a `HealthyUntil` deadline has passed.
    Stalled,
}

type Components = Arc<RwLock<HashMap<String, ComponentStatus>>>;

/// Handle given to a single component so it can report its own status.
#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    components: Components,
}

impl HealthHandle {
    /// Must be called more often than the deadline the component was registered with.
    pub fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            OffsetDateTime::now_utc().add(self.deadline),
        ))
    }

    pub fn report_status(&self, status: ComponentStatus) {
        match self.components.write() {
            Ok(mut map) => {
                map.insert(self.component.clone(), status);
            }
            Err(_) => warn!(component = %self.component, "poisoned health registry lock"),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Components,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            components: Default::default(),
        }
    }

    /// Registers a component in `Starting` state and returns the handle it reports through.
    pub fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            components: self.components.clone(),
        };
        handle.report_status(ComponentStatus::Starting);
        handle
    }

    /// Overall status of the process. Usable directly as an axum handler body.
    pub fn get_status(&self) -> HealthStatus {
        let Ok(components) = self.components.read() else {
            warn!("{} health check failed: poisoned registry lock", self.name);
            return HealthStatus::default();
        };

        let now = OffsetDateTime::now_utc();
        let mut status = HealthStatus {
            healthy: !components.is_empty(),
            components: HashMap::with_capacity(components.len()),
        };

        for (name, component) in components.iter() {
            let current = match component {
                ComponentStatus::HealthyUntil(until) if *until > now => component.clone(),
                ComponentStatus::HealthyUntil(_) => ComponentStatus::Stalled,
                other => other.clone(),
            };
            if !matches!(current, ComponentStatus::HealthyUntil(_)) {
                status.healthy = false;
            }
            status.components.insert(name.clone(), current);
        }

        if status.healthy {
            debug!("{} health check ok", self.name);
        } else {
            debug!("{} health check failed: {:?}", self.name, status.components);
        }
        status
    }
}
