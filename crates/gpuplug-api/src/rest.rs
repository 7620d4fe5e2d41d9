//! REST API handlers

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use gpuplug_core::{DeviceStatus, Health, PluginError};
use gpuplug_rm::ResourceManager;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

/// Application state shared across handlers
pub struct AppState {
    pub managers: Vec<ResourceManager>,
}

impl AppState {
    /// Find a manager by full resource name or by the part after the prefix
    fn manager(&self, name: &str) -> Result<&ResourceManager, PluginError> {
        self.managers
            .iter()
            .find(|rm| rm.resource().as_str() == name)
            .or_else(|| self.managers.iter().find(|rm| rm.resource().split().1 == name))
            .ok_or_else(|| PluginError::ResourceNotFound(name.to_string()))
    }
}

/// Create the API router
pub fn create_router(managers: Vec<ResourceManager>) -> Router {
    let state = Arc::new(AppState { managers });

    Router::new()
        .route("/api/v1/resources", get(list_resources))
        .route("/api/v1/resources/:name/devices", get(get_devices))
        .route(
            "/api/v1/resources/:name/preferred-allocation",
            post(preferred_allocation),
        )
        .route("/api/v1/status", get(get_status))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn error_response(err: PluginError) -> (StatusCode, String) {
    let status = match err {
        PluginError::ResourceNotFound(_) => StatusCode::NOT_FOUND,
        PluginError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, err.to_string())
}

/// Response for a resource pool
#[derive(Debug, Serialize, Deserialize)]
pub struct ResourceResponse {
    pub name: String,
    pub devices: usize,
    pub healthy: usize,
}

impl From<&ResourceManager> for ResourceResponse {
    fn from(rm: &ResourceManager) -> Self {
        Self {
            name: rm.resource().to_string(),
            devices: rm.devices().len(),
            healthy: rm.healthy_devices().len(),
        }
    }
}

/// List all resource pools
async fn list_resources(State(state): State<Arc<AppState>>) -> Json<Vec<ResourceResponse>> {
    Json(state.managers.iter().map(ResourceResponse::from).collect())
}

/// List the devices of a resource pool
async fn get_devices(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<DeviceStatus>>, (StatusCode, String)> {
    let rm = state.manager(&name).map_err(error_response)?;
    Ok(Json(rm.devices().iter().map(|d| d.status()).collect()))
}

/// Request for a preferred allocation
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocationRequest {
    /// Candidate device ids
    pub available: Vec<String>,
    /// Device ids that must be part of the result
    #[serde(default)]
    pub required: Vec<String>,
    /// Number of devices to allocate
    pub size: usize,
}

/// Preferred allocation result
#[derive(Debug, Serialize, Deserialize)]
pub struct AllocationResponse {
    pub devices: Vec<String>,
}

/// Compute a preferred allocation
async fn preferred_allocation(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Json(req): Json<AllocationRequest>,
) -> Result<Json<AllocationResponse>, (StatusCode, String)> {
    debug!(
        resource = %name,
        available = req.available.len(),
        required = req.required.len(),
        size = req.size,
        "Preferred allocation requested"
    );

    let rm = state.manager(&name).map_err(error_response)?;
    let devices = rm
        .get_preferred_allocation(&req.available, &req.required, req.size)
        .map_err(|e| {
            info!(resource = %rm.resource(), error = %e, "Rejected allocation request");
            error_response(e.into())
        })?;

    Ok(Json(AllocationResponse { devices }))
}

/// System status response
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub resources: usize,
    pub devices: usize,
    pub unhealthy: usize,
}

/// Get system status
async fn get_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let devices = state.managers.iter().flat_map(|rm| rm.devices().iter());
    let (total, unhealthy) = devices.fold((0, 0), |(total, unhealthy), d| {
        let bad = usize::from(d.health() == Health::Unhealthy);
        (total + 1, unhealthy + bad)
    });

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION").to_string(),
        resources: state.managers.len(),
        devices: total,
        unhealthy,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use gpuplug_core::{Device, Devices, HealthConfig, ResourceName};
    use gpuplug_nvml::MockDeviceLib;
    use tower::ServiceExt;

    fn router() -> (Router, Devices) {
        let devices = Devices::from(
            (0..4)
                .map(|i| Device::gpu(format!("GPU-{}", i), i, "Tesla T4"))
                .collect::<Vec<_>>(),
        );
        let rm = ResourceManager::new(
            ResourceName::new("gpu").unwrap(),
            devices.clone(),
            Arc::new(MockDeviceLib::new()),
            HealthConfig::default(),
        );
        (create_router(vec![rm]), devices)
    }

    async fn body_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn allocation_request(name: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/api/v1/resources/{}/preferred-allocation", name))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_list_resources() {
        let (router, devices) = router();
        devices.get("GPU-3").unwrap().mark_unhealthy();

        let response = router
            .oneshot(Request::get("/api/v1/resources").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let resources: Vec<ResourceResponse> = body_json(response).await;
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "nvidia.com/gpu");
        assert_eq!(resources[0].devices, 4);
        assert_eq!(resources[0].healthy, 3);
    }

    #[tokio::test]
    async fn test_get_devices_by_short_and_encoded_name() {
        let (router, _) = router();

        let response = router
            .clone()
            .oneshot(Request::get("/api/v1/resources/gpu/devices").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let devices: Vec<DeviceStatus> = body_json(response).await;
        assert_eq!(devices.len(), 4);
        assert_eq!(devices[1].index, "1");

        let response = router
            .oneshot(
                Request::get("/api/v1/resources/nvidia.com%2Fgpu/devices")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preferred_allocation() {
        let (router, _) = router();
        let request = allocation_request(
            "gpu",
            serde_json::json!({
                "available": ["GPU-0", "GPU-1", "GPU-2", "GPU-3"],
                "required": ["GPU-2"],
                "size": 2
            }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let allocation: AllocationResponse = body_json(response).await;
        assert_eq!(allocation.devices, vec!["GPU-2", "GPU-0"]);
    }

    #[tokio::test]
    async fn test_preferred_allocation_invalid_request() {
        let (router, _) = router();
        let request = allocation_request(
            "gpu",
            serde_json::json!({ "available": ["GPU-0"], "size": 2 }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_unknown_resource() {
        let (router, _) = router();
        let request = allocation_request(
            "mig-1g.5gb",
            serde_json::json!({ "available": [], "size": 0 }),
        );

        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status() {
        let (router, _) = router();

        let response = router
            .oneshot(Request::get("/api/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status: StatusResponse = body_json(response).await;
        assert_eq!(status.resources, 1);
        assert_eq!(status.devices, 4);
        assert_eq!(status.unhealthy, 0);
    }
}
