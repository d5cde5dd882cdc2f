use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

use crate::meeting_id::generate_meeting_id;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    rooms: usize,
    connections: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingIdResponse {
    pub meeting_id: String,
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        rooms: state.registry.room_count(),
        connections: state.registry.connection_count(),
    })
}

pub async fn new_meeting_id() -> Json<MeetingIdResponse> {
    Json(MeetingIdResponse {
        meeting_id: generate_meeting_id(),
    })
}

pub async fn render_metrics(State(state): State<AppState>) -> Response {
    match state.metrics.as_ref() {
        Some(handle) => handle.render().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use crate::{router, AppState};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    async fn get_json(uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router(AppState::new())
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[test_timeout::tokio_timeout_test]
    async fn meeting_id_endpoint_returns_token() {
        let (status, body) = get_json("/api/meeting-id").await;
        assert_eq!(status, StatusCode::OK);
        let id = body["meetingId"].as_str().unwrap();
        assert_eq!(id.len(), 8);
    }

    #[test_timeout::tokio_timeout_test]
    async fn health_reports_empty_registry() {
        let (status, body) = get_json("/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["rooms"], 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn metrics_without_recorder_is_not_found() {
        let (status, _) = get_json("/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
