pub mod devices_api;
pub mod documents_api;
pub mod viewer_api;

use crate::AppState;
use axum::{
    routing::{get, post},
    Router,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        // Documents
        .route(
            "/documents/:collection",
            get(documents_api::list_documents).post(documents_api::create_document),
        )
        .route(
            "/documents/:collection/:id",
            get(documents_api::get_document)
                .put(documents_api::put_document)
                .patch(documents_api::patch_document)
                .delete(documents_api::delete_document),
        )
        // Devices
        .route("/devices", post(devices_api::create_device))
        .route("/devices/status", get(devices_api::device_status))
}

pub fn viewer_routes() -> Router<AppState> {
    Router::new()
        .route("/viewer/menu/:menu_id", get(viewer_api::menu))
        .route("/viewer/:device_id/:digest", get(viewer_api::companion))
}
