//! OpenAPI documentation and schema generation
//!
//! This module defines the OpenAPI specification for the media-broker HTTP API
//! using utoipa for compile-time spec generation.

use utoipa::OpenApi;

/// OpenAPI documentation for the media-broker HTTP API
///
/// The spec can be accessed via:
/// - `/openapi.json` - JSON format OpenAPI specification
/// - `/swagger-ui` - Interactive Swagger UI documentation (when enabled)
#[derive(OpenApi)]
#[openapi(
    info(
        title = "media-broker HTTP API",
        version = "0.1.0",
        description = "Fetches remote media with an external tool after admission control and streams the result back as a file download",
        license(
            name = "MIT OR Apache-2.0"
        )
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development server")
    ),
    paths(
        crate::api::routes::fetch_media,

        crate::api::routes::health_check,
        crate::api::routes::openapi_spec,
        crate::api::routes::event_stream,
    ),
    components(
        schemas(
            crate::error::ApiError,
            crate::error::ErrorDetail,
        )
    ),
    tags(
        (name = "fetch", description = "Media fetch and download"),
        (name = "system", description = "Health, events, and API documentation"),
    )
)]
pub struct ApiDoc;
