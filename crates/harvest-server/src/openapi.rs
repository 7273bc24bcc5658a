use utoipa::OpenApi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Harvest API",
        version = "0.1.0",
        description = "Control surface for the rate-limited market data collection scheduler."
    ),
    paths(
        crate::routes::get_scheduler,
        crate::routes::trigger_collection,
        crate::routes::reset_scheduler,
        crate::routes::list_breakers,
        crate::routes::reset_breaker,
        crate::routes::health,
    ),
    components(schemas(
        crate::dto::SchedulerStatusResponse,
        crate::dto::CycleReportResponse,
        crate::dto::TriggerResponse,
        crate::dto::BreakerResponse,
        crate::dto::BreakerListResponse,
        crate::dto::HealthResponse,
        crate::dto::ErrorResponse,
    )),
    tags(
        (name = "scheduler", description = "Scheduler status and operator commands"),
        (name = "breakers", description = "Per-endpoint circuit breakers"),
        (name = "system", description = "Health and system status"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

/// Adds Bearer token security scheme to the OpenAPI spec.
struct SecurityAddon;

impl utoipa::Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                utoipa::openapi::security::SecurityScheme::Http(
                    utoipa::openapi::security::HttpBuilder::new()
                        .scheme(utoipa::openapi::security::HttpAuthScheme::Bearer)
                        .bearer_format("token")
                        .description(Some(
                            "Admin token. Set via HARVEST_ADMIN_TOKEN environment variable.",
                        ))
                        .build(),
                ),
            );
        }
    }
}
