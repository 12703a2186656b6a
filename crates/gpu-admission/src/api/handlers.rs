use std::sync::Arc;

use poem::handler;
use poem::web::Data;
use poem::web::Json;
use tracing::debug;

use crate::api::types::ExtenderArgs;
use crate::api::types::ExtenderFilterResult;
use crate::api::types::HostPriority;
use crate::scheduling::filter::FILTER_NAME;
use crate::scheduling::GpuFilter;

/// Filter predicate route. A body that fails to decode is not a transport
/// error: the extender contract expects a 200 with the `Error` field set.
#[handler]
pub async fn filter_predicates(
    filter: Data<&Arc<GpuFilter>>,
    body: String,
) -> Json<ExtenderFilterResult> {
    let result = match serde_json::from_str::<ExtenderArgs>(&body) {
        Ok(args) => {
            debug!(
                pod = args
                    .pod
                    .as_ref()
                    .and_then(|p| p.metadata.name.as_deref())
                    .unwrap_or_default(),
                "{FILTER_NAME}: filter request"
            );
            filter.filter(args).await
        }
        Err(e) => ExtenderFilterResult::with_error(e.to_string()),
    };
    Json(result)
}

/// Priority route: prefer CPU-only nodes over GPU nodes.
#[handler]
pub async fn prioritize_nodes(
    filter: Data<&Arc<GpuFilter>>,
    body: String,
) -> poem::Result<Json<Vec<HostPriority>>> {
    let args = serde_json::from_str::<ExtenderArgs>(&body).map_err(|e| {
        poem::Error::from_string(e.to_string(), poem::http::StatusCode::BAD_REQUEST)
    })?;
    Ok(Json(filter.prioritize(&args)))
}

/// Report build identity.
#[handler]
pub fn version() -> String {
    utils::version::VERSION.clone()
}

/// Liveness probe for the debug listener.
#[handler]
pub fn healthz() -> &'static str {
    "ok"
}
