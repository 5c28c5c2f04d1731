use std::net::SocketAddr;

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
};
use serde_json::{Map, Value as JsonValue};

use crate::{
    dto::dispatch_dto::{HandlerResponse, InboundRequest},
    error::Result,
    AppState,
};

fn header_map(headers: &HeaderMap) -> std::collections::HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn query_map(uri: &Uri) -> Map<String, JsonValue> {
    uri.query()
        .map(|q| {
            url::form_urlencoded::parse(q.as_bytes())
                .map(|(k, v)| (k.into_owned(), JsonValue::String(v.into_owned())))
                .collect()
        })
        .unwrap_or_default()
}

/// Catch-all for operator-defined endpoints under `/api/custom/*`.
#[axum::debug_handler]
pub async fn handle(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    Path(rest): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let path = format!("custom/{}", rest.trim_matches('/'));

    let Some((endpoint, path_params)) = state.endpoints.resolve(method.as_str(), &path).await? else {
        let routes = state.endpoints.route_table().await?;
        let response = if routes.path_exists(&path) {
            HandlerResponse::error(405, "Method not allowed")
        } else {
            HandlerResponse::error(404, "Endpoint not found")
        };
        return Ok(response.into_response());
    };

    let request = InboundRequest {
        method: method.as_str().to_string(),
        path,
        headers: header_map(&headers),
        query: query_map(&uri),
        path_params,
        body,
        remote_addr: connect_info.map(|ConnectInfo(addr)| addr.ip()),
        ip_headers: state
            .settings
            .get_array("allowed_ip_headers")
            .await
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
    };

    tracing::debug!(
        endpoint_id = endpoint.id,
        method = %request.method,
        path = %request.path,
        "dispatching custom endpoint"
    );
    let response = state.dispatcher.dispatch(&request, &endpoint).await;
    Ok(response.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_strings_are_decoded() {
        let uri: Uri = "/api/custom/orders?a=1&b=two%20words".parse().unwrap();
        let query = query_map(&uri);
        assert_eq!(query["a"], "1");
        assert_eq!(query["b"], "two words");
    }

    #[test]
    fn header_names_are_lowercased() {
        let mut headers = HeaderMap::new();
        headers.insert("X-Api-Key", "k".parse().unwrap());
        assert_eq!(header_map(&headers)["x-api-key"], "k");
    }
}
