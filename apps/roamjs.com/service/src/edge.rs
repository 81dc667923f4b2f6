use axum::extract::Request;
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;

const CACHE_IMMUTABLE_ONE_YEAR: &str = "public, max-age=31536000, immutable";
const CACHE_SHORT_LIVED: &str = "public, max-age=60";
const CACHE_MANIFEST: &str = "no-cache, no-store, must-revalidate";

/// Legacy URL schemes redirected at the edge. Longest prefix wins.
const LEGACY_PREFIX_REDIRECTS: &[(&str, &str)] = &[
    ("/docs/extensions/", "/extensions/"),
    ("/docs/", "/extensions/"),
    ("/services/", "/extensions/"),
];

#[must_use]
pub fn legacy_redirect(path: &str) -> Option<String> {
    LEGACY_PREFIX_REDIRECTS
        .iter()
        .find(|(prefix, _)| path.starts_with(prefix))
        .map(|(prefix, replacement)| {
            let rest = &path[prefix.len()..];
            format!("{replacement}{rest}")
        })
}

#[must_use]
pub fn cache_control_for_path(path: &str) -> Option<&'static str> {
    if path.ends_with(".js") || path.ends_with(".css") || path.ends_with(".woff2") {
        return Some(CACHE_IMMUTABLE_ONE_YEAR);
    }
    if path.ends_with("manifest.json") {
        return Some(CACHE_MANIFEST);
    }
    if path.ends_with(".md") || path.ends_with(".json") {
        return Some(CACHE_SHORT_LIVED);
    }
    None
}

#[must_use]
pub fn content_disposition_for_path(path: &str) -> Option<String> {
    if !(path.ends_with(".zip") || path.ends_with(".pdf")) {
        return None;
    }
    let filename = path.rsplit('/').next().unwrap_or(path);
    Some(format!("attachment; filename=\"{filename}\""))
}

/// Edge gate applied ahead of the router: 301s for legacy URL schemes and
/// suffix-based cache/disposition header injection on whatever the inner
/// handler produced.
pub async fn edge_gate(request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();

    if let Some(location) = legacy_redirect(&path) {
        if let Ok(location_value) = HeaderValue::from_str(&location) {
            let mut response = Response::new(axum::body::Body::empty());
            *response.status_mut() = StatusCode::MOVED_PERMANENTLY;
            response.headers_mut().insert(header::LOCATION, location_value);
            return response;
        }
    }

    let mut response = next.run(request).await;

    if let Some(cache_control) = cache_control_for_path(&path) {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(cache_control),
        );
    }

    if let Some(disposition) = content_disposition_for_path(&path) {
        if let Ok(value) = HeaderValue::from_str(&disposition) {
            response
                .headers_mut()
                .insert(header::CONTENT_DISPOSITION, value);
        }
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_doc_paths_redirect_to_extensions() {
        assert_eq!(
            legacy_redirect("/docs/extensions/query-builder"),
            Some("/extensions/query-builder".to_string())
        );
        assert_eq!(
            legacy_redirect("/services/static-site"),
            Some("/extensions/static-site".to_string())
        );
        assert_eq!(legacy_redirect("/extensions/query-builder"), None);
    }

    #[test]
    fn hashed_assets_are_immutable() {
        assert_eq!(
            cache_control_for_path("/assets/extension.abc123.js"),
            Some(CACHE_IMMUTABLE_ONE_YEAR)
        );
        assert_eq!(
            cache_control_for_path("/manifest.json"),
            Some(CACHE_MANIFEST)
        );
        assert_eq!(cache_control_for_path("/api/user"), None);
    }

    #[test]
    fn archives_are_served_as_attachments() {
        assert_eq!(
            content_disposition_for_path("/downloads/query-builder.zip"),
            Some("attachment; filename=\"query-builder.zip\"".to_string())
        );
        assert_eq!(content_disposition_for_path("/downloads/readme.md"), None);
    }
}
