/// Default path prefix the API is mounted under.
pub const DEFAULT_API_PREFIX: &str = "/api";

/// Map a generated entry path to the URL the preview is served from.
///
/// `None` or an empty path yields `None`. Leading slashes on the path and
/// trailing slashes on the prefix are dropped before joining.
pub fn build_preview_url(api_prefix: &str, project_id: &str, relative: Option<&str>) -> Option<String> {
    let path = relative?.trim_start_matches('/');
    if path.is_empty() {
        return None;
    }
    Some(format!(
        "{}/projects/{}/preview/{}",
        api_prefix.trim_end_matches('/'),
        project_id,
        path
    ))
}
