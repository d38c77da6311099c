//! Registry URL and image path normalization.

/// Strip any protocol prefix and trailing slashes from a registry URL.
pub fn sanitize_registry_url(registry: &str) -> String {
    registry
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

/// Collapse double slashes and strip the trailing slash from an image path.
pub fn sanitize_image_path(path: &str) -> String {
    path.replace("//", "/").trim_end_matches('/').to_string()
}

/// Combine registry and image name into a registry reference.
pub fn build_image_reference(registry: &str, image_name: &str) -> String {
    let registry = sanitize_registry_url(registry);
    let image_name = sanitize_image_path(image_name);
    if registry.is_empty() {
        image_name
    } else {
        format!("{registry}/{image_name}")
    }
}
