//! Image reference normalization
//!
//! The same configuration field accepts registry references, local `.sif`
//! archives and fully-qualified transport URIs. Apptainer needs registry
//! references spelled as `docker://...`, so bare `user/repo:tag` forms get
//! the scheme prepended and everything else passes through.

/// Transport schemes Apptainer understands natively.
pub const TRANSPORT_SCHEMES: &[&str] = &["docker://", "library://", "oras://"];

/// Suffix of a local Singularity Image Format archive.
pub const SIF_SUFFIX: &str = ".sif";

/// Canonicalize an image identifier for `apptainer exec`.
///
/// An empty result means no image was configured.
pub fn normalize_image_reference(raw: Option<&str>) -> String {
    let image = match raw {
        Some(image) if !image.is_empty() => image,
        _ => return String::new(),
    };

    if TRANSPORT_SCHEMES
        .iter()
        .any(|scheme| image.starts_with(scheme))
    {
        return image.to_string();
    }

    if image.ends_with(SIF_SUFFIX) || image.starts_with('/') || image.starts_with('.') {
        return image.to_string();
    }

    if !image.contains("://") && image.contains('/') {
        return format!("docker://{image}");
    }

    image.to_string()
}

/// Pick the configured image: the runtime image wins over the base image.
pub fn select_image(runtime_image: Option<&str>, base_image: Option<&str>) -> String {
    let chosen = runtime_image
        .filter(|s| !s.is_empty())
        .or(base_image.filter(|s| !s.is_empty()));
    normalize_image_reference(chosen)
}
