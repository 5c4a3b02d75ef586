//! Response compression policy.
//!
//! Actual encoding and `Accept-Encoding` negotiation are done by actix's
//! `Compress` middleware; the crate's enabled compress features (brotli,
//! gzip, deflate) bound what it may pick. This module owns the policy side:
//! when a response is exempt (too small, or a content type not worth
//! compressing). Exempt responses get `Content-Encoding: identity` stamped
//! before the compressor sees them, which tells it to pass the body through
//! untouched.

use crate::models::settings::CompressionSettings;

/// Whether a response should bypass compression entirely.
pub fn exempt(settings: &CompressionSettings, content_type: Option<&str>, body_len: usize) -> bool {
    if !settings.enabled {
        return true;
    }
    if body_len < settings.threshold {
        return true;
    }
    match content_type {
        Some(ct) => !settings
            .content_types
            .iter()
            .any(|prefix| ct.starts_with(prefix.as_str())),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> CompressionSettings {
        CompressionSettings::default()
    }

    #[test]
    fn small_bodies_are_exempt() {
        let s = settings();
        assert!(exempt(&s, Some("application/json"), 10));
        assert!(!exempt(&s, Some("application/json"), 4096));
    }

    #[test]
    fn threshold_boundary_is_inclusive() {
        let s = settings();
        assert!(exempt(&s, Some("text/html"), s.threshold - 1));
        assert!(!exempt(&s, Some("text/html"), s.threshold));
    }

    #[test]
    fn non_matching_content_types_are_exempt() {
        let s = settings();
        assert!(exempt(&s, Some("image/png"), 1 << 20));
        assert!(exempt(&s, None, 1 << 20));
        assert!(!exempt(&s, Some("text/css"), 1 << 20));
    }

    #[test]
    fn disabled_compression_exempts_everything() {
        let mut s = settings();
        s.enabled = false;
        assert!(exempt(&s, Some("text/html"), 1 << 20));
    }
}
