//! Correlation-id generation.
//!
//! The runtime's design treats the identifier generator as an external
//! collaborator — any generator with a collision rate below 10⁻⁹ per invoke
//! family is acceptable. This module wraps `uuid`'s v4 generator (already a
//! dependency of the teacher this crate is descended from) rather than
//! inventing a bespoke short-id scheme.

use uuid::Uuid;

/// Generate a fresh correlation id (`invokeId`).
///
/// Encoded as the UUID's simple hex form (32 lowercase hex characters, no
/// hyphens) so it is safe to splice directly into derived descriptor ids
/// such as `"receive-<id>"`.
pub fn generate_invoke_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Generate a fresh remote-method stub tag with the given prefix.
///
/// Used by [`crate::remote_methods`] when registering a server-side handler
/// for a function value found in a request payload.
pub fn generate_stub_tag(prefix: &str) -> String {
    format!("{prefix}{}", Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoke_ids_are_unique_and_hyphen_free() {
        let a = generate_invoke_id();
        let b = generate_invoke_id();
        assert_ne!(a, b);
        assert!(!a.contains('-'));
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn stub_tags_carry_the_prefix() {
        let tag = generate_stub_tag("rpc-fn-");
        assert!(tag.starts_with("rpc-fn-"));
    }
}
