use ulid::Ulid;

/// Generates a new ULID-based ID with the given prefix.
///
/// # Examples
/// ```
/// let id = relay_common::id::prefixed_ulid("ses");
/// assert!(id.starts_with("ses_"));
/// ```
pub fn prefixed_ulid(prefix: &str) -> String {
    format!("{}_{}", prefix, Ulid::new())
}

/// Marker trait for types that carry a prefixed ID.
pub trait PrefixedId {
    const PREFIX: &'static str;

    fn generate() -> String {
        prefixed_ulid(Self::PREFIX)
    }
}

/// Well-known ID prefixes.
pub mod prefix {
    /// One per accepted connection.
    pub const SESSION: &str = "ses";
}
