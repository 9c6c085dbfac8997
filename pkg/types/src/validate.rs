use anyhow::{Result, bail};

/// Validate a lock name.
/// Rules: non-empty, max 255 bytes, no trailing `/`, no control characters.
/// Nested names such as `jobs/nightly` are allowed.
pub fn validate_lock_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("lock name must not be empty");
    }
    if name.len() > 255 {
        bail!("lock name '{}' exceeds 255 bytes (got {})", name, name.len());
    }
    if name.ends_with('/') {
        bail!("lock name '{}' must not end with '/'", name);
    }
    if name.chars().any(|c| c.is_control()) {
        bail!("lock name '{}' must not contain control characters", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(validate_lock_name("mutex1").is_ok());
        assert!(validate_lock_name("jobs/nightly").is_ok());
        assert!(validate_lock_name("Upper_Case.lock").is_ok());
        assert!(validate_lock_name(&"a".repeat(255)).is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_lock_name("").is_err());
        assert!(validate_lock_name("trailing/").is_err());
        assert!(validate_lock_name("tab\there").is_err());
        assert!(validate_lock_name(&"a".repeat(256)).is_err());
    }
}
