//! Entity domains a remote can drive

/// Domains offered when choosing entities for a remote.
///
/// Sensors and other read-only domains are left out: the remote only exposes
/// entities it can send commands to.
pub static REMOTE_CONTROL_DOMAINS: &[&str] = &[
    "button",
    "climate",
    "cover",
    "input_boolean",
    "light",
    "media_player",
    "remote",
    "scene",
    "script",
    "switch",
];

/// Check whether an entity domain belongs to the remote-control allow-list
pub fn is_remote_control_domain(domain: &str) -> bool {
    REMOTE_CONTROL_DOMAINS.contains(&domain)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allow_list() {
        assert!(is_remote_control_domain("media_player"));
        assert!(is_remote_control_domain("script"));
        assert!(!is_remote_control_domain("sensor"));
        assert!(!is_remote_control_domain("binary_sensor"));
    }
}
