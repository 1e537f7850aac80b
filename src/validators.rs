//! Input validation for vpnguard
//!
//! Centralised checks for everything that crosses the exported boundary:
//! phonebook device names (the syntax check behind `InvalidName`), remote
//! hostnames, and the display name stamped onto filter objects.

use crate::core::error::{Error, Result};

/// Characters a phonebook entry name may never contain
const FORBIDDEN_NAME_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];

/// Maximum phonebook entry name length accepted by the dial subsystem
pub const MAX_DEVICE_NAME_LEN: usize = 256;

/// Validates a dial-up device (phonebook entry) name.
///
/// A valid name is non-empty, at most [`MAX_DEVICE_NAME_LEN`] characters,
/// contains at least one alphanumeric character, and carries no control or
/// path-reserved characters.
///
/// # Errors
///
/// Returns [`Error::InvalidName`] describing the offending name.
pub fn validate_device_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(Error::InvalidName(name.to_string()));
    }
    if name.chars().count() > MAX_DEVICE_NAME_LEN {
        return Err(Error::InvalidName(name.to_string()));
    }
    if name
        .chars()
        .any(|c| c.is_control() || FORBIDDEN_NAME_CHARS.contains(&c))
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    if !name.chars().any(char::is_alphanumeric) {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Validates a remote hostname (DNS name or IP literal).
///
/// # Errors
///
/// Returns `Err` with a human-readable reason on malformed input.
pub fn validate_hostname(host: &str) -> std::result::Result<(), String> {
    if host.is_empty() {
        return Err("Hostname must not be empty".to_string());
    }
    if host.len() > 253 {
        return Err("Hostname too long (max 253 characters)".to_string());
    }
    if host.parse::<std::net::IpAddr>().is_ok() {
        return Ok(());
    }
    for label in host.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(format!("Invalid hostname label {label:?}"));
        }
        if label.starts_with('-') || label.ends_with('-') {
            return Err(format!("Hostname label {label:?} starts or ends with '-'"));
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(format!("Hostname label {label:?} contains invalid characters"));
        }
    }
    Ok(())
}

/// Sanitizes a display name for filter objects.
///
/// Keeps ASCII alphanumerics and a small punctuation set, capped at 64
/// characters, so engine tooling renders it predictably.
pub fn sanitize_display_name(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | '(' | ')'))
        .take(64)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_device_names() {
        validate_device_name("Acme VPN").unwrap();
        validate_device_name("vpn-ikev2_01").unwrap();
        validate_device_name("Büro VPN").unwrap();
    }

    #[test]
    fn test_invalid_device_names() {
        assert!(validate_device_name("").is_err());
        assert!(validate_device_name("   ").is_err());
        assert!(validate_device_name("...").is_err());
        assert!(validate_device_name("bad\\name").is_err());
        assert!(validate_device_name("bad:name").is_err());
        assert!(validate_device_name("bad|name").is_err());
        assert!(validate_device_name("bad\nname").is_err());
        let long = "x".repeat(MAX_DEVICE_NAME_LEN + 1);
        assert!(validate_device_name(&long).is_err());
    }

    #[test]
    fn test_hostname_accepts_ip_literals() {
        validate_hostname("203.0.113.9").unwrap();
        validate_hostname("2001:db8::1").unwrap();
    }

    #[test]
    fn test_hostname_rejects_bad_labels() {
        assert!(validate_hostname("").is_err());
        assert!(validate_hostname("exa_mple.com").is_err());
        assert!(validate_hostname("-example.com").is_err());
        assert!(validate_hostname("example..com").is_err());
        validate_hostname("vpn.example.com").unwrap();
    }

    #[test]
    fn test_sanitize_display_name() {
        assert_eq!(sanitize_display_name("Acme VPN (IKEv2)"), "Acme VPN (IKEv2)");
        let dirty = "Acme\"VPN\n<script>";
        let clean = sanitize_display_name(dirty);
        assert!(!clean.contains('"'));
        assert!(!clean.contains('\n'));
        assert!(!clean.contains('<'));
    }
}
