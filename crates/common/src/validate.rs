//! Input validation
//!
//! Everything that ends up on a `nebula-cert` command line or in a
//! certificate record passes through here first:
//! - certificate, device and config names: 1-100 chars of `[A-Za-z0-9._-]`
//! - overlay addresses: IPv4 with an explicit prefix (`10.42.0.5/24`)
//! - unsafe-route subnets: IPv4 CIDRs
//! - groups: 1-64 chars of `[A-Za-z0-9._-]`
//!
//! Account fields (username, email, password policy) live here as well.

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

const NAME_MAX_LEN: usize = 100;
const GROUP_MAX_LEN: usize = 64;
const USERNAME_MIN_LEN: usize = 3;
const USERNAME_MAX_LEN: usize = 50;
const EMAIL_MAX_LEN: usize = 254;

const SPECIAL_CHARS: &str = "!@#$%^&*(),.?\":{}|<>";

/// Validation error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Empty { field: &'static str },
    TooShort { field: &'static str, min: usize, got: usize },
    TooLong { field: &'static str, max: usize, got: usize },
    InvalidCharacter { field: &'static str, position: usize, char: char },
    LeadingSeparator { field: &'static str },
    MissingPrefix { value: String },
    InvalidCidr { value: String, reason: String },
    ReservedAddress { value: String },
    InvalidEmail { value: String },
    WeakPassword { rule: &'static str },
    InvalidDuration { hours: i64, max: i64 },
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty { field } => write!(f, "{} must not be empty", field),
            Self::TooShort { field, min, got } => {
                write!(f, "{} must be at least {} characters (got {})", field, min, got)
            }
            Self::TooLong { field, max, got } => {
                write!(f, "{} must be at most {} characters (got {})", field, max, got)
            }
            Self::InvalidCharacter { field, position, char } => write!(
                f,
                "Invalid character '{}' at position {} in {}. Only letters, digits, '.', '_' and '-' are allowed.",
                char, position, field
            ),
            Self::LeadingSeparator { field } => {
                write!(f, "{} cannot start with '.' or '-'", field)
            }
            Self::MissingPrefix { value } => write!(
                f,
                "'{}' is missing a prefix length, expected a.b.c.d/nn",
                value
            ),
            Self::InvalidCidr { value, reason } => {
                write!(f, "'{}' is not a valid IPv4 CIDR: {}", value, reason)
            }
            Self::ReservedAddress { value } => write!(
                f,
                "'{}' is the network or broadcast address of its subnet",
                value
            ),
            Self::InvalidEmail { value } => write!(f, "'{}' is not a valid email address", value),
            Self::WeakPassword { rule } => write!(f, "Password {}", rule),
            Self::InvalidDuration { hours, max } => write!(
                f,
                "Duration must be between 1 and {} hours (got {})",
                max, hours
            ),
        }
    }
}

impl std::error::Error for ValidationError {}

fn check_charset(field: &'static str, value: &str) -> Result<(), ValidationError> {
    for (position, c) in value.chars().enumerate() {
        if !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-') {
            return Err(ValidationError::InvalidCharacter { field, position, char: c });
        }
    }
    Ok(())
}

/// Validate a certificate, device or config name.
///
/// Returns the trimmed name.
pub fn validate_name(field: &'static str, name: &str) -> Result<String, ValidationError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ValidationError::Empty { field });
    }
    let len = name.chars().count();
    if len > NAME_MAX_LEN {
        return Err(ValidationError::TooLong { field, max: NAME_MAX_LEN, got: len });
    }
    check_charset(field, name)?;
    if name.starts_with('.') || name.starts_with('-') {
        return Err(ValidationError::LeadingSeparator { field });
    }
    Ok(name.to_string())
}

fn parse_cidr(value: &str) -> Result<Ipv4Network, ValidationError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Empty { field: "ip_address" });
    }
    if !value.contains('/') {
        return Err(ValidationError::MissingPrefix { value: value.to_string() });
    }
    value.parse::<Ipv4Network>().map_err(|e| ValidationError::InvalidCidr {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Validate the overlay address of a host certificate (`a.b.c.d/nn`).
///
/// The address keeps its host bits; the prefix describes the overlay network.
pub fn validate_nebula_ip(value: &str) -> Result<Ipv4Network, ValidationError> {
    let net = parse_cidr(value)?;
    if net.prefix() < 31 && (net.ip() == net.network() || net.ip() == net.broadcast()) {
        return Err(ValidationError::ReservedAddress { value: value.trim().to_string() });
    }
    Ok(net)
}

/// Validate an unsafe-route subnet. Host bits must be zero.
pub fn validate_subnet(value: &str) -> Result<Ipv4Network, ValidationError> {
    let net = parse_cidr(value)?;
    if net.ip() != net.network() {
        return Err(ValidationError::InvalidCidr {
            value: value.trim().to_string(),
            reason: format!("host bits set, did you mean {}/{}", net.network(), net.prefix()),
        });
    }
    Ok(net)
}

/// Validate and deduplicate a group list, keeping first-seen order.
pub fn normalize_groups(groups: &[String]) -> Result<Vec<String>, ValidationError> {
    let mut out: Vec<String> = Vec::with_capacity(groups.len());
    for group in groups {
        let group = group.trim();
        if group.is_empty() {
            return Err(ValidationError::Empty { field: "group" });
        }
        let len = group.chars().count();
        if len > GROUP_MAX_LEN {
            return Err(ValidationError::TooLong { field: "group", max: GROUP_MAX_LEN, got: len });
        }
        check_charset("group", group)?;
        if !out.iter().any(|g| g == group) {
            out.push(group.to_string());
        }
    }
    Ok(out)
}

/// Validate a username. Returns the trimmed value.
pub fn validate_username(username: &str) -> Result<String, ValidationError> {
    let username = username.trim();
    let len = username.chars().count();
    if len < USERNAME_MIN_LEN {
        return Err(ValidationError::TooShort { field: "username", min: USERNAME_MIN_LEN, got: len });
    }
    if len > USERNAME_MAX_LEN {
        return Err(ValidationError::TooLong { field: "username", max: USERNAME_MAX_LEN, got: len });
    }
    check_charset("username", username)?;
    Ok(username.to_string())
}

/// Minimal structural email check. Returns the lowercased address.
pub fn validate_email(email: &str) -> Result<String, ValidationError> {
    let email = email.trim().to_lowercase();
    let invalid = || ValidationError::InvalidEmail { value: email.clone() };
    if email.len() > EMAIL_MAX_LEN || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|l| l.is_empty()) {
        return Err(invalid());
    }
    Ok(email)
}

/// Validate a certificate lifetime in hours.
pub fn validate_duration_hours(hours: i64, max: i64) -> Result<i64, ValidationError> {
    if hours < 1 || hours > max {
        return Err(ValidationError::InvalidDuration { hours, max });
    }
    Ok(hours)
}

/// Password strength rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_uppercase: bool,
    pub require_lowercase: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: 8,
            require_uppercase: true,
            require_lowercase: true,
            require_digit: true,
            require_special: true,
        }
    }
}

impl PasswordPolicy {
    /// Check a password, reporting the first rule it breaks.
    pub fn check(&self, password: &str) -> Result<(), ValidationError> {
        if password.chars().count() < self.min_length {
            return Err(ValidationError::WeakPassword {
                rule: "is shorter than the minimum length",
            });
        }
        if self.require_uppercase && !password.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ValidationError::WeakPassword {
                rule: "must contain at least one uppercase letter",
            });
        }
        if self.require_lowercase && !password.chars().any(|c| c.is_ascii_lowercase()) {
            return Err(ValidationError::WeakPassword {
                rule: "must contain at least one lowercase letter",
            });
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            return Err(ValidationError::WeakPassword {
                rule: "must contain at least one digit",
            });
        }
        if self.require_special && !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
            return Err(ValidationError::WeakPassword {
                rule: "must contain at least one special character",
            });
        }
        Ok(())
    }
}

/// Hosts usable for automatic address assignment, skipping the first
/// `offset` addresses of the network and the broadcast address.
pub fn assignable_hosts(network: Ipv4Network, offset: u32) -> impl Iterator<Item = Ipv4Addr> {
    let base = u32::from(network.network());
    let last = u32::from(network.broadcast());
    let start = base.saturating_add(offset.max(1));
    (start..last).map(Ipv4Addr::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert_eq!(validate_name("name", "laptop-01").unwrap(), "laptop-01");
        assert_eq!(validate_name("name", "  ca.example_org ").unwrap(), "ca.example_org");
    }

    #[test]
    fn test_name_rejects_shell_metacharacters() {
        assert!(matches!(
            validate_name("name", "host;rm"),
            Err(ValidationError::InvalidCharacter { position: 4, char: ';', .. })
        ));
        assert!(matches!(
            validate_name("name", "a b"),
            Err(ValidationError::InvalidCharacter { position: 1, char: ' ', .. })
        ));
        assert!(matches!(
            validate_name("name", "-flag"),
            Err(ValidationError::LeadingSeparator { .. })
        ));
        assert!(matches!(validate_name("name", "   "), Err(ValidationError::Empty { .. })));
    }

    #[test]
    fn test_name_length() {
        assert!(validate_name("name", &"a".repeat(100)).is_ok());
        assert!(matches!(
            validate_name("name", &"a".repeat(101)),
            Err(ValidationError::TooLong { max: 100, got: 101, .. })
        ));
    }

    #[test]
    fn test_nebula_ip() {
        let net = validate_nebula_ip("192.168.100.10/24").unwrap();
        assert_eq!(net.ip(), Ipv4Addr::new(192, 168, 100, 10));
        assert_eq!(net.prefix(), 24);

        assert!(matches!(
            validate_nebula_ip("192.168.100.10"),
            Err(ValidationError::MissingPrefix { .. })
        ));
        assert!(matches!(
            validate_nebula_ip("192.168.100.300/24"),
            Err(ValidationError::InvalidCidr { .. })
        ));
        assert!(matches!(
            validate_nebula_ip("10.0.0.1/33"),
            Err(ValidationError::InvalidCidr { .. })
        ));
        assert!(matches!(
            validate_nebula_ip("not-an-ip/24"),
            Err(ValidationError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_nebula_ip_rejects_network_and_broadcast() {
        assert!(matches!(
            validate_nebula_ip("10.1.0.0/16"),
            Err(ValidationError::ReservedAddress { .. })
        ));
        assert!(matches!(
            validate_nebula_ip("10.1.255.255/16"),
            Err(ValidationError::ReservedAddress { .. })
        ));
        assert!(validate_nebula_ip("10.1.0.1/32").is_ok());
    }

    #[test]
    fn test_subnet_requires_zero_host_bits() {
        assert!(validate_subnet("10.20.0.0/16").is_ok());
        assert!(matches!(
            validate_subnet("10.20.1.0/16"),
            Err(ValidationError::InvalidCidr { .. })
        ));
    }

    #[test]
    fn test_groups_deduplicated_in_order() {
        let groups = vec!["laptops".to_string(), "ops".to_string(), "laptops".to_string()];
        assert_eq!(normalize_groups(&groups).unwrap(), vec!["laptops", "ops"]);
        assert!(normalize_groups(&["a,b".to_string()]).is_err());
        assert!(normalize_groups(&[" ".to_string()]).is_err());
    }

    #[test]
    fn test_username() {
        assert_eq!(validate_username("alice").unwrap(), "alice");
        assert!(matches!(
            validate_username("al"),
            Err(ValidationError::TooShort { min: 3, got: 2, .. })
        ));
        assert!(validate_username(&"a".repeat(51)).is_err());
        assert!(validate_username("alice@home").is_err());
    }

    #[test]
    fn test_email() {
        assert_eq!(validate_email("Alice@Example.org").unwrap(), "alice@example.org");
        assert!(validate_email("alice").is_err());
        assert!(validate_email("alice@localhost").is_err());
        assert!(validate_email("@example.org").is_err());
        assert!(validate_email("a@b@example.org").is_err());
        assert!(validate_email("a b@example.org").is_err());
    }

    #[test]
    fn test_password_policy() {
        let policy = PasswordPolicy::default();
        assert!(policy.check("Str0ng!pass").is_ok());
        assert!(policy.check("Sh0rt!").is_err());
        assert!(policy.check("nouppercase1!").is_err());
        assert!(policy.check("NOLOWERCASE1!").is_err());
        assert!(policy.check("NoDigits!!").is_err());
        assert!(policy.check("NoSpecial123").is_err());

        let relaxed = PasswordPolicy {
            min_length: 4,
            require_uppercase: false,
            require_lowercase: false,
            require_digit: false,
            require_special: false,
        };
        assert!(relaxed.check("abcd").is_ok());
    }

    #[test]
    fn test_duration() {
        assert_eq!(validate_duration_hours(8760, 87600).unwrap(), 8760);
        assert!(validate_duration_hours(0, 87600).is_err());
        assert!(validate_duration_hours(87601, 87600).is_err());
    }

    #[test]
    fn test_assignable_hosts() {
        let net: Ipv4Network = "192.168.100.0/24".parse().unwrap();
        let hosts: Vec<Ipv4Addr> = assignable_hosts(net, 10).collect();
        assert_eq!(hosts.first(), Some(&Ipv4Addr::new(192, 168, 100, 10)));
        assert_eq!(hosts.last(), Some(&Ipv4Addr::new(192, 168, 100, 254)));
        assert_eq!(hosts.len(), 245);
    }
}
