//! Address classification and diversity-grouping helpers.
//!
//! Small and self-contained: used by the SOCKS front listener (policy
//! checks on CONNECT targets) and the circuit manager (IP-diversity
//! grouping). Grounded directly in spec invariant 9's address list; no
//! teacher counterpart.

use std::net::IpAddr;

/// True if `addr` is a loopback, private, link-local, or (IPv6) unique
/// local address — the set of destinations the SOCKS front rejects with
/// reply-code 2 unless explicitly allowed.
pub fn is_disallowed_private(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => v6.is_loopback() || is_unique_local(v6) || is_unicast_link_local(v6),
    }
}

fn is_unique_local(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xfe00) == 0xfc00
}

fn is_unicast_link_local(addr: &std::net::Ipv6Addr) -> bool {
    (addr.segments()[0] & 0xffc0) == 0xfe80
}

/// Diversity-group key: IPv4 groups by /24, IPv6 by /48 (see DESIGN.md's
/// Open Question decision — the smallest prefix a typical residential or
/// hosting allocation is delegated at).
pub fn diversity_group_key(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let octets = v4.octets();
            format!("v4:{}.{}.{}.0/24", octets[0], octets[1], octets[2])
        }
        IpAddr::V6(v6) => {
            let segments = v6.segments();
            format!(
                "v6:{:x}:{:x}:{:x}::/48",
                segments[0], segments[1], segments[2]
            )
        }
    }
}

/// Validates a SOCKS5 domain-name address per spec §4.2: labels 1–63
/// chars, total length ≤253, LDH-only characters, non-numeric TLD.
pub fn is_valid_hostname(name: &str) -> bool {
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    let labels: Vec<&str> = name.split('.').collect();
    if labels.iter().any(|label| label.is_empty() || label.len() > 63) {
        return false;
    }

    if labels
        .iter()
        .any(|label| !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-'))
    {
        return false;
    }

    if let Some(tld) = labels.last() {
        if tld.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
    }

    true
}

/// Parses an exit-IP echo service's response body per spec §6: either a
/// `{"IP":"..."}` JSON object or a plain IPv4/IPv6 text body. Shared by the
/// management API's on-demand probe and the circuit manager's diversity
/// refresh so both accept exactly the same response shapes.
pub fn parse_exit_ip_body(body: &str) -> Option<String> {
    #[derive(serde::Deserialize)]
    struct ExitIpJson {
        #[serde(rename = "IP")]
        ip: String,
    }

    let trimmed = body.trim();
    if let Ok(parsed) = serde_json::from_str::<ExitIpJson>(trimmed) {
        return Some(parsed.ip);
    }
    if trimmed.parse::<IpAddr>().is_ok() {
        return Some(trimmed.to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn classifies_private_v4_ranges() {
        assert!(is_disallowed_private(&IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert!(is_disallowed_private(&IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert!(is_disallowed_private(&IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1))));
        assert!(is_disallowed_private(&IpAddr::V4(Ipv4Addr::new(169, 254, 0, 1))));
        assert!(!is_disallowed_private(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8))));
    }

    #[test]
    fn classifies_v6_unique_local_and_link_local() {
        let ula: Ipv6Addr = "fd00::1".parse().unwrap();
        let link_local: Ipv6Addr = "fe80::1".parse().unwrap();
        let public: Ipv6Addr = "2001:4860:4860::8888".parse().unwrap();

        assert!(is_disallowed_private(&IpAddr::V6(ula)));
        assert!(is_disallowed_private(&IpAddr::V6(link_local)));
        assert!(!is_disallowed_private(&IpAddr::V6(public)));
    }

    #[test]
    fn diversity_groups_share_a_v4_slash_24() {
        let a = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 5));
        let b = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 200));
        let c = IpAddr::V4(Ipv4Addr::new(203, 0, 114, 5));

        assert_eq!(diversity_group_key(&a), diversity_group_key(&b));
        assert_ne!(diversity_group_key(&a), diversity_group_key(&c));
    }

    #[test]
    fn diversity_groups_share_a_v6_slash_48() {
        let a: Ipv6Addr = "2001:db8:abcd:1::1".parse().unwrap();
        let b: Ipv6Addr = "2001:db8:abcd:2::1".parse().unwrap();
        let c: Ipv6Addr = "2001:db8:abce::1".parse().unwrap();

        assert_eq!(
            diversity_group_key(&IpAddr::V6(a)),
            diversity_group_key(&IpAddr::V6(b))
        );
        assert_ne!(
            diversity_group_key(&IpAddr::V6(a)),
            diversity_group_key(&IpAddr::V6(c))
        );
    }

    #[test]
    fn hostname_validation_rejects_numeric_tld_and_long_labels() {
        assert!(is_valid_hostname("example.com"));
        assert!(!is_valid_hostname("example.123"));
        assert!(!is_valid_hostname(""));
        assert!(!is_valid_hostname(&"a".repeat(64)));
        assert!(!is_valid_hostname("exa_mple.com"));
    }

    #[test]
    fn exit_ip_body_accepts_json_form() {
        assert_eq!(
            parse_exit_ip_body("{\"IP\":\"1.2.3.4\"}"),
            Some("1.2.3.4".to_string())
        );
    }

    #[test]
    fn exit_ip_body_accepts_plain_ipv4_and_ipv6() {
        assert_eq!(parse_exit_ip_body("203.0.113.9\n"), Some("203.0.113.9".to_string()));
        assert_eq!(parse_exit_ip_body("2001:db8::1"), Some("2001:db8::1".to_string()));
    }

    #[test]
    fn exit_ip_body_rejects_garbage() {
        assert_eq!(parse_exit_ip_body("not an ip"), None);
    }
}
