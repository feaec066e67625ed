//! Paid-access firewall command templates
//!
//! Fixed RouterOS command strings; interpolated values are escaped before
//! they reach the executor.

use crate::config::PaidAccessConfig;

/// Strip characters that would break out of a quoted RouterOS value
fn escape_value(value: &str) -> String {
    value
        .chars()
        .filter(|c| !matches!(c, '"' | '\\' | '\n' | '\r'))
        .collect::<String>()
        .trim()
        .to_string()
}

fn safe_order_id(order_id: &str) -> String {
    let escaped = escape_value(order_id);
    if escaped.is_empty() {
        "unknown".to_string()
    } else {
        escaped
    }
}

/// Commands that grant paid access for an ip/mac pair:
/// address-list entry, hotspot binding, stale host/session cleanup.
pub fn build_authorize_commands(
    config: &PaidAccessConfig,
    order_id: &str,
    ip: &str,
    mac: &str,
) -> Vec<String> {
    let comment = format!("pedido:{}", safe_order_id(order_id));
    let ip = escape_value(ip);
    let mac = escape_value(mac);
    vec![
        format!(
            "/ip firewall address-list add list={} address={} comment=\"{}\"",
            config.list_name, ip, comment
        ),
        format!(
            "/ip hotspot ip-binding add mac-address={} address={} type={} comment=\"{}\"",
            mac, ip, config.binding_type, comment
        ),
        format!("/ip hotspot host remove [find mac-address={}]", mac),
        format!("/ip hotspot active remove [find mac-address={}]", mac),
    ]
}

/// Inverse removals; ip and mac parts are independently optional.
pub fn build_revoke_commands(
    config: &PaidAccessConfig,
    ip: Option<&str>,
    mac: Option<&str>,
) -> Vec<String> {
    let mut commands = Vec::new();

    if let Some(ip) = ip.map(escape_value).filter(|s| !s.is_empty()) {
        commands.push(format!(
            "/ip firewall address-list remove [find list={} address={}]",
            config.list_name, ip
        ));
    }

    if let Some(mac) = mac.map(|m| escape_value(m)).filter(|s| !s.is_empty()) {
        commands.push(format!(
            "/ip hotspot ip-binding remove [find mac-address={}]",
            mac
        ));
        commands.push(format!("/ip hotspot active remove [find mac-address={}]", mac));
        commands.push(format!("/ip hotspot host remove [find mac-address={}]", mac));
    }

    commands
}

/// Uppercase and trim a MAC address
pub fn normalize_mac(mac: &str) -> Option<String> {
    let trimmed = mac.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Trim an IP address
pub fn normalize_ip(ip: &str) -> Option<String> {
    let trimmed = ip.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PaidAccessConfig {
        PaidAccessConfig::default()
    }

    #[test]
    fn test_authorize_commands() {
        let cmds = build_authorize_commands(&config(), "P1", "10.0.0.5", "AA:BB:CC:DD:EE:FF");
        assert_eq!(cmds.len(), 4);
        assert_eq!(
            cmds[0],
            "/ip firewall address-list add list=paid_clients address=10.0.0.5 comment=\"pedido:P1\""
        );
        assert!(cmds[1].contains("type=bypassed"));
        assert!(cmds[2].contains("host remove"));
        assert!(cmds[3].contains("active remove"));
    }

    #[test]
    fn test_revoke_commands_partial_identity() {
        let ip_only = build_revoke_commands(&config(), Some("10.0.0.5"), None);
        assert_eq!(ip_only.len(), 1);
        assert!(ip_only[0].contains("address-list remove"));

        let mac_only = build_revoke_commands(&config(), None, Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(mac_only.len(), 3);

        let both = build_revoke_commands(&config(), Some("10.0.0.5"), Some("AA:BB:CC:DD:EE:FF"));
        assert_eq!(both.len(), 4);
    }

    #[test]
    fn test_escaping_strips_quotes() {
        let cmds = build_authorize_commands(&config(), "P\"1", "10.0.0.5", "AA:BB:CC:DD:EE:FF");
        assert!(cmds[0].contains("pedido:P1"));
        assert!(!cmds[0].contains("P\"1"));
    }

    #[test]
    fn test_normalizers() {
        assert_eq!(
            normalize_mac(" aa:bb:cc:dd:ee:ff "),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(normalize_mac("  "), None);
        assert_eq!(normalize_ip(" 10.0.0.5 "), Some("10.0.0.5".to_string()));
        assert_eq!(normalize_ip(""), None);
    }
}
