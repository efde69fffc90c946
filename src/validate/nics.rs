use std::net::Ipv4Addr;

use crate::config::{AssociationConfig, ControlConfig};
use crate::error::ValidationReport;
use crate::lease::{LeaseTracker, is_valid_mac};
use crate::request::{ConfigurationMode, Nic, NicCertificate, Requested};

use super::split_list;

/// Linux IFNAMSIZ minus the terminating NUL.
const MAX_IFNAME: usize = 15;
const MAX_NICS: usize = 8;

const SHORT_FIELDS: usize = 5;
const LONG_FIELDS: usize = 15;

/// Class-based `(netmask, broadcast)` guess for `ip`.
pub fn class_defaults(ip: Ipv4Addr) -> (Ipv4Addr, Ipv4Addr) {
    let first = ip.octets()[0];
    let mask: u32 = if first < 128 {
        0xFF00_0000
    } else if first < 192 {
        0xFFFF_0000
    } else {
        0xFFFF_FF00
    };
    let broadcast = u32::from(ip) | !mask;
    (Ipv4Addr::from(mask), Ipv4Addr::from(broadcast))
}

/// The association's `(netmask, broadcast)` when they describe a network
/// that contains `ip`. A missing broadcast is derived from the netmask.
fn association_network(ip: Ipv4Addr, assoc: &AssociationConfig) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let mask = u32::from(assoc.netmask?);
    let expected = u32::from(ip) | !mask;
    let broadcast = assoc.broadcast.map_or(expected, u32::from);
    (broadcast == expected).then(|| (Ipv4Addr::from(mask), Ipv4Addr::from(broadcast)))
}

/// Fill the addressing fields left as `null`. Netmask and broadcast come from
/// the association when its network contains the ip, otherwise from the
/// ip's class. Needs a concrete ip.
pub fn apply_address_defaults(nic: &mut Nic, assoc: &AssociationConfig) {
    let Some(ip) = nic.ip_value() else {
        return;
    };
    let (mask, broadcast) = association_network(ip, assoc).unwrap_or_else(|| class_defaults(ip));
    nic.netmask = nic.netmask.or(Some(mask));
    nic.broadcast = nic.broadcast.or(Some(broadcast));
    nic.gateway = nic.gateway.or(assoc.gateway);
    nic.dns = nic.dns.or(assoc.dns);
}

pub(super) fn resolve(
    networking: Option<&str>,
    vm_name: &str,
    config: &ControlConfig,
    macs: &LeaseTracker,
    ips: &LeaseTracker,
    report: &mut ValidationReport,
) -> Vec<Nic> {
    let Some(networking) = networking else {
        report.ok("no networking requested");
        return Vec::new();
    };
    let items = split_list(networking);
    if items.is_empty() {
        report.ok("no networking requested");
        return Vec::new();
    }
    if items.len() > MAX_NICS {
        report.error(format!(
            "{} NICs requested, at most {MAX_NICS} are supported",
            items.len()
        ));
        return Vec::new();
    }

    let nics: Vec<Nic> = items
        .iter()
        .enumerate()
        .filter_map(|(i, item)| parse_nic(i, item, vm_name, config, macs, ips, report))
        .collect();

    for (i, nic) in nics.iter().enumerate() {
        let earlier = &nics[..i];
        if earlier.iter().any(|n| n.name == nic.name) {
            report.error(format!("NIC name '{}' is used more than once", nic.name));
        }
        if let Some(mac) = nic.mac_value() {
            if earlier.iter().any(|n| n.mac_value() == Some(mac)) {
                report.error(format!("MAC {mac} is requested more than once"));
            }
        }
        if let Some(ip) = nic.ip_value() {
            if earlier.iter().any(|n| n.ip_value() == Some(ip)) {
                report.error(format!("IP {ip} is requested more than once"));
            }
        }
    }
    nics
}

/// `null` (or an empty field) means "not given".
fn optional(field: &str) -> Option<&str> {
    let field = field.trim();
    (!field.is_empty() && !field.eq_ignore_ascii_case("null")).then_some(field)
}

fn parse_addr(
    index: usize,
    what: &str,
    field: &str,
    report: &mut ValidationReport,
) -> Result<Option<Ipv4Addr>, ()> {
    match optional(field) {
        None => Ok(None),
        Some(text) => text.parse().map(Some).map_err(|_| {
            report.error(format!("NIC #{index}: {what} '{text}' is not a dotted quad"));
        }),
    }
}

fn valid_hostname(name: &str) -> bool {
    name.len() <= 253
        && name.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        })
}

fn parse_nic(
    index: usize,
    item: &str,
    vm_name: &str,
    config: &ControlConfig,
    macs: &LeaseTracker,
    ips: &LeaseTracker,
    report: &mut ValidationReport,
) -> Option<Nic> {
    let fields: Vec<&str> = item.split(';').map(str::trim).collect();
    if fields.len() != SHORT_FIELDS && fields.len() != LONG_FIELDS {
        report.error(format!(
            "NIC #{index}: expected {SHORT_FIELDS} or {LONG_FIELDS} fields, got {}",
            fields.len()
        ));
        return None;
    }

    let mut ok = true;
    let name = fields[0].to_string();
    if name.is_empty() {
        report.error(format!("NIC #{index}: empty name"));
        ok = false;
    }

    let association = fields[1].to_string();
    let assoc = config.association(&association);
    if assoc.is_none() {
        report.error(format!("NIC #{index}: unknown association '{association}'"));
        ok = false;
    }

    let mac = if fields[2].eq_ignore_ascii_case("ANY") {
        Requested::Any
    } else if !is_valid_mac(fields[2]) {
        report.error(format!("NIC #{index}: '{}' is not a valid MAC", fields[2]));
        ok = false;
        Requested::Any
    } else if let Some(owner) = macs.owner(fields[2]) {
        report.error(format!(
            "NIC #{index}: MAC {} is already leased to association '{owner}'",
            fields[2]
        ));
        ok = false;
        Requested::Any
    } else {
        Requested::Value(fields[2].to_ascii_uppercase())
    };

    if !fields[3].eq_ignore_ascii_case("BRIDGED") {
        report.error(format!(
            "NIC #{index}: network method '{}' is not supported (only BRIDGED)",
            fields[3]
        ));
        ok = false;
    }

    let configuration_mode = match fields[4].to_ascii_uppercase().as_str() {
        "INDEPENDENT" => ConfigurationMode::Independent,
        "STATIC" => ConfigurationMode::Static,
        other => {
            report.error(format!("NIC #{index}: unknown configuration mode '{other}'"));
            return None;
        }
    };

    let vif_name = format!("{vm_name}-{index}");
    if vif_name.len() > MAX_IFNAME {
        report.error(format!("NIC #{index}: interface name '{vif_name}' is too long"));
        ok = false;
    }

    let mut nic = Nic {
        name,
        association,
        mac,
        bridge: assoc.map(|a| a.bridge.clone()).unwrap_or_default(),
        dhcp_vif_name: vif_name.clone(),
        vif_name,
        configuration_mode,
        ip: None,
        gateway: None,
        broadcast: None,
        netmask: None,
        dns: None,
        hostname: None,
        certificate: None,
    };

    if fields.len() == LONG_FIELDS {
        ok &= parse_addressing(index, &fields, &mut nic, assoc, ips, report);
    } else if configuration_mode == ConfigurationMode::Static {
        report.error(format!(
            "NIC #{index}: STATIC configuration needs all {LONG_FIELDS} fields"
        ));
        ok = false;
    }

    if !ok {
        return None;
    }
    if let Some(assoc) = assoc {
        apply_address_defaults(&mut nic, assoc);
    }

    report.ok(format!(
        "NIC #{index}: {} on {} ({:?}) via {}",
        nic.name, nic.association, nic.configuration_mode, nic.vif_name
    ));
    Some(nic)
}

fn parse_addressing(
    index: usize,
    fields: &[&str],
    nic: &mut Nic,
    assoc: Option<&AssociationConfig>,
    ips: &LeaseTracker,
    report: &mut ValidationReport,
) -> bool {
    let mut ok = true;

    match optional(fields[5]) {
        None if nic.configuration_mode == ConfigurationMode::Static => {
            report.error(format!("NIC #{index}: STATIC configuration needs an ip"));
            ok = false;
        }
        None => {}
        Some(any) if any.eq_ignore_ascii_case("ANY") => {
            if assoc.is_some_and(|a| a.ip_range.is_none()) {
                report.error(format!(
                    "NIC #{index}: ip ANY requested but association '{}' has no ip_range",
                    nic.association
                ));
                ok = false;
            }
            nic.ip = Some(Requested::Any);
        }
        Some(text) => match text.parse::<Ipv4Addr>() {
            Ok(ip) => {
                if let Some(owner) = ips.owner(&ip.to_string()) {
                    report.error(format!(
                        "NIC #{index}: IP {ip} is already leased to association '{owner}'"
                    ));
                    ok = false;
                }
                nic.ip = Some(Requested::Value(ip));
            }
            Err(_) => {
                report.error(format!("NIC #{index}: ip '{text}' is not a dotted quad"));
                ok = false;
            }
        },
    }

    let addrs = [
        parse_addr(index, "gateway", fields[6], report),
        parse_addr(index, "broadcast", fields[7], report),
        parse_addr(index, "netmask", fields[8], report),
        parse_addr(index, "dns", fields[9], report),
    ];
    match addrs {
        [Ok(gateway), Ok(broadcast), Ok(netmask), Ok(dns)] => {
            nic.gateway = gateway;
            nic.broadcast = broadcast;
            nic.netmask = netmask;
            nic.dns = dns;
        }
        _ => ok = false,
    }

    if let Some(hostname) = optional(fields[10]) {
        if valid_hostname(hostname) {
            nic.hostname = Some(hostname.to_string());
        } else {
            report.error(format!("NIC #{index}: invalid hostname '{hostname}'"));
            ok = false;
        }
    }

    let cert: Vec<Option<&str>> = fields[11..15].iter().map(|f| optional(f)).collect();
    match cert.iter().filter(|c| c.is_some()).count() {
        0 => {}
        4 => {
            nic.certificate = Some(NicCertificate {
                certname: cert[0].unwrap_or_default().to_string(),
                keyname: cert[1].unwrap_or_default().to_string(),
                certpath: cert[2].unwrap_or_default().to_string(),
                keypath: cert[3].unwrap_or_default().to_string(),
            });
        }
        n => {
            report.error(format!(
                "NIC #{index}: certificate fields are all-or-nothing, {n} of 4 given"
            ));
            ok = false;
        }
    }

    ok
}
