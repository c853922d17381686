//! Namespace path composition and service specification parsing
//!
//! Grammar: `root[/stack]/flavor/name/address:port`. Every segment is literal
//! except the final one, which carries the network identity of an instance.

use std::collections::BTreeMap;

use crate::error::{DiscoveryError, Result};

pub const SEPARATOR: char = '/';

/// Parse `"http:80,guide:10004"` into `flavor -> port`.
///
/// A repeated flavor keeps the last port.
pub fn parse_service_spec(spec: &str) -> Result<BTreeMap<String, u16>> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(DiscoveryError::MalformedSpec("No services found.".to_string()));
    }

    let mut services = BTreeMap::new();
    for entry in spec.split(',') {
        let entry = entry.trim();
        let Some((name, port)) = entry.split_once(':') else {
            return Err(DiscoveryError::MalformedSpec(format!(
                "No name or port defined in '{entry}'."
            )));
        };

        let name = name.trim();
        if name.is_empty() {
            return Err(DiscoveryError::MalformedSpec(format!(
                "Empty service name in '{entry}'."
            )));
        }
        if name.contains(SEPARATOR) {
            return Err(DiscoveryError::MalformedSpec(format!(
                "Service name '{name}' contains '{SEPARATOR}'."
            )));
        }

        let port: u16 = port.trim().parse().map_err(|_| {
            DiscoveryError::MalformedSpec(format!("Invalid port in '{entry}'."))
        })?;

        services.insert(name.to_string(), port);
    }

    Ok(services)
}

/// Join segments into an absolute path.
///
/// Empty segments are skipped and repeated separators collapse, so
/// `join_path(["/root/", "", "a//b"])` is `/root/a/b`. No segments yield `/`.
pub fn join_path<I, S>(segments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut path = String::new();
    for segment in segments {
        for part in segment.as_ref().split(SEPARATOR).filter(|p| !p.is_empty()) {
            path.push(SEPARATOR);
            path.push_str(part);
        }
    }
    if path.is_empty() {
        path.push(SEPARATOR);
    }
    path
}

/// Full paths of the given child names under `parent`, in the given order.
pub fn split_immediate_children(parent: &str, children: &[String]) -> Vec<String> {
    children
        .iter()
        .map(|child| join_path([parent, child.as_str()]))
        .collect()
}

/// Last segment of a path (`""` for the root).
pub fn last_segment(path: &str) -> &str {
    path.rsplit(SEPARATOR).next().unwrap_or("")
}

/// Directory holding a flavor registry: everything before the last segment.
pub fn directory_of_registry(registry: &str) -> &str {
    match registry.rfind(SEPARATOR) {
        Some(0) | None => "/",
        Some(idx) => &registry[..idx],
    }
}

/// Reject a literal segment that would change the tree shape.
pub fn validate_segment(kind: &str, segment: &str) -> Result<()> {
    if segment.is_empty() || segment.contains(SEPARATOR) {
        return Err(DiscoveryError::InvalidPath(format!(
            "{kind} segment '{segment}' must be non-empty and must not contain '{SEPARATOR}'"
        )));
    }
    Ok(())
}

/// Directory a registration lives in: `root[/stack]`.
pub fn directory_path(root: &str, stack: Option<&str>) -> String {
    join_path([root, stack.unwrap_or("")])
}

/// Base path of a per-flavor registry: `directory/flavor`.
pub fn registry_path(directory: &str, flavor: &str) -> String {
    join_path([directory, flavor])
}

/// Identity segment `address:port`.
pub fn instance_id(address: &str, port: u16) -> String {
    format!("{address}:{port}")
}

/// Split an `address:port` segment. IPv6 addresses keep their inner colons.
pub fn parse_instance_id(id: &str) -> Option<(&str, u16)> {
    let (address, port) = id.rsplit_once(':')?;
    if address.is_empty() {
        return None;
    }
    Some((address, port.parse().ok()?))
}

/// Full key of an instance: `directory/flavor/name/address:port`.
pub fn instance_path(directory: &str, flavor: &str, name: &str, address: &str, port: u16) -> String {
    join_path([directory, flavor, name, instance_id(address, port).as_str()])
}
