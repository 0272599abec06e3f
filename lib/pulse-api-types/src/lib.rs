//! Basic API types used by the Pulse control plane.

use proxmox_schema::{ApiStringFormat, Schema, StringSchema};

pub use proxmox_config_digest::ConfigDigest;

pub use proxmox_schema::api_types::SAFE_ID_FORMAT as PULSE_SAFE_ID_FORMAT;
pub use proxmox_schema::api_types::SAFE_ID_REGEX as PULSE_SAFE_ID_REGEX;
pub use proxmox_schema::api_types::SAFE_ID_REGEX_STR as PULSE_SAFE_ID_REGEX_STR;

pub use proxmox_schema::api_types::{CERT_FINGERPRINT_SHA256_SCHEMA, FINGERPRINT_SHA256_FORMAT};
pub use proxmox_schema::api_types::{CIDR_FORMAT, CIDR_REGEX};
pub use proxmox_schema::api_types::{DNS_NAME_OR_IP_REGEX, DNS_NAME_REGEX};
pub use proxmox_schema::api_types::{HTTP_URL_REGEX, HTTP_URL_SCHEMA};
pub use proxmox_schema::api_types::{IP_FORMAT, IP_REGEX, IP_V4_REGEX, IP_V6_REGEX};

mod nodes;
pub use nodes::*;

mod register;
pub use register::*;

mod system;
pub use system::*;

mod proxy;
pub use proxy::*;

pub const ORG_ID_SCHEMA: Schema = StringSchema::new("Tenant (organization) identifier.")
    .format(&PULSE_SAFE_ID_FORMAT)
    .min_length(1)
    .max_length(64)
    .schema();

/// The tenant every request without an explicit organization falls back to.
pub const DEFAULT_ORG_ID: &str = "default";

pub const NODE_KEY_SCHEMA: Schema = StringSchema::new("Stable node instance key.")
    .format(&PULSE_SAFE_ID_FORMAT)
    .min_length(2)
    .max_length(64)
    .schema();

pub const NODE_NAME_SCHEMA: Schema =
    StringSchema::new("Display name of a node instance, unique within its type.")
        .min_length(1)
        .max_length(128)
        .schema();

pub const HOST_SCHEMA: Schema =
    StringSchema::new("Host of a node instance (IP, hostname or URL; normalized on write).")
        .min_length(1)
        .max_length(256)
        .schema();

pub const SETUP_CODE_SCHEMA: Schema =
    StringSchema::new("One-time setup code embedded in a generated setup script URL.")
        .format(&ApiStringFormat::Pattern(&SETUP_CODE_REGEX))
        .schema();

proxmox_schema::const_regex! {
    // six characters from the unambiguous A-Z2-9 alphabet
    pub SETUP_CODE_REGEX = r"^[A-HJ-NP-Z2-9]{6}$";
}

/// Wire id (`<type>-<index>`) of a node within the per-type list.
///
/// Positional, so only valid until the next mutating operation.
pub fn wire_node_id(ty: NodeType, index: usize) -> String {
    format!("{ty}-{index}")
}

/// Split a wire id back into its type and list index.
pub fn parse_wire_node_id(id: &str) -> Option<(NodeType, usize)> {
    let (ty, index) = id.split_once('-')?;
    Some((ty.parse().ok()?, index.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_ids_round_trip() {
        assert_eq!(wire_node_id(NodeType::Pve, 0), "pve-0");
        assert_eq!(
            parse_wire_node_id("pbs-17"),
            Some((NodeType::Pbs, 17usize))
        );
        assert_eq!(parse_wire_node_id("pve"), None);
        assert_eq!(parse_wire_node_id("qemu-1"), None);
    }
}
