use crate::error::{Error, Result};

/// Longest tenant name that still yields a TAP device name within the
/// 15-char Linux IFNAMSIZ limit ("tap-" prefix + name).
pub const MAX_TENANT_NAME_LEN: usize = 11;

/// Validate a tenant name: DNS label, lowercase alphanumeric + hyphens,
/// no leading/trailing hyphen, short enough for the derived TAP name.
pub fn validate_tenant_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_TENANT_NAME_LEN {
        return Err(Error::ValidationFailed(format!(
            "tenant name must be 1-{} characters, got {}",
            MAX_TENANT_NAME_LEN,
            name.len()
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
    {
        return Err(Error::ValidationFailed(format!(
            "tenant name must be lowercase alphanumeric + hyphens: {:?}",
            name
        )));
    }
    if name.starts_with('-') || name.ends_with('-') {
        return Err(Error::ValidationFailed(format!(
            "tenant name must not start or end with a hyphen: {:?}",
            name
        )));
    }
    Ok(())
}

/// TAP device name for a tenant.
pub fn tap_name(name: &str) -> String {
    format!("tap-{}", name)
}

/// Vsock context id for an allocated uid. CIDs 0-2 are reserved by the
/// vsock spec, so the first tenant lands on CID 3.
pub fn cid_for_uid(uid: u32, uid_start: u32) -> u32 {
    uid - uid_start + 3
}

/// Host/guest address pair for tenant index `idx` (uid - uid_start).
///
/// Each tenant gets an aligned /30 inside 10.231.0.0/16: block base is
/// `idx * 4`, host side takes .base+1, guest side .base+2.
pub fn address_pair(idx: u32) -> (String, String) {
    let base = idx * 4;
    let octet3 = (base / 256) % 256;
    let host = base % 256 + 1;
    (
        format!("10.231.{}.{}", octet3, host),
        format!("10.231.{}.{}", octet3, host + 1),
    )
}

/// Deterministic locally-administered MAC for the guest NIC.
pub fn mac_address(idx: u32) -> String {
    let hi = (idx >> 8) as u8;
    let lo = idx as u8;
    format!("02:cb:{:02x}:{:02x}:00:02", hi, lo)
}

/// Random shared secret authenticating host RPC to the in-guest agent.
pub fn generate_agent_token() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
