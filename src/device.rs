//! Device identity derived from the hardware address

use anyhow::{anyhow, Context, Result};
use std::fs;

use crate::config::DeviceConfig;

/// Resolve the device id: explicit override, else prefix + MAC of the interface
pub fn resolve_device_id(config: &DeviceConfig) -> Result<String> {
    if let Some(id) = config.id.as_deref().filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }

    let path = format!("/sys/class/net/{}/address", config.interface);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read hardware address from {path}"))?;
    let mac = parse_mac(&raw)?;

    Ok(format_device_id(&config.id_prefix, &mac))
}

/// `<prefix>` followed by the 48-bit address as 12 uppercase hex characters
pub fn format_device_id(prefix: &str, mac: &[u8; 6]) -> String {
    format!("{prefix}{}", hex::encode_upper(mac))
}

/// Parse `aa:bb:cc:dd:ee:ff` (or `-` separated)
pub fn parse_mac(s: &str) -> Result<[u8; 6]> {
    let parts: Vec<&str> = s.trim().split([':', '-']).collect();
    if parts.len() != 6 {
        return Err(anyhow!("Malformed hardware address: {:?}", s.trim()));
    }

    let mut mac = [0u8; 6];
    for (byte, part) in mac.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| anyhow!("Malformed hardware address: {:?}", s.trim()))?;
    }
    Ok(mac)
}
