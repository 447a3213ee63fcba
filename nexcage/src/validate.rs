//! Identifier validators.

use crate::{Error, Result};

/// Maximum container id length, per the data model.
pub const ID_MAX_LEN: usize = 253;

/// Validates a caller-supplied container id: `[A-Za-z0-9_.-]`, length 1–253.
///
/// `.` and `..` pass the charset but would be hostile as file names, so they
/// are rejected explicitly.
pub fn container_id(id: &str) -> Result<()> {
    if id.is_empty() || id.len() > ID_MAX_LEN {
        return Err(Error::SpecInvalid {
            path: "container_id".to_owned(),
            reason: format!("length {} is outside 1..={ID_MAX_LEN}", id.len()),
        });
    }
    if id == "." || id == ".." {
        return Err(Error::SpecInvalid {
            path: "container_id".to_owned(),
            reason: format!("'{id}' is not a valid id"),
        });
    }
    if let Some(bad) = id
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && !matches!(c, '_' | '.' | '-'))
    {
        return Err(Error::SpecInvalid {
            path: "container_id".to_owned(),
            reason: format!("invalid character '{bad}', allowed: [A-Za-z0-9_.-]"),
        });
    }
    Ok(())
}

/// Validates a VMID against the Proxmox-usable range.
pub fn vmid(value: u32) -> Result<()> {
    if (crate::mapping::VMID_MIN..=crate::mapping::VMID_MAX).contains(&value) {
        Ok(())
    } else {
        Err(Error::SpecInvalid {
            path: "vmid".to_owned(),
            reason: format!(
                "{value} is outside {}..={}",
                crate::mapping::VMID_MIN,
                crate::mapping::VMID_MAX
            ),
        })
    }
}
