//! Device Allocator
//!
//! Picks the next free local block device name for an attach. A letter is
//! in use when either the storage backend maps a device to it or the local
//! partition table already shows it; attach and detach leave windows in
//! which the two disagree, so both are consulted.

use crate::domain::types::BlockDevice;
use crate::error::{Error, Result};
use std::collections::BTreeSet;
use tracing::debug;

/// Trailing letters a device name may take
pub const DEVICE_LETTERS: [char; 16] = [
    'a', 'b', 'c', 'd', 'e', 'f', 'g', 'h', 'i', 'j', 'k', 'l', 'm', 'n', 'o', 'p',
];

/// Letter following `prefix` in `name`, if `name` is `<prefix><letter>...`
fn trailing_letter(name: &str, prefix: &str) -> Option<char> {
    name.strip_prefix(prefix)
        .and_then(|rest| rest.chars().next())
        .filter(char::is_ascii_lowercase)
}

/// Letters already taken by the backend mapping or local partitions
///
/// `device_prefix` is a device path such as `/dev/xvd`; partition names are
/// matched against the same prefix without its `/dev/` directory.
pub fn used_letters<'a>(
    device_prefix: &str,
    mapped: impl IntoIterator<Item = &'a str>,
    local: impl IntoIterator<Item = &'a str>,
) -> BTreeSet<char> {
    let local_prefix = device_prefix
        .strip_prefix("/dev/")
        .unwrap_or(device_prefix);

    mapped
        .into_iter()
        .filter_map(|name| trailing_letter(name, device_prefix))
        .chain(
            local
                .into_iter()
                .filter_map(|name| trailing_letter(name, local_prefix)),
        )
        .collect()
}

/// Next free device path under `device_prefix`
pub fn next_available_device(
    device_prefix: &str,
    mapped: &[BlockDevice],
    local_partitions: &[String],
) -> Result<String> {
    let used = used_letters(
        device_prefix,
        mapped.iter().map(|d| d.device_name.as_str()),
        local_partitions.iter().map(String::as_str),
    );

    let letter = DEVICE_LETTERS
        .iter()
        .find(|letter| !used.contains(*letter))
        .ok_or_else(|| Error::DeviceAllocationExhausted {
            prefix: device_prefix.to_string(),
        })?;

    let device = format!("{}{}", device_prefix, letter);
    debug!(device = %device, used = used.len(), "got next device name");
    Ok(device)
}
