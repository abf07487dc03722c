//! NoCloud seed contents for first boot.

use rand::Rng;
use vmcloud_common::CloudInitSeed;

const CLOUD_CONFIG_HEADER: &str = "#cloud-config";
const MIME_BOUNDARY: &str = "==VMCLOUD-SEED==";

/// Build the seed for a new instance. No seed is produced when there is neither a
/// key nor user data to deliver.
pub fn build_seed(
    instance_id: &str,
    hostname: &str,
    public_key: Option<&str>,
    user_data: Option<&str>,
) -> Option<CloudInitSeed> {
    let public_key = public_key.map(str::trim).filter(|k| !k.is_empty());
    let user_data = user_data.filter(|d| !d.trim().is_empty());
    if public_key.is_none() && user_data.is_none() {
        return None;
    }

    let meta_data = format!("instance-id: {instance_id}\nlocal-hostname: {hostname}\n");
    let user_data = match (public_key, user_data) {
        (Some(key), None) => authorized_keys_config(key),
        (None, Some(data)) => data.to_string(),
        (Some(key), Some(data)) if data.trim_start().starts_with(CLOUD_CONFIG_HEADER) => {
            merge_key_into_config(data, key)
        }
        (Some(key), Some(data)) => multipart(&authorized_keys_config(key), data),
        (None, None) => return None,
    };

    Some(CloudInitSeed {
        user_data,
        meta_data,
    })
}

fn authorized_keys_config(key: &str) -> String {
    format!("{CLOUD_CONFIG_HEADER}\nssh_authorized_keys:\n  - {key}\n")
}

/// Add the key to an existing cloud-config document, reusing its
/// `ssh_authorized_keys` list when present.
fn merge_key_into_config(config: &str, key: &str) -> String {
    let mut out = String::with_capacity(config.len() + key.len() + 32);
    let mut merged = false;
    for line in config.lines() {
        out.push_str(line);
        out.push('\n');
        if !merged && line.trim_end() == "ssh_authorized_keys:" {
            out.push_str(&format!("  - {key}\n"));
            merged = true;
        }
    }
    if !merged {
        out.push_str(&format!("ssh_authorized_keys:\n  - {key}\n"));
    }
    out
}

/// Cloud-config and a non-config payload (script, include) in one MIME document.
fn multipart(config: &str, payload: &str) -> String {
    let payload_type = if payload.starts_with("#!") {
        "text/x-shellscript"
    } else if payload.starts_with("#include") {
        "text/x-include-url"
    } else {
        "text/plain"
    };
    format!(
        "Content-Type: multipart/mixed; boundary=\"{MIME_BOUNDARY}\"\n\
         MIME-Version: 1.0\n\
         \n\
         --{MIME_BOUNDARY}\n\
         Content-Type: text/cloud-config; charset=\"us-ascii\"\n\
         \n\
         {config}\n\
         --{MIME_BOUNDARY}\n\
         Content-Type: {payload_type}; charset=\"us-ascii\"\n\
         \n\
         {payload}\n\
         --{MIME_BOUNDARY}--\n"
    )
}

/// Locally administered MAC in the KVM range.
pub fn generate_mac() -> String {
    let mut rng = rand::thread_rng();
    format!(
        "52:54:00:{:02x}:{:02x}:{:02x}",
        rng.gen::<u8>(),
        rng.gen::<u8>(),
        rng.gen::<u8>()
    )
}
