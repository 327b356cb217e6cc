//! Startup scripts that install Outline and publish the result back through
//! provider metadata, where the install state machine picks it up.
//!
//! The install script writes `/opt/outline/access.txt` with lines such as
//! `apiUrl:https://...` and `certSha256:ABCD...`.

const ACCESS_FILE: &str = "/opt/outline/access.txt";
const INSTALL_LOG: &str = "/var/log/outline-install.log";

/// Droplet user data: runs the installer, then tags the droplet with
/// `kv:<key>:<hex(value)>` entries using the account token.
pub fn digitalocean_user_data(access_token: &str, install_script_url: &str) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
export DO_ACCESS_TOKEN='{access_token}'
DROPLET_ID=$(curl -sf http://169.254.169.254/metadata/v1/id)

tag_droplet() {{
  local name="kv:$1:$(printf '%s' "$2" | xxd -p | tr -d '\n')"
  curl -sf -X POST -H "Authorization: Bearer $DO_ACCESS_TOKEN" -H 'Content-Type: application/json' \
    -d "{{\"name\":\"$name\"}}" https://api.digitalocean.com/v2/tags > /dev/null
  curl -sf -X POST -H "Authorization: Bearer $DO_ACCESS_TOKEN" -H 'Content-Type: application/json' \
    -d "{{\"resources\":[{{\"resource_id\":\"$DROPLET_ID\",\"resource_type\":\"droplet\"}}]}}" \
    "https://api.digitalocean.com/v2/tags/$name/resources"
}}

trap 'tag_droplet install-error true' ERR
bash -c "$(curl -fsSL {install_script_url})" > {INSTALL_LOG} 2>&1
tag_droplet certsha256 "$(grep certSha256 {ACCESS_FILE} | cut -d: -f2)"
tag_droplet apiurl "$(grep apiUrl {ACCESS_FILE} | cut -d: -f2-)"
"#
    )
}

/// Instance startup script: runs the installer, then publishes guest
/// attributes under the `outline/` namespace via the metadata server.
pub fn gcp_startup_script(install_script_url: &str) -> String {
    format!(
        r#"#!/bin/bash
set -euo pipefail
ATTRIBUTES=http://metadata.google.internal/computeMetadata/v1/instance/guest-attributes/outline

publish() {{
  curl -sf -X PUT --data "$2" -H 'Metadata-Flavor: Google' "$ATTRIBUTES/$1"
}}

trap 'publish install-error true' ERR
bash -c "$(curl -fsSL {install_script_url})" > {INSTALL_LOG} 2>&1
publish apiUrl "$(grep apiUrl {ACCESS_FILE} | cut -d: -f2-)"
publish certSha256 "$(grep certSha256 {ACCESS_FILE} | cut -d: -f2)"
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn droplet_script_tags_all_result_keys() {
        let script = digitalocean_user_data("dop_v1_secret", "https://example.com/install.sh");

        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("DO_ACCESS_TOKEN='dop_v1_secret'"));
        assert!(script.contains("curl -fsSL https://example.com/install.sh"));
        for key in ["install-error", "certsha256", "apiurl"] {
            assert!(script.contains(&format!("tag_droplet {key} ")), "missing {key}");
        }
        assert!(script.contains(r#"-d "{\"name\":\"$name\"}""#));
    }

    #[test]
    fn gcp_script_publishes_guest_attributes() {
        let script = gcp_startup_script("https://example.com/install.sh");

        assert!(script.contains("guest-attributes/outline"));
        for key in ["install-error", "apiUrl", "certSha256"] {
            assert!(script.contains(&format!("publish {key} ")), "missing {key}");
        }
        assert!(!script.contains("{{"));
    }
}
