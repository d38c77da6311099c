//! `pxeforge list` command — list tagged images in a remote repository.
//!
//! Shows, per tag, when the image was created and the kernel version and
//! OS id recorded in its labels, so boot images can be told apart at a
//! glance.

use clap::Args;
use oci_distribution::client::{Client, ClientConfig, ClientProtocol};
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;

use pxeforge_builder::oci::reference::sanitize_registry_url;
use pxeforge_builder::oci::ImageConfigFile;

use crate::output;

const LABEL_KERNEL_VERSION: &str = "com.openchami.image.kernel-version";
const LABEL_OS_ID: &str = "com.openchami.image.os.id";

#[derive(Args)]
pub struct ListArgs {
    /// Repository reference (e.g. "reg:5000/base/rocky")
    pub repository: String,

    /// Allow insecure HTTP connections
    #[arg(long)]
    pub insecure: bool,
}

pub async fn execute(args: ListArgs) -> Result<(), Box<dyn std::error::Error>> {
    let repository = sanitize_registry_url(&args.repository);
    let reference: Reference = repository
        .parse()
        .map_err(|e| format!("invalid repository reference '{repository}': {e}"))?;

    let protocol = if args.insecure {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    let client = Client::new(ClientConfig {
        protocol,
        ..Default::default()
    });
    let auth = RegistryAuth::Anonymous;

    let tag_list = client
        .list_tags(&reference, &auth, None, None)
        .await
        .map_err(|e| format!("failed to list tags for '{repository}': {e}"))?;

    let mut table = output::new_table(&["REPOSITORY", "TAG", "CREATED", "KERNEL VERSION", "OS"]);

    for tag in &tag_list.tags {
        let tag_ref = Reference::with_tag(
            reference.registry().to_string(),
            reference.repository().to_string(),
            tag.clone(),
        );

        let config_raw = match client.pull_manifest_and_config(&tag_ref, &auth).await {
            Ok((_manifest, _digest, config)) => config,
            Err(e) => {
                tracing::warn!(reference = %tag_ref, error = %e, "Could not fetch image config");
                continue;
            }
        };

        let config: ImageConfigFile = match serde_json::from_str(&config_raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(reference = %tag_ref, error = %e, "Could not parse image config");
                continue;
            }
        };

        let created = config
            .created
            .map(|c| output::format_ago(&c))
            .unwrap_or_else(|| "<unknown>".to_string());
        table.add_row(&[
            tag_list.name.as_str(),
            tag.as_str(),
            created.as_str(),
            config.label(LABEL_KERNEL_VERSION).unwrap_or("<none>"),
            config.label(LABEL_OS_ID).unwrap_or("<unknown>"),
        ]);
    }

    println!("{table}");
    Ok(())
}
