//! `pxeforge build` command — build a system image from a recipe.

use std::path::{Path, PathBuf};

use clap::Args;

use pxeforge_builder::BuildPipeline;
use pxeforge_core::recipe::load_recipe;

#[derive(Args)]
pub struct BuildArgs {
    /// Path to the build recipe file
    #[arg(short, long)]
    pub config: String,

    /// Output directory for build artifacts (kernel, squashfs, staging)
    #[arg(short, long, default_value = "output")]
    pub output: String,

    /// Also produce a squashfs image of the rootfs
    #[arg(long)]
    pub squashfs: bool,

    /// Generate kernel and initrd layers for network boot
    #[arg(long)]
    pub initrd: bool,
}

pub async fn execute(args: BuildArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Rootless builds need unprivileged user namespaces.
    if !nix::unistd::geteuid().is_root()
        && !Path::new("/proc/sys/kernel/unprivileged_userns_clone").exists()
    {
        tracing::warn!(
            "Unprivileged user namespaces are not supported by this kernel. Please enable them in your kernel configuration."
        );
        return Err("unprivileged user namespaces are not supported by this kernel".into());
    }

    let recipe = load_recipe(&args.config)
        .map_err(|e| format!("failed to load configuration: {e}"))?;

    let output_dir = PathBuf::from(&args.output);
    std::fs::create_dir_all(&output_dir)
        .map_err(|e| format!("failed to create output directory: {e}"))?;

    let pipeline = BuildPipeline::new(recipe, &output_dir, args.squashfs, args.initrd)?;
    pipeline.build().await?;

    Ok(())
}
