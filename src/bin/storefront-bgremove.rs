//! Storefront logo background-removal CLI tool
//!
//! Runs image sources through the full fetch, decode, inference and publish
//! pipeline and writes the processed images to disk.

#[cfg(feature = "cli")]
use storefront_bgremove::cli;

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cli::main().await
}

#[cfg(not(feature = "cli"))]
fn main() {
    panic!("CLI feature not enabled. Please rebuild with --features cli");
}
