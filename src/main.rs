//! adbg - native and managed remote debugging for Android processes
//!
//! This is the binary entry point. All logic lives in the library.

use clap::Parser;

use android_debug::Args;

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    adbg_core::logging::init()?;

    android_debug::run(args).await?;
    Ok(())
}
