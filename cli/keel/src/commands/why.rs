//! Run `keel why <package>`.

use anyhow::bail;
use tokio_util::sync::CancellationToken;

use keel_resolve::{LoaderOptions, Pattern};

use super::Env;

pub async fn run(env: &Env, cancel: &CancellationToken, package: &str) -> anyhow::Result<()> {
    let loader = env.loader(LoaderOptions {
        allow_errors: true,
        ..LoaderOptions::default()
    })?;
    let resolution = loader.load_packages(cancel, &[Pattern::All]).await?;

    match resolution.why(package) {
        Some(chain) => println!("{chain}"),
        None => bail!("package {package} is not in the import graph of the main module"),
    }
    Ok(())
}
