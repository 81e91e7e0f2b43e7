//! Run `keel versions <module>`.

use tokio_util::sync::CancellationToken;

use super::Env;

pub async fn run(
    env: &Env,
    cancel: &CancellationToken,
    module: &str,
    prefix: &str,
) -> anyhow::Result<()> {
    keel_core::check_path(module)?;
    let client = env.client();
    let versions = client.list_versions(cancel, module, prefix).await?;
    for version in versions {
        println!("{version}");
    }
    Ok(())
}
