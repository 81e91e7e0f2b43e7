//! Run `keel fetch <module@version>`.

use anyhow::{bail, Context};
use tokio_util::sync::CancellationToken;

use keel_core::{parse_canonical, PackageVersion, Revision};

use super::Env;

pub async fn run(
    env: &Env,
    cancel: &CancellationToken,
    spec: &str,
    size_limit: u64,
) -> anyhow::Result<()> {
    let Some((path, version)) = spec.rsplit_once('@') else {
        bail!("expected module@version, got {spec:?}");
    };
    keel_core::check_path(path)?;
    let version = parse_canonical(version)
        .with_context(|| format!("version in {spec:?} must be canonical"))?;
    let module = PackageVersion::new(path, Revision::version(version.clone()));

    let client = env.client();
    let cache = env.cache();

    let info = client.stat(cancel, path, &version).await?;
    let manifest = client.fetch_manifest(cancel, path, &version).await?;
    cache.store_manifest(&module, &manifest)?;
    let archive = client.fetch_archive(cancel, path, &version, size_limit).await?;
    cache.store_archive(&module, &archive)?;

    match info.time {
        Some(time) => println!(
            "fetched {module} ({} bytes, committed {})",
            archive.len(),
            time.to_rfc3339()
        ),
        None => println!("fetched {module} ({} bytes)", archive.len()),
    }
    Ok(())
}
