//! Run `keel check`.

use anyhow::bail;
use tokio_util::sync::CancellationToken;

use keel_resolve::find_conflicts;

use super::Env;

pub async fn run(env: &Env, cancel: &CancellationToken) -> anyhow::Result<()> {
    let main = env.main_modules()?;
    main.check_supported()?;
    let source = env.source();
    let requirements = main.requirements(main.default_pruning());

    let conflicts = find_conflicts(cancel, &requirements, &source).await?;
    if conflicts.is_empty() {
        println!("no requirement conflicts");
        return Ok(());
    }

    for conflict in &conflicts {
        let chain: Vec<String> = conflict.path.iter().map(|m| m.to_string()).collect();
        println!("{}", chain.join(" requires "));
        if let Some(cause) = &conflict.cause {
            println!("  cause: {cause}");
        }
    }
    bail!("{} requirement conflict(s)", conflicts.len());
}
