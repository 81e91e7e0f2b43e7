//! Run `keel graph [--build-list]`.

use tokio_util::sync::CancellationToken;

use super::Env;

pub async fn run(env: &Env, cancel: &CancellationToken, build_list: bool) -> anyhow::Result<()> {
    let main = env.main_modules()?;
    main.check_supported()?;
    let source = env.source();
    let requirements = main.requirements(main.default_pruning());
    let graph = requirements.graph(cancel, &source).await?;

    if build_list {
        for module in graph.build_list() {
            println!("{} {}", module.path, module.revision);
        }
        return Ok(());
    }

    // Edges from the main modules to their declared requirements first,
    // then the recorded requirement edges, both in deterministic order.
    for member in main.members() {
        for req in &member.manifest.require {
            println!("{} {}@{}", member.module.path, req.module, req.version);
        }
    }
    for module in &graph.build_list() {
        if let Some(requires) = graph.required_by(module) {
            for req in requires {
                println!("{module} {req}");
            }
        }
    }
    Ok(())
}
