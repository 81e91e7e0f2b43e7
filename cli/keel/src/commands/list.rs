//! Run `keel list [patterns…]`.

use tokio_util::sync::CancellationToken;

use keel_resolve::{LoaderOptions, Pattern};

use super::Env;

pub async fn run(
    env: &Env,
    cancel: &CancellationToken,
    patterns: &[String],
    json: bool,
    tests: bool,
    tolerate_errors: bool,
) -> anyhow::Result<()> {
    let patterns: Vec<Pattern> = if patterns.is_empty() {
        vec![Pattern::All]
    } else {
        patterns.iter().map(|p| Pattern::parse(p)).collect()
    };

    let loader = env.loader(LoaderOptions {
        load_tests: tests,
        allow_errors: tolerate_errors,
        ..LoaderOptions::default()
    })?;
    let resolution = loader.load_packages(cancel, &patterns).await?;
    if resolution.cancelled {
        eprintln!("keel: resolution cancelled; results are partial");
    }

    for descriptor in &resolution.descriptors {
        if json {
            println!("{}", serde_json::to_string(descriptor)?);
            continue;
        }
        let mut line = descriptor.path.clone();
        if let Some(module) = &descriptor.module {
            if !module.revision.is_none() {
                line.push_str(&format!(" [{module}]"));
            }
        }
        if let Some(replace) = &descriptor.replace {
            line.push_str(&format!(" (replaced by {replace})"));
        }
        if let Some(error) = &descriptor.error {
            line.push_str(&format!(" (error: {error})"));
        }
        println!("{line}");
    }

    if let Some(required) = resolution.max_language_requirement() {
        eprintln!(
            "keel: some modules need language {required}; this resolver supports up to {}",
            keel_core::lang::SUPPORTED
        );
    }
    Ok(())
}
