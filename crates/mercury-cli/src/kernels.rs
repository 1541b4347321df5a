//! Kernels command implementation for Mercury CLI.

use mercury_core::kernel::best_match;
use mercury_core::{KernelSpecResolver, MercuryConfig};

use crate::colors;
use crate::session::KernelArgs;

/// List visible kernel specs, marking the one a session would use.
///
/// Never installs a spec, unlike session startup.
pub async fn execute(config: &MercuryConfig, kernel: &KernelArgs) -> anyhow::Result<()> {
    let resolver = KernelSpecResolver::from_config(config);
    let connection = kernel.connection();
    let specs = resolver.enumerate(connection.as_ref()).await;

    if specs.is_empty() {
        println!("{}No kernel specs found.{}", colors::YELLOW, colors::RESET);
        return Ok(());
    }

    let criteria = kernel.criteria().await;
    let chosen = best_match(&specs, criteria.as_ref());

    println!("\n{}Kernel specs{}", colors::BOLD, colors::RESET);
    println!("{}", "─".repeat(50));
    for spec in &specs {
        let selected = chosen.as_ref().is_some_and(|c| c.name == spec.name);
        let marker = if selected { "*" } else { " " };
        let version = spec
            .interpreter_version()
            .map(|v| format!(" {}.{}.{}", v.major, v.minor, v.patch))
            .unwrap_or_default();
        println!(
            "{}{} {}{} {}({}{}){} {}",
            if selected { colors::GREEN } else { "" },
            marker,
            spec.name,
            colors::RESET,
            colors::DIM,
            spec.language,
            version,
            colors::RESET,
            spec.display_name
        );
    }
    Ok(())
}
