use clap::{Args, Subcommand};
use color_eyre::eyre::{bail, Result};
use mayfly_plugins::PluginRegistry;
use mayfly_server::{AdminService, Dispatcher, MemoryStore, PackageReport};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Subcommand, Debug)]
pub enum PluginCommands {
    /// Load every package in a directory and report what would be installed
    Check(CheckArgs),
}

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Directory holding one sub-directory per plugin package
    pub dir: PathBuf,

    /// Package that is allowed to declare no match rules
    #[arg(long, env = "MAYFLY_AUTOPROV_PLUGIN")]
    pub autoprov_plugin: Option<String>,
}

pub fn run_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::Check(args) => run_check(args),
    }
}

fn report_line(report: &PackageReport) -> String {
    match &report.result {
        Ok(info) => format!(
            "ok      {} {} ({} rules)",
            info.id,
            info.version.as_deref().unwrap_or("-"),
            info.rules.len()
        ),
        Err(e) => format!("FAILED  {}: {}", report.path.display(), e),
    }
}

fn run_check(args: CheckArgs) -> Result<()> {
    let mut registry = PluginRegistry::new();
    if let Some(id) = args.autoprov_plugin {
        registry = registry.with_autoprov(id);
    }
    let dispatcher = Dispatcher::new(Arc::new(registry), Arc::new(MemoryStore::new()));
    let admin = AdminService::new(Arc::new(dispatcher));

    let reports = admin.install_directory(&args.dir)?;
    for report in &reports {
        println!("{}", report_line(report));
    }

    let failed = reports.iter().filter(|r| r.result.is_err()).count();
    if failed > 0 {
        bail!("{} of {} plugin packages failed to load", failed, reports.len());
    }
    println!("{} plugin packages loaded", reports.len());
    Ok(())
}
