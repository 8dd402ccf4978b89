//! rollstack deploys a rollup chain on a single host, end to end.

mod cli;

use std::process::ExitCode;

use clap::Parser;
use comfy_table::{Table, presets::UTF8_FULL};

use cli::Cli;
use rollstack_deploy::{
    DeployConfig, DeployError, Orchestrator, PipelineContext, PipelineReport, RunOptions,
    SystemExecutor, Systemd,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    match run(cli).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e:#}");
            match e.downcast_ref::<DeployError>() {
                Some(deploy_error) => ExitCode::from(deploy_error.exit_code()),
                None => ExitCode::FAILURE,
            }
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<PipelineReport> {
    let mut config = DeployConfig::load(cli.config.as_deref())?;
    if let Some(workdir) = cli.workdir {
        config.workdir = workdir;
    }

    let plan = cli.command.plan();
    tracing::info!(
        plan = %plan,
        workdir = %config.workdir.display(),
        "Loaded deployment configuration"
    );

    let mut ctx = PipelineContext::new();
    for (key, value) in cli.command.arguments() {
        ctx.set(key, value)?;
    }

    // SAFETY: geteuid has no preconditions and cannot fail.
    let is_root = unsafe { libc::geteuid() } == 0;
    if cli.skip_privilege_check && !is_root {
        tracing::warn!("Running without root privileges");
    }

    let pipeline = plan.pipeline(&config);
    let orchestrator = Orchestrator::new(
        SystemExecutor,
        Systemd::new(&config.unit_dir, SystemExecutor),
        RunOptions {
            log_dir: Some(config.log_dir()),
            privileged: is_root || cli.skip_privilege_check,
            readiness: config.readiness,
            ..Default::default()
        },
    );

    let cancel = orchestrator.cancel_token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, stopping the deployment");
            cancel.cancel();
        }
    });

    Ok(orchestrator.run(&pipeline, ctx).await?)
}

fn print_report(report: &PipelineReport) {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_header(vec!["Stage", "Kind", "Status"]);
    for stage in &report.stages {
        table.add_row(vec![
            stage.name.clone(),
            stage.kind.to_string(),
            stage.status.to_string(),
        ]);
    }
    println!("{table}");

    for service in &report.services.started {
        println!("Service started: {service}");
    }
    if let Some(path) = &report.log_path {
        println!("Run log: {}", path.display());
    }
    println!("{} deployment {}", report.pipeline, report.state);
}
