use anyhow::{bail, Context};
use async_trait::async_trait;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use pkginstall::{
    config::Config,
    confirm::{AutoPolicy, ConfirmationGate, ConfirmationPrompt, Decision, DialoguerPrompt},
    planner::{format_conflicts, Operation, TransactionPlan},
    process::{ProcessEvent, ProcessRunner, ProcessState},
    session::{OperationOutcome, Session},
    utils::{format_duration, require_root},
    InstallerError, InstallerResult, PKGINSTALL_VERSION,
};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedReceiver;

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();
    init_logging(matches.get_flag("verbose"));
    if matches.get_flag("no-color") {
        colored::control::set_override(false);
    }
    let start_time = Instant::now();

    if let Err(e) = run_command(matches).await {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }

    info!(
        "Operation completed in {}",
        format_duration(start_time.elapsed().as_secs())
    );
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .init();
}

fn packages_arg(help: &'static str) -> Arg {
    Arg::new("packages").required(true).num_args(1..).help(help)
}

fn build_cli() -> Command {
    Command::new("pkginstall")
        .version(PKGINSTALL_VERSION)
        .about("Plans, confirms and applies pacman install/remove transactions under a single lock.")
        .arg(Arg::new("verbose")
            .short('v')
            .long("verbose")
            .global(true)
            .action(ArgAction::SetTrue))
        .arg(Arg::new("config")
            .short('c')
            .long("config")
            .global(true)
            .value_name("CONFIG"))
        .arg(Arg::new("no-color")
            .long("no-color")
            .global(true)
            .action(ArgAction::SetTrue))
        .subcommand_required(true)
        .subcommand(Command::new("install")
            .about("Install packages")
            .alias("i")
            .arg(packages_arg("Package names to install"))
            .arg(Arg::new("yes")
                .short('y')
                .long("yes")
                .action(ArgAction::SetTrue)
                .help("Accept the transaction without asking"))
            .arg(Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Proceed despite conflicts")))
        .subcommand(Command::new("remove")
            .about("Remove packages and the packages depending on them")
            .alias("r")
            .arg(packages_arg("Package names to remove"))
            .arg(Arg::new("yes")
                .short('y')
                .long("yes")
                .action(ArgAction::SetTrue)
                .help("Accept the transaction without asking"))
            .arg(Arg::new("force")
                .long("force")
                .action(ArgAction::SetTrue)
                .help("Proceed despite conflicts")))
        .subcommand(Command::new("plan")
            .about("Show what a transaction would change without applying it")
            .arg(Arg::new("operation")
                .required(true)
                .value_parser(["install", "remove"]))
            .arg(packages_arg("Package names"))
            .arg(Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print the plan as JSON")))
        .subcommand(Command::new("update")
            .about("Refresh the sync databases")
            .alias("u"))
        .subcommand(Command::new("installed")
            .about("List installed packages")
            .alias("l"))
}

async fn run_command(matches: ArgMatches) -> anyhow::Result<()> {
    let config = Config::load(matches.get_one::<String>("config").map(Path::new))
        .context("failed to load configuration")?;
    if config.privilege_command.is_none() {
        if let Err(e) = require_root() {
            eprintln!(
                "{}",
                format!("⚠️  {}; set privilege_command or package operations will fail.", e)
                    .yellow()
            );
        }
    }

    if let Err(e) = which::which(&config.pacman_bin) {
        eprintln!(
            "{}",
            format!("⚠️  Package manager '{}' not found: {}", config.pacman_bin, e).yellow()
        );
    }

    let mut session = Session::open(&config).context("failed to open package database")?;

    match matches.subcommand() {
        Some((verb @ ("install" | "remove"), sub_matches)) => {
            let operation: Operation = verb.parse().map_err(anyhow::Error::msg)?;
            let packages = packages(sub_matches);
            let gate = ConfirmationGate::new(prompt_for(
                sub_matches.get_flag("yes"),
                sub_matches.get_flag("force"),
            ));

            let view = spawn_output_view(session.process_events());
            spawn_interrupt_handler(session.runner());

            println!(
                "{}",
                format!("📦 {} {} package(s)...", verb, packages.len()).cyan()
            );
            let outcome = session.run_operation(operation, &packages, &gate).await;
            view.abort();

            let outcome = match outcome {
                Err(e) if e.is_lock_error() && e.is_recoverable() => {
                    bail!("{}; wait for the other package operation to finish", e)
                }
                other => other?,
            };
            match outcome {
                OperationOutcome::Rejected => {
                    println!("{}", "Cancelled, nothing was changed.".yellow());
                }
                OperationOutcome::Executed(report) if report.success => {
                    println!(
                        "{}",
                        format!("✅ {} completed successfully!", operation).green()
                    );
                }
                OperationOutcome::Executed(report) => {
                    if report.state == ProcessState::Terminated {
                        eprintln!(
                            "{}",
                            "Package database state is unknown; run 'pkginstall update' before continuing."
                                .yellow()
                        );
                    }
                    bail!(
                        "{} failed ({}, exit code {:?}):\n{}",
                        operation,
                        report.state,
                        report.exit_code,
                        report.output.join("\n")
                    );
                }
            }
        }

        Some(("plan", sub_matches)) => {
            let operation: Operation = sub_matches
                .get_one::<String>("operation")
                .map(|s| s.parse())
                .transpose()
                .map_err(anyhow::Error::msg)?
                .unwrap_or(Operation::Install);
            let packages = packages(sub_matches);

            let view = spawn_output_view(session.process_events());
            let plan = session.plan(operation, &packages).await;
            view.abort();
            let plan = plan?;

            if sub_matches.get_flag("json") {
                println!("{}", serde_json::to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }

        Some(("update", _)) => {
            println!("{}", "🔄 Updating package databases...".cyan());
            let view = spawn_output_view(session.process_events());
            let outcome = session.update_sources().await;
            view.abort();

            let outcome = outcome?;
            if outcome.ok {
                println!("{}", "✅ Package databases updated".green());
            } else {
                bail!(
                    "problem updating sources: {}",
                    outcome.message.unwrap_or_default()
                );
            }
        }

        Some(("installed", _)) => {
            let installed = session.installed();
            if installed.is_empty() {
                println!("{}", "No packages installed.".yellow());
            }
            for (name, version) in installed.iter() {
                println!("{} {}", name.bold(), version.green());
            }
            println!("\nTotal: {} packages", installed.len());
        }

        _ => unreachable!("subcommand is required"),
    }

    session.close();
    Ok(())
}

fn packages(matches: &ArgMatches) -> Vec<String> {
    matches
        .get_many::<String>("packages")
        .map(|values| values.cloned().collect())
        .unwrap_or_default()
}

fn print_plan(plan: &TransactionPlan) {
    println!("{}", format!("Plan for {}: {}", plan.operation, plan.targets.join(" ")).bold());
    println!("{}", "=".repeat(50));
    println!("{}", plan.summary_text);
    if !plan.details_text.is_empty() {
        println!("\n{}", plan.details_text.cyan());
    }
    if plan.requires_override() {
        println!("\n{}", "Conflicts:".red().bold());
        println!("{}", format_conflicts(&plan.conflicts).yellow());
    }
}

struct ForceOverride<P>(P);

#[async_trait]
impl<P: ConfirmationPrompt> ConfirmationPrompt for ForceOverride<P> {
    async fn confirm_conflicts(&self, plan: &TransactionPlan) -> InstallerResult<Decision> {
        eprintln!("{}", format_conflicts(&plan.conflicts).yellow());
        Ok(Decision::Accept)
    }

    async fn confirm_plan(&self, plan: &TransactionPlan) -> InstallerResult<Decision> {
        self.0.confirm_plan(plan).await
    }
}

fn prompt_for(yes: bool, force: bool) -> Arc<dyn ConfirmationPrompt> {
    match (yes, force) {
        (true, true) => Arc::new(AutoPolicy::accept_all()),
        (true, false) => Arc::new(AutoPolicy::accept_clean()),
        (false, true) => Arc::new(ForceOverride(DialoguerPrompt)),
        (false, false) => Arc::new(DialoguerPrompt),
    }
}

fn spawn_output_view(mut events: UnboundedReceiver<ProcessEvent>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut spinner: Option<ProgressBar> = None;
        while let Some(event) = events.recv().await {
            match event {
                ProcessEvent::Started { command } => {
                    let pb = ProgressBar::new_spinner();
                    pb.set_style(
                        ProgressStyle::default_spinner()
                            .template("{spinner:.green} [{elapsed_precise}] {wide_msg}")
                            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                    );
                    pb.enable_steady_tick(Duration::from_millis(100));
                    pb.set_message(command);
                    spinner = Some(pb);
                }
                ProcessEvent::Output(line) => match &spinner {
                    Some(pb) => {
                        pb.println(&line);
                        pb.set_message(line);
                    }
                    None => println!("{}", line),
                },
                ProcessEvent::Error(line) => match &spinner {
                    Some(pb) => pb.println(line.yellow().to_string()),
                    None => eprintln!("{}", line.yellow()),
                },
                ProcessEvent::Finished { .. } => {
                    if let Some(pb) = spinner.take() {
                        pb.finish_and_clear();
                    }
                }
            }
        }
    })
}

fn spawn_interrupt_handler(runner: Arc<ProcessRunner>) {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            match runner.interrupt().await {
                Ok(()) => eprintln!("{}", "Terminating package manager...".yellow()),
                Err(InstallerError::NothingToTerminate) => std::process::exit(130),
                Err(e) => eprintln!("{}", format!("Could not terminate: {}", e).yellow()),
            }
        }
    });
}
