mod cli;

use crate::cli::{Operation, SHELL_HELP, ShellCommand, configure_cli, parse_line};
use env_logger::Env;
use log::{error, info, warn};
use std::io::Write;
use std::process;
use switchyard::DeployError;
use switchyard::compose::load_compose;
use switchyard::config::load_config;
use switchyard::gateway::{ApisixAdmin, UpstreamSwitcher};
use switchyard::health::{HealthCheck, HttpProber};
use switchyard::orchestrator::{Orchestrator, Outcome};
use switchyard::runtime::{ContainerRuntime, DockerRuntime};
use tokio::io::{AsyncBufReadExt, BufReader, stdin};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + 'static>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = configure_cli();

    let config = load_config(&cli.config)?;
    let compose = load_compose(&config.deploy.compose)?;
    let runtime = DockerRuntime::connect(config.docker.host.as_deref())?;
    runtime.ping().await?;
    let gateway = ApisixAdmin::new(&config.gateway)?;
    let health = HttpProber::from_config(&config.health)?;
    if !config.health.enabled {
        warn!("health checks are disabled, new instances receive traffic unchecked");
    }
    let orchestrator = Orchestrator::from_config(&config, compose, runtime, gateway, health);

    match cli.operation {
        Some(operation) => {
            if !run(&orchestrator, operation).await {
                process::exit(1);
            }
        }
        None => shell(&orchestrator).await?,
    }
    Ok(())
}

fn report<T>(result: Result<Outcome<T>, DeployError>, done: impl FnOnce(T)) -> bool {
    match result {
        Ok(Outcome::Completed(value)) => {
            done(value);
            true
        }
        Ok(Outcome::NotFound(service)) => {
            warn!("srv {service} not found");
            false
        }
        Err(e) => {
            error!("{e}");
            false
        }
    }
}

async fn run<R, G, H>(orchestrator: &Orchestrator<R, G, H>, operation: Operation) -> bool
where
    R: ContainerRuntime,
    G: UpstreamSwitcher,
    H: HealthCheck,
{
    match operation {
        Operation::Up(service) => report(orchestrator.up(&service).await, |deployment| {
            info!(
                "{} is live on port {} ({} retired instance(s) removed)",
                deployment.service,
                deployment.port,
                deployment.pruned.len()
            )
        }),
        Operation::Rollback(service) => report(orchestrator.rollback(&service).await, |rolled_back| {
            info!(
                "{} routes to {} on port {} again",
                rolled_back.service, rolled_back.name, rolled_back.port
            )
        }),
        Operation::Prune(target) => report(orchestrator.prune(&target).await, |reports| {
            for report in reports {
                info!(
                    "{}: {} removed, {} failed",
                    report.service,
                    report.removed.len(),
                    report.failed.len()
                );
            }
        }),
        Operation::Status(service) => report(orchestrator.status(&service).await, |instances| {
            if instances.is_empty() {
                println!("{service}: no running instance");
            }
            for instance in instances {
                let marker = if instance.current { "current" } else { "retired" };
                println!(
                    "{marker:8} {} {} created {} ports {:?}",
                    instance.name, instance.id, instance.created, instance.ports
                );
            }
        }),
    }
}

async fn shell<R, G, H>(orchestrator: &Orchestrator<R, G, H>) -> std::io::Result<()>
where
    R: ContainerRuntime,
    G: UpstreamSwitcher,
    H: HealthCheck,
{
    ctrlc::set_handler(move || {
        warn!("Received shutdown signal, a deploy in flight may leave its container behind");
        process::exit(130);
    })
    .map_err(|e| std::io::Error::other(e.to_string()))?;

    println!("hello, developer !");
    let mut lines = BufReader::new(stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        match parse_line(&line) {
            Ok(ShellCommand::Run(operation)) => {
                run(orchestrator, operation).await;
            }
            Ok(ShellCommand::Services) => {
                for service in orchestrator.services() {
                    println!(
                        "{} (upstream {}, port {}, health {})",
                        service.name, service.id, service.port, service.health_check
                    );
                }
            }
            Ok(ShellCommand::Help) => println!("{SHELL_HELP}"),
            Ok(ShellCommand::Empty) => {}
            Ok(ShellCommand::Exit) => break,
            Err(message) => println!("{message}"),
        }
    }
    println!("bye !");
    Ok(())
}
