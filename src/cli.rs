use clap::{Arg, ArgMatches, Command};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    Up(String),
    Rollback(String),
    Prune(String),
    Status(String),
}

/// One line typed into the interactive shell
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellCommand {
    Run(Operation),
    Services,
    Help,
    Exit,
    Empty,
}

pub const SHELL_HELP: &str = "\
up <service>            start a new instance and switch the upstream to it
rollback <service>      switch the upstream back to the retired instance
prune <service|all>     remove retired instances
status <service>        list running instances
services                list configured services
exit                    say goodbye";

pub struct Config {
    pub config: PathBuf,
    pub operation: Option<Operation>,
}

impl From<ArgMatches> for Config {
    fn from(matches: ArgMatches) -> Self {
        let config = matches
            .get_one::<PathBuf>("config")
            .cloned()
            .unwrap_or_else(|| PathBuf::from("switchyard.toml"));
        let operation = matches.subcommand().and_then(|(name, sub)| {
            let target = sub.get_one::<String>("service")?.clone();
            match name {
                "up" => Some(Operation::Up(target)),
                "rollback" => Some(Operation::Rollback(target)),
                "prune" => Some(Operation::Prune(target)),
                "status" => Some(Operation::Status(target)),
                _ => None,
            }
        });
        Config { config, operation }
    }
}

fn service_arg(help: &'static str) -> Arg {
    Arg::new("service")
        .value_name("SERVICE")
        .help(help)
        .required(true)
}

fn command() -> Command {
    let default_config =
        env::var("SWITCHYARD_CONFIG").unwrap_or_else(|_| "switchyard.toml".to_string());
    Command::new("switchyard")
        .version(env!("CARGO_PKG_VERSION"))
        .about("zero-downtime rolling deploys behind an APISIX gateway")
        .long_about("Runs the given command, or an interactive shell when none is given.")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .help(format!("Service catalog (default: {default_config})"))
                .value_name("FILE")
                .default_value(default_config)
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new("up")
                .about("start a new instance and switch the upstream to it")
                .arg(service_arg("service to deploy")),
        )
        .subcommand(
            Command::new("rollback")
                .about("switch the upstream back to the retired instance")
                .arg(service_arg("service to roll back")),
        )
        .subcommand(
            Command::new("prune")
                .about("remove retired instances")
                .arg(service_arg("service to prune, or `all`")),
        )
        .subcommand(
            Command::new("status")
                .about("list running instances")
                .arg(service_arg("service to inspect")),
        )
}

pub fn configure_cli() -> Config {
    command().get_matches().into()
}

pub fn parse_line(line: &str) -> Result<ShellCommand, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(ShellCommand::Empty);
    };
    let target = words.next().map(str::to_string);
    match (verb, target) {
        ("exit" | "quit", _) => Ok(ShellCommand::Exit),
        ("help", _) => Ok(ShellCommand::Help),
        ("services", _) => Ok(ShellCommand::Services),
        ("up" | "rollback" | "prune" | "status", None) => Err("please input service name".to_string()),
        ("up", Some(service)) => Ok(ShellCommand::Run(Operation::Up(service))),
        ("rollback", Some(service)) => Ok(ShellCommand::Run(Operation::Rollback(service))),
        ("prune", Some(service)) => Ok(ShellCommand::Run(Operation::Prune(service))),
        ("status", Some(service)) => Ok(ShellCommand::Run(Operation::Status(service))),
        _ => Err(format!("unknown command {}", line.trim())),
    }
}
