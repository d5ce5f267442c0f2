//! `custos` command line

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use custos_core::{init_tracing, AgentKind, Money};
use custos_policy::{GovernanceEngine, PolicyStore};
use custos_swarm::sim::{self, SimulatedHealth, SimulationConfig};
use custos_swarm::{CustosConfig, Services};
use std::path::PathBuf;
use std::sync::Arc;

fn cli() -> Command {
    Command::new("custos")
        .version(custos_swarm::VERSION)
        .about("Supervised-autonomy governance for logistics agents")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .short('c')
                .global(true)
                .env("CUSTOS_CONFIG")
                .value_parser(value_parser!(PathBuf))
                .help("YAML or TOML configuration file"),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run both agents against a simulated logistics world")
                .arg(
                    Arg::new("seed")
                        .long("seed")
                        .default_value("42")
                        .value_parser(value_parser!(u64))
                        .help("Random seed for reproducibility"),
                )
                .arg(
                    Arg::new("shipments")
                        .long("shipments")
                        .default_value("40")
                        .value_parser(value_parser!(usize))
                        .help("Shipments in transit"),
                )
                .arg(
                    Arg::new("disputes")
                        .long("disputes")
                        .default_value("12")
                        .value_parser(value_parser!(usize))
                        .help("Open disputes"),
                )
                .arg(
                    Arg::new("ledger-failure-rate")
                        .long("ledger-failure-rate")
                        .default_value("0.05")
                        .value_parser(value_parser!(f64))
                        .help("Share of ledger submissions that fail"),
                )
                .arg(
                    Arg::new("veto-rate")
                        .long("veto-rate")
                        .default_value("0.2")
                        .value_parser(value_parser!(f64))
                        .help("Share of veto windows the simulated operator vetoes"),
                )
                .arg(
                    Arg::new("window-secs")
                        .long("window-secs")
                        .default_value("2")
                        .value_parser(value_parser!(u64))
                        .help("Veto window length used for every agent"),
                )
                .arg(
                    Arg::new("suspect")
                        .long("suspect")
                        .default_value("NEX")
                        .help("Carrier whose deliveries are contradicted by tracking"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("evaluate")
                .about("Show the supervision level for one action")
                .arg(
                    Arg::new("agent")
                        .long("agent")
                        .required(true)
                        .value_parser(value_parser!(AgentKind))
                        .help("paolo or giulia"),
                )
                .arg(
                    Arg::new("amount")
                        .long("amount")
                        .required(true)
                        .value_parser(value_parser!(Money))
                        .help("Amount at stake, e.g. 7500 or €7_500.00"),
                )
                .arg(
                    Arg::new("confidence")
                        .long("confidence")
                        .value_parser(value_parser!(f64))
                        .help("Agent confidence on a 0-1 scale"),
                )
                .arg(
                    Arg::new("at")
                        .long("at")
                        .value_parser(value_parser!(DateTime<Utc>))
                        .help("Evaluation time (RFC 3339); defaults to now"),
                )
                .arg(
                    Arg::new("unhealthy")
                        .long("unhealthy")
                        .action(ArgAction::SetTrue)
                        .help("Treat the supervision path as degraded"),
                )
                .arg(
                    Arg::new("json")
                        .long("json")
                        .action(ArgAction::SetTrue)
                        .help("Output as JSON"),
                ),
        )
        .subcommand(
            Command::new("config")
                .about("Print the effective configuration")
                .arg(
                    Arg::new("format")
                        .long("format")
                        .default_value("yaml")
                        .value_parser(["yaml", "toml"])
                        .help("Output format"),
                )
                .arg(
                    Arg::new("check")
                        .long("check")
                        .action(ArgAction::SetTrue)
                        .help("Only validate"),
                ),
        )
}

fn load_config(matches: &ArgMatches) -> anyhow::Result<CustosConfig> {
    match matches.get_one::<PathBuf>("config") {
        Some(path) => CustosConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => {
            let mut config = CustosConfig::default();
            config.apply_env_overrides()?;
            config.validate()?;
            Ok(config)
        }
    }
}

async fn simulate(mut config: CustosConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let suspect = args
        .get_one::<String>("suspect")
        .filter(|s| !s.is_empty())
        .cloned();
    let sim_config = SimulationConfig {
        seed: args.get_one::<u64>("seed").copied().unwrap_or(42),
        shipments: args.get_one::<usize>("shipments").copied().unwrap_or(40),
        disputes: args.get_one::<usize>("disputes").copied().unwrap_or(12),
        ledger_failure_rate: args
            .get_one::<f64>("ledger-failure-rate")
            .copied()
            .unwrap_or(0.05)
            .clamp(0.0, 1.0),
        veto_rate: args.get_one::<f64>("veto-rate").copied().unwrap_or(0.2).clamp(0.0, 1.0),
        window_secs: args.get_one::<u64>("window-secs").copied().unwrap_or(2),
        suspect_carrier: suspect,
        ..SimulationConfig::default()
    };
    sim_config.apply_to(&mut config);

    let store = sim::simulation_store();
    sim::seed_world(store.as_ref(), &sim_config).await?;
    let ports = sim::simulated_ports(&sim_config, store);
    let services = Services::bootstrap(config, ports).await?;
    let report = sim::run(&services, &sim_config).await?;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", report.render_text());
    }
    Ok(())
}

async fn evaluate(config: CustosConfig, args: &ArgMatches) -> anyhow::Result<()> {
    let agent = *args
        .get_one::<AgentKind>("agent")
        .context("--agent is required")?;
    let amount = *args.get_one::<Money>("amount").context("--amount is required")?;
    let confidence = args.get_one::<f64>("confidence").copied();
    let at = args.get_one::<DateTime<Utc>>("at").copied().unwrap_or_else(Utc::now);
    let degraded = if args.get_flag("unhealthy") { 1.0 } else { 0.0 };

    let store = match &config.policy_path {
        Some(path) => PolicyStore::with_ttl(
            Arc::new(custos_policy::FilePolicySource::new(path.clone()).with_env_overrides(true)),
            config.policy_ttl(),
        ),
        None => PolicyStore::fixed(config.policy.clone()),
    };
    let engine = GovernanceEngine::new(Arc::new(store))
        .with_health_probe(Arc::new(SimulatedHealth::new(0, degraded)));
    let decision = engine.evaluate(agent, amount, confidence, at).await;

    if args.get_flag("json") {
        println!("{}", serde_json::to_string_pretty(&decision)?);
    } else {
        println!("mode:    {}", decision.mode);
        println!("reason:  {}", decision.reason);
        if let Some(timeout) = decision.supervision_timeout {
            println!("window:  {}s", timeout.as_secs());
        }
    }
    Ok(())
}

fn show_config(config: &CustosConfig, args: &ArgMatches) -> anyhow::Result<()> {
    if args.get_flag("check") {
        println!("configuration ok");
        return Ok(());
    }
    let rendered = match args.get_one::<String>("format").map(String::as_str) {
        Some("toml") => config.to_toml()?,
        _ => config.to_yaml()?,
    };
    print!("{rendered}");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let matches = cli().get_matches();
    let config = load_config(&matches)?;
    init_tracing(&config.telemetry)?;

    match matches.subcommand() {
        Some(("simulate", args)) => simulate(config, args).await,
        Some(("evaluate", args)) => evaluate(config, args).await,
        Some(("config", args)) => show_config(&config, args),
        _ => anyhow::bail!("a subcommand is required"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn evaluate_parses_money_and_agent() {
        let matches = cli()
            .try_get_matches_from(["custos", "evaluate", "--agent", "paolo", "--amount", "7500"])
            .unwrap();
        let (_, args) = matches.subcommand().unwrap();
        assert_eq!(args.get_one::<AgentKind>("agent"), Some(&AgentKind::Paolo));
        assert_eq!(args.get_one::<Money>("amount"), Some(&Money::from_euros(7_500)));
    }
}
