use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;

use anyhow::Context;
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use mitmlearn_core::{
    EngineConfig, Learner, LearningEngine, ReplayLearner, ResourceGuard, SessionLog,
    SysinfoProbe, TcpLearner,
};
use mitmlearn_explore::{InteractionEncoder, NoSut, PointHandlers};
use mitmlearn_fuzz::{registry, HistoryLog, SymbolTable};
use mitmlearn_transport::{HookBridge, InterceptionHub};
use tracing::{info, trace};
use tracing_subscriber::{filter, prelude::*};

fn cli() -> Command {
    Command::new("mitmlearn")
        .about("Answers automata learning queries by steering intercepted traffic")
        .subcommand_required(true)
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbosity")
                .num_args(0..=1)
                .require_equals(true)
                .value_parser(["warn", "info", "debug", "trace"])
                .default_missing_value("info"),
        )
        .subcommand(
            Command::new("run")
                .about("serve a learner until it disconnects")
                .arg(
                    Arg::new("config")
                        .short('c')
                        .long("config")
                        .required(true)
                        .value_parser(value_parser!(PathBuf)),
                )
                .arg(
                    Arg::new("resume")
                        .long("resume")
                        .action(ArgAction::SetTrue)
                        .help("replay the previous log before serving new queries"),
                )
                .arg(
                    Arg::new("replay")
                        .long("replay")
                        .value_parser(value_parser!(PathBuf))
                        .help("take queries from the first column of a CSV file instead of a learner"),
                )
                .arg(
                    Arg::new("load-alphabet")
                        .long("load-alphabet")
                        .action(ArgAction::SetTrue)
                        .help("start from the output alphabet stored in the log directory"),
                ),
        )
}

fn setup_logging(matches: &ArgMatches) {
    let level = match matches
        .try_get_one::<String>("verbosity")
        .ok()
        .flatten()
        .map(|m| m.as_str())
    {
        Some("trace") => filter::LevelFilter::TRACE,
        Some("debug") => filter::LevelFilter::DEBUG,
        Some("warn") => filter::LevelFilter::WARN,
        _ => filter::LevelFilter::INFO,
    };

    let stderr_log = tracing_subscriber::fmt::layer()
        .pretty()
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(stderr_log.with_filter(level))
        .init();

    trace!("setup {level} logging");
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    let config_path = matches
        .get_one::<PathBuf>("config")
        .context("missing --config")?;
    let resume = matches.get_flag("resume");
    let config = EngineConfig::load(config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    let dir = config.log_dir.clone();
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    // Read replay queries before a resumed log truncates log.csv.
    let replay = matches
        .get_one::<PathBuf>("replay")
        .map(|path| ReplayLearner::from_csv(path))
        .transpose()?;

    let (hub, transport) = InterceptionHub::start(config.hub_config());
    let hooks = TcpListener::bind(("localhost", config.hook_port))
        .with_context(|| format!("binding hook port {}", config.hook_port))?;
    HookBridge::new(
        config
            .interception_points
            .keys()
            .map(|name| hub.point(name.clone())),
    )
    .spawn(hooks);

    let mut points = BTreeMap::new();
    for (name, names) in &config.interception_points {
        points.insert(
            name.clone(),
            PointHandlers {
                parser: registry::parser(&names.parser)?,
                fuzzer: registry::fuzzer(&names.fuzzer)?,
            },
        );
    }
    let table = if resume || matches.get_flag("load-alphabet") {
        SymbolTable::load(&dir).context("loading output alphabet")?
    } else {
        SymbolTable::persistent(&dir)
    };
    let table = if config.symbol_ids {
        table
    } else {
        table.verbatim()
    };
    let encoder = InteractionEncoder::new(transport, points, table, config.encoder_config())?
        .with_history_log(HistoryLog::open(&dir, resume)?);

    let learner: Box<dyn Learner> = match replay {
        Some(replay) => Box::new(replay),
        None => Box::new(TcpLearner::accept(config.learner_port)?),
    };
    let log = SessionLog::open(&dir, resume)?;
    let guard = ResourceGuard::new(config.resource_limits.clone(), SysinfoProbe::new(&dir));

    let mut engine = LearningEngine::new(&config, encoder, log, learner, Box::new(NoSut), guard)?;
    let stats = engine.run()?;
    info!(
        queries = stats.queries,
        cache_hits = stats.cache_hits(),
        "learning run finished"
    );
    hub.shutdown();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let matches = cli().get_matches();

    setup_logging(&matches);

    match matches.subcommand() {
        Some(("run", sub_matches)) => run(sub_matches),
        _ => unreachable!(),
    }
}
