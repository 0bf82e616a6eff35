use anyhow::Context;
use clap::{Arg, ArgMatches, Command};
use log::LevelFilter;
use phish_sieve::inbound::{compose_scan_reply, hash_email, InboundHandler};
use phish_sieve::{
    Classifier, Config, EmailPipeline, LinearModel, MemoryStore, SqliteStore, StatEvent, StatisticsCollector,
    UserDirectory, WhitelistSet,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("phish-sieve")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Normalizes forwarded emails and classifies them as phishing or legitimate")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value(Config::default_path()),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Validate the configuration and model, then exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("whitelist")
                .long("whitelist")
                .value_name("DOMAIN")
                .help("Additional domain to whitelist (repeatable)")
                .action(clap::ArgAction::Append),
        )
        .arg(
            Arg::new("no-whitelist")
                .long("no-whitelist")
                .help("Disable domain whitelisting entirely")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("model")
                .long("model")
                .value_name("FILE")
                .help("Model file to load instead of system.model_path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("database")
                .long("database")
                .value_name("FILE")
                .help("Database file to use instead of system.database_path")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable debug logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("test-email")
                .long("test-email")
                .value_name("FILE")
                .help("Run the full pipeline on an email file using an in-memory store")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("sender")
                .long("sender")
                .value_name("ADDR")
                .help("Envelope sender for --test-email and --process")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("user-id")
                .long("user-id")
                .value_name("N")
                .help("User id for --test-email")
                .value_parser(clap::value_parser!(i64))
                .default_value("1"),
        )
        .arg(
            Arg::new("add-user")
                .long("add-user")
                .value_name("EMAIL")
                .help("Register a forwarding address")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("trust-domain")
                .long("trust-domain")
                .value_names(["USER_ID", "DOMAIN"])
                .num_args(2)
                .help("Mark a domain as trusted for a user")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("history")
                .long("history")
                .value_name("USER_ID")
                .help("Show recent verdicts for a user")
                .value_parser(clap::value_parser!(i64))
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("limit")
                .long("limit")
                .value_name("N")
                .help("Number of entries shown by --history")
                .value_parser(clap::value_parser!(usize))
                .default_value("20"),
        )
        .arg(
            Arg::new("process")
                .long("process")
                .value_name("DIR")
                .help("Process every .eml file in a directory for a registered --sender")
                .action(clap::ArgAction::Set),
        )
        .get_matches();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        match Config::generate(generate_path) {
            Ok(()) => {
                println!("Default configuration written to: {generate_path}");
                println!("Please edit the configuration file to suit your needs.");
            }
            Err(e) => {
                eprintln!("Error writing configuration file: {e:#}");
                process::exit(1);
            }
        }
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or(Config::default_path());
    let (config, config_found) = match load_config(config_path, &matches) {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            process::exit(1);
        }
    };

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        config.log_level_filter().unwrap_or(LevelFilter::Info)
    };
    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if !config_found {
        log::warn!("Configuration file '{config_path}' not found, using default configuration");
    }

    let result = if matches.get_flag("test-config") {
        test_config(&config, &matches)
    } else if let Some(email_file) = matches.get_one::<String>("test-email") {
        test_email_file(&config, &matches, email_file).await
    } else if let Some(email) = matches.get_one::<String>("add-user") {
        add_user(&config, email).await
    } else if let Some(values) = matches.get_many::<String>("trust-domain") {
        let values: Vec<&String> = values.collect();
        trust_domain(&config, values[0], values[1]).await
    } else if let Some(user_id) = matches.get_one::<i64>("history") {
        let limit = matches.get_one::<usize>("limit").copied().unwrap_or(20);
        show_history(&config, *user_id, limit).await
    } else if let Some(dir) = matches.get_one::<String>("process") {
        process_directory(&config, &matches, dir).await
    } else {
        eprintln!("Nothing to do: pass --test-email, --process or a maintenance command (see --help)");
        process::exit(2);
    };

    if let Err(e) = result {
        log::error!("{e:#}");
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

/// Load the config file (defaults when it does not exist) and apply the
/// `--model`/`--database` overrides.
fn load_config(path: &str, matches: &ArgMatches) -> anyhow::Result<(Config, bool)> {
    let found = Path::new(path).exists();
    let mut config = if found {
        Config::load_from_file(path)?
    } else {
        Config::default()
    };

    if let Some(model) = matches.get_one::<String>("model") {
        config.system.model_path = model.clone();
    }
    if let Some(database) = matches.get_one::<String>("database") {
        config.system.database_path = database.clone();
    }
    Ok((config, found))
}

fn build_whitelist(config: &Config, matches: &ArgMatches) -> WhitelistSet {
    if matches.get_flag("no-whitelist") {
        return WhitelistSet::disabled();
    }
    let extra: Vec<String> = matches
        .get_many::<String>("whitelist")
        .map(|values| values.cloned().collect())
        .unwrap_or_default();
    config.whitelist(&extra)
}

fn load_model(config: &Config) -> anyhow::Result<LinearModel> {
    let model = LinearModel::load(config.model_path())?;
    Ok(match &config.system.model_version {
        Some(version) => model.with_version(version.clone()),
        None => model,
    })
}

fn build_pipeline(config: &Config, matches: &ArgMatches) -> anyhow::Result<EmailPipeline> {
    let whitelist = Arc::new(build_whitelist(config, matches));
    log::info!("Whitelisted domains: {} trusted senders", whitelist.len());
    let classifier: Arc<dyn Classifier> = Arc::new(load_model(config)?);
    Ok(EmailPipeline::new(whitelist, classifier).with_timeouts(config.timeouts()))
}

fn test_config(config: &Config, matches: &ArgMatches) -> anyhow::Result<()> {
    println!("🔍 Testing configuration...");
    println!();
    config.validate()?;
    println!("Model path:      {}", config.system.model_path);
    println!("Database path:   {}", config.system.database_path);
    println!(
        "Timeouts:        classifier {}ms, store {}ms",
        config.timeouts.classifier_ms, config.timeouts.store_ms
    );
    println!("Scan replies:    {}", if config.reply.enabled { "enabled" } else { "disabled" });

    let whitelist = build_whitelist(config, matches);
    println!("Whitelist:       {} domains", whitelist.len());
    for domain in whitelist.domains() {
        println!("  • {domain}");
    }

    let model = load_model(config)?;
    println!("Model version:   {}", model.version());
    println!("✅ Configuration is valid");
    Ok(())
}

async fn test_email_file(config: &Config, matches: &ArgMatches, email_file: &str) -> anyhow::Result<()> {
    println!("🧪 Testing email file: {email_file}");
    println!();

    let raw = std::fs::read(email_file).with_context(|| format!("Error reading email file {email_file}"))?;
    let sender = matches
        .get_one::<String>("sender")
        .cloned()
        .unwrap_or_else(|| "tester@localhost".to_string());
    let user_id = matches.get_one::<i64>("user-id").copied().unwrap_or(1);

    let pipeline = build_pipeline(config, matches)?;
    let content = pipeline.preprocess(&raw)?;

    println!("📧 Extracted content:");
    println!("   Original sender:  {}", content.original_sender.as_deref().unwrap_or("(none)"));
    println!("   Original subject: {}", content.original_subject);
    println!("   Forward rule:     {}", content.forward_rule.as_deref().unwrap_or("(none)"));
    println!("   Canonical subject: {}", content.subject);
    println!("   Canonical body:    {}", truncate_string(&content.body, 400));
    println!();

    let store = MemoryStore::new();
    let statistics = StatisticsCollector::new();
    let processed = pipeline.process(&raw, &sender, user_id, &store).await?;
    statistics.record_event(StatEvent::Verdict(processed.verdict.clone()));

    let verdict = &processed.verdict;
    println!("🎯 Verdict:");
    println!("   Effective sender:     {}", processed.effective_sender);
    println!("   Label:                {}", verdict.predicted_label);
    println!("   Phishing probability: {:.2}%", verdict.phishing_probability * 100.0);
    println!("   Risk level:           {}", verdict.risk_level);
    println!("   Reason:               {}", verdict.reason);
    if verdict.is_degenerate() {
        println!("   ⚠️  Too little content to score, verdict is low-confidence");
    }
    println!();

    if config.reply.enabled {
        let reply = compose_scan_reply(
            &config.reply.from_address,
            &sender,
            &processed.content.original_subject,
            verdict,
        );
        println!("✉️  Scan reply to {}: {}", reply.to, reply.subject);
        println!("{}", reply.body);
        println!();
    }

    statistics.print_summary();
    Ok(())
}

async fn add_user(config: &Config, email: &str) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.system.database_path)?;
    let user = store.create_user(&hash_email(email)).await?;
    println!("✅ Registered {} as user {}", email.trim().to_lowercase(), user.id);
    Ok(())
}

async fn trust_domain(config: &Config, user_id: &str, domain: &str) -> anyhow::Result<()> {
    let user_id: i64 = user_id
        .parse()
        .with_context(|| format!("Invalid user id '{user_id}'"))?;
    let store = SqliteStore::open(&config.system.database_path)?;
    store.add_trusted_domain(user_id, domain).await?;
    println!("✅ {} is now trusted for user {}", domain.trim().to_lowercase(), user_id);
    Ok(())
}

async fn show_history(config: &Config, user_id: i64, limit: usize) -> anyhow::Result<()> {
    let store = SqliteStore::open(&config.system.database_path)?;
    let records = store.user_predictions(user_id, limit).await?;
    if records.is_empty() {
        println!("No verdicts recorded for user {user_id}");
        return Ok(());
    }

    println!("📊 Last {} verdicts for user {}", records.len(), user_id);
    println!("═══════════════════════════════════════");
    for record in records {
        println!(
            "{}  {:<24} {:<10} {:>6.2}%  {:<6} {}{}",
            record.received_at.format("%Y-%m-%d %H:%M:%S"),
            truncate_string(&record.sender_domain, 24),
            record.verdict.predicted_label,
            record.verdict.phishing_probability * 100.0,
            record.verdict.risk_level,
            record.verdict.reason,
            if record.is_forwarded { " (forwarded)" } else { "" }
        );
    }
    Ok(())
}

/// Process every `.eml` file in `dir` concurrently, each as its own message.
async fn process_directory(config: &Config, matches: &ArgMatches, dir: &str) -> anyhow::Result<()> {
    let sender = matches
        .get_one::<String>("sender")
        .cloned()
        .context("--process requires --sender")?;

    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Cannot read directory {dir}"))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().map(|ext| ext == "eml").unwrap_or(false))
        .collect();
    files.sort();

    let pipeline = Arc::new(build_pipeline(config, matches)?);
    let store = Arc::new(SqliteStore::open(&config.system.database_path)?);
    let statistics = Arc::new(StatisticsCollector::new());
    let handler = Arc::new(InboundHandler::new(
        pipeline,
        store,
        statistics.clone(),
        config.reply_settings(),
        config.timeouts().store,
    ));

    let mut tasks = tokio::task::JoinSet::new();
    for path in files {
        let handler = Arc::clone(&handler);
        let sender = sender.clone();
        tasks.spawn(async move {
            let outcome = match tokio::fs::read(&path).await {
                Ok(raw) => Some(handler.handle(&sender, &raw).await),
                Err(e) => {
                    log::error!("Cannot read {}: {}", path.display(), e);
                    None
                }
            };
            (path, outcome)
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let (path, outcome) = joined.context("processing task panicked")?;
        let Some(outcome) = outcome else { continue };
        match &outcome.processed {
            Some(processed) => println!(
                "{}: {} [{}] {}",
                path.display(),
                outcome.response,
                processed.verdict.risk_level,
                processed.verdict.predicted_label
            ),
            None => println!("{}: {}", path.display(), outcome.response),
        }
        if let Some(reply) = outcome.reply {
            log::info!("Scan reply ready for {}: {}", reply.to, reply.subject);
        }
    }

    statistics.log_summary();
    statistics.print_summary();
    Ok(())
}

fn truncate_string(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{kept}...")
    }
}
