//! Thin CLI layer: parse args, styled output, and call into patterns-core.
//! Crash-proof: panic caught and reported; all errors return Result.

mod server;
mod utils;

use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::{ColoredString, Colorize};
use indicatif::{ProgressBar, ProgressStyle};
use patterns_core::{
    clear_all, load_settings, save_setting, FavoriteAction, Pattern, PatternQuery, Services,
    Settings, SettingsChange,
};
use serde::Serialize;
use std::env;
use std::io::IsTerminal;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

// Colors only when stdout is a TTY and NO_COLOR is unset.

fn use_color() -> bool {
    std::io::stdout().is_terminal()
        && env::var("NO_COLOR").unwrap_or_default().is_empty()
}

fn paint(msg: &str, style: fn(&str) -> ColoredString) -> String {
    if use_color() {
        style(msg).to_string()
    } else {
        msg.to_string()
    }
}

fn success(msg: &str) {
    println!("{}", paint(msg, |m| m.green()));
}

fn info(msg: &str) {
    println!("{}", paint(msg, |m| m.cyan()));
}

fn dim(msg: &str) {
    println!("{}", paint(msg, |m| m.dimmed()));
}

fn warning(msg: &str) {
    eprintln!("{}", paint(msg, |m| m.yellow()));
}

fn error(msg: &str) {
    eprintln!("{}", paint(msg, |m| m.red()));
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let out = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", out);
    Ok(())
}

/// Run a long-running task; in quiet mode show a spinner until done.
fn run_with_spinner<T, F>(message: &str, quiet: bool, f: F) -> Result<T, String>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, String> + Send + 'static,
{
    if !quiet {
        info(message);
        return f();
    }
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner()
        .tick_chars("⠁⠂⠄⠈⠐⠠⠰⠸⠹")
        .template("{spinner:.dim} {msg}")
    {
        spinner.set_style(style);
    }
    spinner.set_message(message.to_string());
    let mut elapsed = Duration::ZERO;
    let timeout = Duration::from_secs(600);
    let tick = Duration::from_millis(80);
    loop {
        match rx.try_recv() {
            Ok(res) => {
                spinner.finish_and_clear();
                return res;
            }
            Err(mpsc::TryRecvError::Disconnected) => {
                spinner.finish_and_clear();
                return Err("Operation failed.".to_string());
            }
            Err(mpsc::TryRecvError::Empty) => {}
        }
        if elapsed >= timeout {
            spinner.finish_and_clear();
            return Err("Operation timed out.".to_string());
        }
        spinner.tick();
        thread::sleep(tick);
        elapsed += tick;
    }
}

fn open_services(settings: Settings) -> Result<Arc<Services>, String> {
    Services::open(settings)
        .map(Arc::new)
        .map_err(|e| format!("Could not open data dir: {}", e))
}

fn print_patterns(list: &[Pattern]) {
    if list.is_empty() {
        dim("No patterns.");
        return;
    }
    for p in list {
        let cats: Vec<String> = p
            .categories
            .iter()
            .filter_map(|t| t.slug().map(str::to_string))
            .collect();
        if cats.is_empty() {
            println!("#{:<6} {}", p.id, p.title);
        } else {
            println!("#{:<6} {}  [{}]", p.id, p.title, utils::summarize(&cats, 3));
        }
    }
}

fn listing_args(sub: &ArgMatches) -> PatternQuery {
    PatternQuery {
        per_page: sub.get_one::<u32>("per-page").copied(),
        page: sub.get_one::<u32>("page").copied(),
        orderby: sub.get_one::<String>("orderby").cloned(),
        order: sub.get_one::<String>("order").cloned(),
        category: sub
            .get_many::<u64>("category")
            .map(|v| v.copied().collect())
            .unwrap_or_default(),
        kind: sub
            .get_many::<u64>("type")
            .map(|v| v.copied().collect())
            .unwrap_or_default(),
    }
}

/// Paging, sort and filter flags shared by `patterns list` and `patterns search`.
fn listing_flags() -> [Arg; 6] {
    [
        Arg::new("per-page")
            .long("per-page")
            .value_parser(clap::value_parser!(u32))
            .help("Page size"),
        Arg::new("page")
            .long("page")
            .value_parser(clap::value_parser!(u32))
            .help("Page number"),
        Arg::new("orderby").long("orderby").help("date, title, popular, ..."),
        Arg::new("order")
            .long("order")
            .value_parser(["ASC", "DESC", "asc", "desc"])
            .help("Sort direction"),
        Arg::new("category")
            .long("category")
            .action(ArgAction::Append)
            .value_parser(clap::value_parser!(u64))
            .help("Category id (repeatable)"),
        Arg::new("type")
            .long("type")
            .action(ArgAction::Append)
            .value_parser(clap::value_parser!(u64))
            .help("Type id (repeatable)"),
    ]
}

fn json_flag() -> Arg {
    Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output JSON")
}

fn user_arg() -> Arg {
    Arg::new("user")
        .long("user")
        .required(true)
        .help("Favorites owner (same name the proxy token maps to)")
}

fn id_arg() -> Arg {
    Arg::new("id")
        .required(true)
        .value_parser(clap::value_parser!(u64))
        .help("Pattern id")
}

fn cli() -> Command {
    Command::new("patterns-proxy")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Caching proxy for a remote pattern catalog: warmup, dependency readiness, media sideload")
        .after_help(
            "Examples:\n  \
             patterns-proxy serve --bind 127.0.0.1:8787\n  \
             patterns-proxy sync --extended\n  \
             patterns-proxy patterns list --category 5 --per-page 18\n  \
             patterns-proxy deps status --no-cache\n  \
             patterns-proxy config set apiBase https://catalog.example.com/wp-json/patterns/v1",
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .global(true)
                .action(ArgAction::SetTrue)
                .help("Minimal output"),
        )
        .subcommand(
            Command::new("serve")
                .about("Run the local proxy with background warmup and dependency checks")
                .arg(Arg::new("bind").long("bind").help("Listen address (default from settings)")),
        )
        .subcommand(
            Command::new("sync")
                .about("Warm the cache now")
                .arg(
                    Arg::new("extended")
                        .long("extended")
                        .action(ArgAction::SetTrue)
                        .help("Also prefetch compact listings up to maxRegister"),
                )
                .arg(
                    Arg::new("force")
                        .long("force")
                        .action(ArgAction::SetTrue)
                        .help("Sync even if the last sync is still fresh"),
                ),
        )
        .subcommand(
            Command::new("cache")
                .about("Manage the response cache")
                .subcommand(Command::new("clear").about("Remove every cached response and cooldown"))
                .subcommand(Command::new("purge").about("Remove expired entries only")),
        )
        .subcommand(Command::new("test").about("Check that the remote catalog answers"))
        .subcommand(
            Command::new("deps")
                .about("Required plugin dependencies")
                .subcommand(
                    Command::new("status")
                        .about("Show which dependencies are installed and active")
                        .arg(
                            Arg::new("no-cache")
                                .long("no-cache")
                                .action(ArgAction::SetTrue)
                                .help("Recompute instead of using the cached status"),
                        )
                        .arg(json_flag()),
                )
                .subcommand(
                    Command::new("install")
                        .about("Install and activate missing dependencies")
                        .arg(
                            Arg::new("slugs")
                                .num_args(0..)
                                .help("Only these slugs (default: all required)"),
                        )
                        .arg(json_flag()),
                ),
        )
        .subcommand(
            Command::new("patterns")
                .about("Browse the catalog through the cache")
                .subcommand(
                    Command::new("list")
                        .about("List patterns")
                        .args(listing_flags())
                        .arg(json_flag()),
                )
                .subcommand(
                    Command::new("search")
                        .about("Search patterns")
                        .arg(Arg::new("q").required(true).help("Search text"))
                        .args(listing_flags())
                        .arg(json_flag()),
                )
                .subcommand(Command::new("show").about("Show one pattern as JSON").arg(id_arg()))
                .subcommand(
                    Command::new("import")
                        .about("Ask the catalog to import a pattern (never cached)")
                        .arg(id_arg()),
                ),
        )
        .subcommand(
            Command::new("favorites")
                .about("Per-user favorite pattern ids")
                .subcommand(Command::new("list").about("List favorites").arg(user_arg()))
                .subcommand(Command::new("add").about("Add a favorite").arg(user_arg()).arg(id_arg()))
                .subcommand(
                    Command::new("remove")
                        .about("Remove a favorite")
                        .arg(user_arg())
                        .arg(id_arg()),
                ),
        )
        .subcommand(
            Command::new("registrations")
                .about("Print the category and pattern registrations an editor would load"),
        )
        .subcommand(
            Command::new("config")
                .about("Show or change settings (.patternsrc in the current directory)")
                .subcommand(Command::new("show").about("Print effective settings, secrets masked"))
                .subcommand(
                    Command::new("set")
                        .about("Persist one setting")
                        .arg(Arg::new("key").required(true).help("e.g. apiBase, cacheTtl, authToken"))
                        .arg(Arg::new("value").required(true).help("New value")),
                ),
        )
}

fn run() -> Result<(), String> {
    let matches = cli().get_matches();
    let quiet = matches.get_flag("quiet");
    let cwd = env::current_dir().map_err(|e| e.to_string())?;
    let mut settings = load_settings(&cwd);
    let _log_guard = utils::init_logging(&settings.data_dir, quiet);

    if let Some(("config", sub)) = matches.subcommand() {
        match sub.subcommand() {
            Some(("set", m)) => {
                let key = m.get_one::<String>("key").map(String::as_str).unwrap_or_default();
                let value = m.get_one::<String>("value").map(String::as_str).unwrap_or_default();
                save_setting(&cwd, key, value).map_err(|e| e.to_string())?;
                success(&format!("Saved {} to {}.", key, cwd.join(patterns_core::config::RC_FILE).display()));
                // Run the update through a live handle so endpoint or identity
                // changes clear the cache the same way the server would.
                let services = open_services(settings)?;
                let reloaded = load_settings(&cwd);
                let changes = services.settings.update(|s| *s = reloaded);
                if changes
                    .iter()
                    .any(|c| matches!(c, SettingsChange::ApiBase | SettingsChange::AuthToken))
                {
                    info("Endpoint or token changed; cache cleared.");
                }
            }
            _ => print_json(&settings.redacted())?,
        }
        return Ok(());
    }

    if let Some(("cache", sub)) = matches.subcommand() {
        let services = open_services(settings)?;
        match sub.subcommand() {
            Some(("purge", _)) => {
                let n = services.store.purge_expired();
                success(&format!("Purged {} expired entries.", n));
            }
            Some(("clear", _)) => {
                let n = clear_all(services.store.as_ref());
                success(&format!("Cleared {} entries.", n));
            }
            _ => {
                dim("Use `patterns-proxy cache clear` or `patterns-proxy cache purge`.");
            }
        }
        return Ok(());
    }

    match matches.subcommand() {
        Some(("serve", sub)) => {
            if let Some(bind) = sub.get_one::<String>("bind") {
                settings.bind = bind.clone();
            }
            let bind = settings.bind.clone();
            if settings.users.is_empty() {
                warning("No proxy users configured; only public routes will answer.");
            }
            let services = open_services(settings)?;
            let scheduler = services.start_scheduler();
            let state = server::AppState::new(services, Some(scheduler));
            if !quiet {
                info(&format!("Serving on http://{}{}", bind, server::API_PREFIX));
            }
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .map_err(|e| format!("Could not start runtime: {}", e))?;
            runtime.block_on(server::serve(state, &bind))?;
        }
        Some(("sync", sub)) => {
            let services = open_services(settings)?;
            let force = sub.get_flag("force");
            if !force && !services.warmer.should_sync() {
                dim("Cache is fresh; nothing to do. Use --force to sync anyway.");
            } else {
                let s = services.clone();
                let report = run_with_spinner("Warming cache…", quiet, move || {
                    let report = s.warmer.run_sync();
                    s.warmer.mark_synced();
                    Ok(report)
                })?;
                success(&format!(
                    "Synced {} categories, {} types, {} latest, {} popular.",
                    report.categories, report.types, report.latest, report.popular
                ));
            }
            if sub.get_flag("extended") {
                let s = services.clone();
                let report = run_with_spinner("Prefetching listings…", quiet, move || {
                    s.warmer.run_extended().map_err(|e| e.to_string())
                })?;
                success(&format!(
                    "Prefetched {} patterns over {} pages.",
                    report.fetched, report.pages
                ));
            }
        }
        Some(("test", _)) => {
            let services = open_services(settings)?;
            let base = services.settings.api_base();
            let report = run_with_spinner(&format!("Testing {}…", base), quiet, move || {
                Ok(services.api.test_connectivity())
            })?;
            if report.ok {
                success(&format!("OK ({}) {}", report.code, base));
            } else {
                return Err(format!(
                    "Catalog unreachable: {} (code {})",
                    report.message, report.code
                ));
            }
        }
        Some(("deps", sub)) => {
            let services = open_services(settings)?;
            match sub.subcommand() {
                Some(("install", m)) => {
                    let slugs: Vec<String> = m
                        .get_many::<String>("slugs")
                        .map(|v| v.cloned().collect())
                        .unwrap_or_default();
                    let s = services.clone();
                    let report = run_with_spinner("Ensuring dependencies…", quiet, move || {
                        Ok(s.resolver.ensure_all_ready(&slugs))
                    })?;
                    if m.get_flag("json") {
                        print_json(&report)?;
                    } else {
                        for r in &report.results {
                            if r.error.is_empty() {
                                success(&format!("{}: installed, active", r.slug));
                            } else {
                                warning(&format!("{}: {}", r.slug, r.error));
                            }
                        }
                    }
                    if !report.status.all_ready {
                        return Err("Some dependencies are still not ready.".to_string());
                    }
                }
                Some((_, m)) => {
                    let fresh = m.try_get_one::<bool>("no-cache").ok().flatten().copied().unwrap_or(false);
                    let status = if fresh {
                        services.resolver.refresh_status()
                    } else {
                        services.resolver.get_status()
                    };
                    if m.try_get_one::<bool>("json").ok().flatten().copied().unwrap_or(false) {
                        print_json(&status)?;
                    } else if status.required.is_empty() {
                        dim("No dependencies required.");
                    } else {
                        for d in &status.required {
                            let state = match (d.installed, d.active) {
                                (true, true) => "ready",
                                (true, false) => "inactive",
                                _ => "missing",
                            };
                            println!("{:<24} {:<10} {}", d.slug, state, d.name);
                        }
                    }
                    if status.all_ready {
                        success("All dependencies ready.");
                    }
                }
                None => dim("Use `patterns-proxy deps status` or `patterns-proxy deps install`."),
            }
        }
        Some(("patterns", sub)) => {
            let services = open_services(settings)?;
            match sub.subcommand() {
                Some(("list", m)) => {
                    let list = services.api.get_patterns(&listing_args(m));
                    if m.get_flag("json") {
                        print_json(&list)?;
                    } else {
                        print_patterns(&list);
                    }
                }
                Some(("search", m)) => {
                    let q = m.get_one::<String>("q").map(String::as_str).unwrap_or_default();
                    let list = services.api.search(q, &listing_args(m));
                    if m.get_flag("json") {
                        print_json(&list)?;
                    } else {
                        print_patterns(&list);
                    }
                }
                Some(("show", m)) => {
                    let id = m.get_one::<u64>("id").copied().unwrap_or_default();
                    match services.api.get_pattern(id) {
                        Some(p) => print_json(&p)?,
                        None => return Err(format!("Pattern {} not found.", id)),
                    }
                }
                Some(("import", m)) => {
                    let id = m.get_one::<u64>("id").copied().unwrap_or_default();
                    let result = services.api.import_pattern(id);
                    if result.as_object().map(|o| o.is_empty()).unwrap_or(true) {
                        return Err(format!("Import of pattern {} failed.", id));
                    }
                    print_json(&result)?;
                }
                _ => dim("Use `patterns-proxy patterns --help` for subcommands."),
            }
        }
        Some(("favorites", sub)) => {
            let services = open_services(settings)?;
            let (action, m) = match sub.subcommand() {
                Some(("add", m)) => (Some(FavoriteAction::Add), m),
                Some(("remove", m)) => (Some(FavoriteAction::Remove), m),
                Some((_, m)) => (None, m),
                None => {
                    dim("Use `patterns-proxy favorites list --user NAME`.");
                    return Ok(());
                }
            };
            let user = m.get_one::<String>("user").map(String::as_str).unwrap_or_default();
            let list = match action {
                Some(a) => {
                    let id = m.get_one::<u64>("id").copied().unwrap_or_default();
                    services
                        .favorites
                        .update(user, a, id)
                        .map_err(|e| e.to_string())?
                }
                None => services.favorites.get(user),
            };
            print_json(&list)?;
        }
        Some(("registrations", _)) => {
            let services = open_services(settings)?;
            let max = services.settings.max_register();
            let regs = patterns_core::registration::collect(&services.api, max);
            print_json(&regs)?;
        }
        _ => {
            if use_color() {
                println!("{}", "patterns-proxy".bright_cyan().bold());
                dim("Caching proxy for a remote pattern catalog.");
            } else {
                println!("patterns-proxy: caching proxy for a remote pattern catalog");
            }
            dim("\nRun `patterns-proxy --help` for details.");
        }
    }

    Ok(())
}

fn main() {
    if !use_color() {
        colored::control::set_override(false);
    }

    let code = match std::panic::catch_unwind(run) {
        Ok(Ok(())) => 0,
        Ok(Err(e)) => {
            error(&e);
            1
        }
        Err(_) => {
            error("An unexpected error occurred. Please report this issue.");
            1
        }
    };
    std::process::exit(code);
}
