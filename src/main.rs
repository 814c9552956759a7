use anyhow::{anyhow, bail, Context, Result};
use chromesmith::{App, AppConfig, ModEntry, Placement, RecoverAction, UpdateStatus};
use std::{env, path::PathBuf};
use tracing_subscriber::EnvFilter;

const USAGE: &str = "\
chromesmith --chrome-dir <path> <command>

Commands:
  install <ref> [--direct | --subfolder <name>]   Import a file, folder, URL or GitHub repo
  list                                            Show installed mods
  check [ids...]                                  Look for updates
  update <id>                                     Update one mod
  update-all                                      Update every mod with a newer version
  enable <id> | disable <id>                      Switch a mod on or off
  remove <id>                                     Delete a mod and its files
  verify                                          Compare installed files with the registry
  repair <id>                                     Finish an interrupted removal
  recover [--restore | --discard]                 List or resolve interrupted updates
  sync                                            Rewrite the userChrome.css import list

Set CHROMESMITH_LOG (e.g. debug) to change log verbosity.";

#[derive(Debug)]
enum Command {
    Install {
        reference: String,
        placement: Option<Placement>,
    },
    List,
    Check(Vec<String>),
    Update(String),
    UpdateAll,
    Toggle(String, bool),
    Remove(String),
    Verify,
    Repair(String),
    Recover(Option<RecoverAction>),
    Sync,
}

impl Command {
    fn mutates(&self) -> bool {
        !matches!(
            self,
            Command::List | Command::Check(_) | Command::Verify | Command::Recover(None) | Command::Sync
        )
    }
}

fn main() -> Result<()> {
    init_tracing();

    let mut args = env::args().skip(1);
    let mut chrome_dir = None;
    let mut rest = Vec::new();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--chrome-dir" | "-c" => {
                let path = args.next().context("--chrome-dir requires a path")?;
                chrome_dir = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("{USAGE}");
                return Ok(());
            }
            _ => rest.push(arg),
        }
    }
    if rest.is_empty() {
        println!("{USAGE}");
        return Ok(());
    }
    let command = parse_command(rest)?;
    let chrome_dir = chrome_dir
        .or_else(|| env::var_os("CHROMESMITH_CHROME_DIR").map(PathBuf::from))
        .context("missing --chrome-dir <path>")?;

    let config = AppConfig::load_or_create()?;
    let app = App::open(config, &chrome_dir)?;
    let pending = app.pending_recovery();
    if !pending.interrupted_updates.is_empty() && !matches!(command, Command::Recover(_)) {
        println!(
            "warning: {} interrupted update(s) found; run `recover` to review them",
            pending.interrupted_updates.len()
        );
    }
    for id in &pending.inconsistent {
        println!("warning: {id} was not fully removed; run `repair {id}`");
    }
    let mutates = command.mutates();
    let outcome = run(&app, command);
    if mutates && app.sync_imports()? {
        println!("Updated userChrome.css");
    }
    outcome
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("CHROMESMITH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn parse_command(args: Vec<String>) -> Result<Command> {
    let mut args = args.into_iter();
    let name = args.next().ok_or_else(|| anyhow!("missing command"))?;
    let command = match name.as_str() {
        "install" | "import" => {
            let mut reference = None;
            let mut placement = None;
            while let Some(arg) = args.next() {
                match arg.as_str() {
                    "--direct" => placement = Some(Placement::Direct),
                    "--subfolder" => {
                        let folder = args.next().context("--subfolder requires a name")?;
                        placement = Some(Placement::Subfolder(folder));
                    }
                    _ if reference.is_none() => reference = Some(arg),
                    _ => bail!("unexpected argument '{arg}'"),
                }
            }
            Command::Install {
                reference: reference.context("install requires a reference")?,
                placement,
            }
        }
        "list" | "ls" => Command::List,
        "check" => Command::Check(args.by_ref().collect()),
        "update" => Command::Update(required_id(&mut args, "update")?),
        "update-all" => Command::UpdateAll,
        "enable" => Command::Toggle(required_id(&mut args, "enable")?, true),
        "disable" => Command::Toggle(required_id(&mut args, "disable")?, false),
        "remove" | "rm" => Command::Remove(required_id(&mut args, "remove")?),
        "verify" => Command::Verify,
        "repair" => Command::Repair(required_id(&mut args, "repair")?),
        "recover" => match args.next().as_deref() {
            None => Command::Recover(None),
            Some("--restore") => Command::Recover(Some(RecoverAction::Restore)),
            Some("--discard") => Command::Recover(Some(RecoverAction::Discard)),
            Some(other) => bail!("unknown recover option '{other}'"),
        },
        "sync" => Command::Sync,
        other => bail!("unknown command '{other}'\n\n{USAGE}"),
    };
    if let Some(extra) = args.next() {
        bail!("unexpected argument '{extra}'");
    }
    Ok(command)
}

fn required_id(args: &mut impl Iterator<Item = String>, command: &str) -> Result<String> {
    args.next().with_context(|| format!("{command} requires a mod id"))
}

fn run(app: &App, command: Command) -> Result<()> {
    match command {
        Command::Install {
            reference,
            placement,
        } => {
            let entry = app.resolve_and_install(&reference, placement)?;
            println!(
                "Installed {} ({}) at {}",
                entry.id,
                short_version(&entry.version),
                entry.install_paths.join(", ")
            );
        }
        Command::List => {
            let mods = app.list_mods();
            if mods.is_empty() {
                println!("No mods installed");
            }
            for entry in mods {
                print_entry(&entry);
            }
        }
        Command::Check(ids) => {
            let mut failed = 0;
            for (id, result) in app.check_updates(&ids) {
                match result {
                    Ok(UpdateStatus::UpToDate { version }) => {
                        println!("{id}: up to date ({})", short_version(&version))
                    }
                    Ok(UpdateStatus::UpdateAvailable { current, latest }) => println!(
                        "{id}: update available {} -> {}",
                        short_version(&current),
                        short_version(&latest)
                    ),
                    Err(err) => {
                        failed += 1;
                        println!("{id}: {} ({err})", err.kind().label());
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} check(s) failed");
            }
        }
        Command::Update(id) => {
            let report = app.apply_update(&id)?;
            for warning in &report.warnings {
                println!("warning: {warning}");
            }
            println!("Updated {id} to {}", short_version(&report.entry.version));
        }
        Command::UpdateAll => {
            let results = app.update_all();
            if results.is_empty() {
                println!("Everything is up to date");
            }
            let mut failed = 0;
            for (id, result) in results {
                match result {
                    Ok(report) => {
                        for warning in &report.warnings {
                            println!("warning: {warning}");
                        }
                        println!("Updated {id} to {}", short_version(&report.entry.version));
                    }
                    Err(err) => {
                        failed += 1;
                        println!("{id}: {err}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} update(s) failed");
            }
        }
        Command::Toggle(id, enabled) => {
            app.toggle(&id, enabled)?;
            println!("{} {id}", if enabled { "Enabled" } else { "Disabled" });
        }
        Command::Remove(id) => {
            app.remove(&id)?;
            println!("Removed {id}");
        }
        Command::Verify => {
            let mut problems = 0;
            for (id, result) in app.verify_all() {
                match result {
                    Ok(report) if report.is_intact() => println!("{id}: ok"),
                    Ok(report) if !report.missing.is_empty() => {
                        problems += 1;
                        println!("{id}: missing {}", report.missing.join(", "));
                    }
                    Ok(_) => {
                        problems += 1;
                        println!("{id}: files changed since install");
                    }
                    Err(err) => {
                        problems += 1;
                        println!("{id}: {err}");
                    }
                }
            }
            if problems > 0 {
                bail!("{problems} mod(s) need attention");
            }
        }
        Command::Repair(id) => {
            let outcome = app.repair(&id)?;
            println!("{id}: {outcome:?}");
        }
        Command::Recover(None) => {
            let orphans = app.orphaned_backups()?;
            if orphans.is_empty() {
                println!("No interrupted updates");
            }
            for orphan in orphans {
                println!(
                    "{}: interrupted in state {:?}, backup at {}",
                    orphan.record.id,
                    orphan.record.state,
                    orphan.dir.display()
                );
            }
        }
        Command::Recover(Some(action)) => {
            let handled = app.recover(action)?;
            println!("Handled {handled} interrupted update(s)");
        }
        Command::Sync => {
            let changed = app.sync_imports()?;
            println!("{}", if changed { "Updated userChrome.css" } else { "userChrome.css already in sync" });
        }
    }
    Ok(())
}

fn print_entry(entry: &ModEntry) {
    let state = match (&entry.inconsistent, entry.enabled) {
        (Some(_), _) => "inconsistent",
        (None, true) => "enabled",
        (None, false) => "disabled",
    };
    println!(
        "{:<24} {:<14} {:<12} {:<40} {}",
        entry.id,
        short_version(&entry.version),
        state,
        entry.origin.describe(),
        entry.install_paths.join(", ")
    );
}

/// Content hashes and commit SHAs are cut to 12 characters.
fn short_version(version: &str) -> &str {
    let is_hash = version.len() > 12 && version.chars().all(|ch| ch.is_ascii_hexdigit());
    if is_hash {
        &version[..12]
    } else {
        version
    }
}
