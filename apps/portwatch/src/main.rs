mod cli;

use clap::Parser;
use cli::Args;
use cli::BlockCommand;
use cli::Command;
use cli::ConfigCommand;
use cli::RuleKind;
use cli::Toggle;
use pw_core::TabId;
use pw_core::WatchError;
use pw_core::WatchResult;
use pw_ipc::BridgeMessage;
use pw_ipc::ChannelConfig;
use pw_ipc::ContextRole;
use pw_ipc::PageBridge;
use pw_ipc::local_channel_pair;
use pw_js::InstrumentedRuntime;
use pw_js::JsRuntimeConfig;
use pw_js::PageContext;
use pw_js::ScriptSource;
use pw_storage::StorageConfig;
use pw_storage::open_store;
use pw_tracker::AggregationService;
use pw_tracker::STATUS_COMPLETE;
use pw_tracker::STATUS_LOADING;
use pw_tracker::TrackerConfig;
use serde::Serialize;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::time::Instant;

const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    std::process::exit(match run(Args::parse()) {
        Ok(()) => EXIT_SUCCESS,
        Err(error) => {
            eprintln!("error: {error}");
            EXIT_ERROR
        }
    });
}

fn run(args: Args) -> WatchResult<()> {
    let mut service = open_service(args.storage_dir)?;

    match args.command {
        Command::Scan {
            tab,
            url,
            frame_name,
            scripts,
        } => scan(&mut service, tab, &url, frame_name, &scripts),
        Command::Listeners { tab } => {
            let mut update = service.notifications().snapshot(true);
            if let Some(tab) = tab {
                update.listeners.retain(|tab_id, _| *tab_id == tab);
            }
            print_json(&update)
        }
        Command::Clear { tab } => {
            service.remove_tab(tab, Instant::now());
            service.flush();
            Ok(())
        }
        Command::Block(command) => block(&mut service, command),
        Command::Config(command) => configure(&mut service, command),
    }
}

fn open_service(storage_dir: Option<PathBuf>) -> WatchResult<AggregationService> {
    let mut storage = StorageConfig::default();
    if let Some(root) = storage_dir {
        storage = storage.with_root(root);
    }
    AggregationService::open(TrackerConfig::default(), open_store(&storage)?)
}

fn scan(
    service: &mut AggregationService,
    tab: TabId,
    url: &str,
    frame_name: Option<String>,
    paths: &[PathBuf],
) -> WatchResult<()> {
    if let Err(error) = service.connect_log_shipper() {
        log::warn!("external logging disabled: {error}");
    }

    let scripts = paths
        .iter()
        .map(|path| {
            read_text(path).map(|source| ScriptSource {
                origin: path.display().to_string(),
                source,
            })
        })
        .collect::<WatchResult<Vec<_>>>()?;
    let page = page_context(url, frame_name)?;

    let (page_end, aggregator_end) = local_channel_pair(
        ChannelConfig::hardened(ContextRole::Page)?,
        ChannelConfig::hardened(ContextRole::Aggregator)?,
    )?;
    let bridge = PageBridge::new(page_end, tab, Some(url.to_owned()));

    service.handle(
        BridgeMessage::TabUpdated {
            tab_id: tab,
            status: STATUS_LOADING.to_owned(),
        },
        Instant::now(),
    );
    service.tab_activated(tab);

    let report = InstrumentedRuntime::new(JsRuntimeConfig::default()).execute(&page, &scripts, &bridge);
    for error in &report.errors {
        log::warn!("{}: {}", error.origin, error.message);
    }
    log::info!(
        "executed {}/{} scripts, {} listener registrations",
        report.scripts_executed,
        report.scripts_seen,
        report.listeners_reported
    );

    service.pump(&aggregator_end);
    service.handle(
        BridgeMessage::TabUpdated {
            tab_id: tab,
            status: STATUS_COMPLETE.to_owned(),
        },
        Instant::now(),
    );
    service.flush();

    print_json(&service.visible(tab))
}

fn page_context(url: &str, frame_name: Option<String>) -> WatchResult<PageContext> {
    let page = PageContext::new(url);
    let Some(name) = frame_name else {
        return Ok(page);
    };

    let mut frames = page.frames.clone();
    let root = frames.root();
    let origin = frames
        .node(root)
        .map(|node| node.origin.clone())
        .unwrap_or_default();
    let child = frames.add_child(root, name, origin)?;
    frames.set_current(child)?;
    Ok(page.with_frames(frames))
}

fn block(service: &mut AggregationService, command: BlockCommand) -> WatchResult<()> {
    match command {
        BlockCommand::Add { kind, value } => {
            if !service.block(kind.into(), &value)? {
                log::info!("{} rule already present", kind.label());
            }
            Ok(())
        }
        BlockCommand::Remove { kind, value } => {
            if !service.unblock(kind.into(), &value)? {
                return Err(WatchError::new(
                    "cli.rule_not_found",
                    format!("no {} rule `{value}`", kind.label()),
                ));
            }
            Ok(())
        }
        BlockCommand::List { kind } => {
            let kinds = kind.map_or(RuleKind::ALL.to_vec(), |kind| vec![kind]);
            for kind in kinds {
                for rule in service.rules().list(kind.into()) {
                    println!("{}\t{rule}", kind.label());
                }
            }
            Ok(())
        }
        BlockCommand::Export { kind, output } => {
            let document = service.export_rules(kind.into())?;
            match output {
                Some(path) => write_text(&path, &document),
                None => {
                    println!("{document}");
                    Ok(())
                }
            }
        }
        BlockCommand::Import { kind, file } => {
            let added = service.import_rules(kind.into(), &read_text(&file)?)?;
            println!("imported {added} {} rules", kind.label());
            Ok(())
        }
    }
}

fn configure(service: &mut AggregationService, command: ConfigCommand) -> WatchResult<()> {
    match command {
        ConfigCommand::Dedupe { state } => service.set_dedupe(state == Toggle::On),
        ConfigCommand::LogUrl { url } => service.set_log_url(&url),
        ConfigCommand::Show => {
            let settings = service.settings();
            println!("dedupe\t{}", if settings.dedupe_enabled { "on" } else { "off" });
            println!("log_url\t{}", settings.log_endpoint().unwrap_or("(disabled)"));
            for kind in RuleKind::ALL {
                println!(
                    "{}_rules\t{}",
                    kind.label(),
                    service.rules().list(kind.into()).len()
                );
            }
            Ok(())
        }
    }
}

fn read_text(path: &Path) -> WatchResult<String> {
    fs::read_to_string(path).map_err(|error| {
        WatchError::new(
            "cli.read_failed",
            format!("failed to read `{}`: {error}", path.display()),
        )
    })
}

fn write_text(path: &Path, contents: &str) -> WatchResult<()> {
    fs::write(path, contents).map_err(|error| {
        WatchError::new(
            "cli.write_failed",
            format!("failed to write `{}`: {error}", path.display()),
        )
    })
}

fn print_json<T: Serialize>(value: &T) -> WatchResult<()> {
    let rendered = serde_json::to_string_pretty(value).map_err(|error| {
        WatchError::new(
            "cli.output_encode_failed",
            format!("failed to encode output: {error}"),
        )
    })?;
    println!("{rendered}");
    Ok(())
}
