#![cfg(feature = "cli")]

use ansi_term::Colour;
use clap::Parser;
use rotonda_tiered_store::addr::Prefix;
use rotonda_tiered_store::rib::config::StorageConfig;
use rotonda_tiered_store::rib::TieredRib;
use rotonda_tiered_store::RouteEvent;

use std::error::Error;
use std::fs::File;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Instant;

use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

const HISTORY: &str = "/tmp/rotonda-tiered-store-history.txt";

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML file with the storage configuration. Memory only if not set.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// CSV files with `address,length,payload` records to insert
    csv_files: Vec<PathBuf>,

    /// Only load the CSV_FILES, don't start the prompt
    #[arg(long, default_value_t = false)]
    no_prompt: bool,
}

fn load_prefixes(
    path: &PathBuf,
    events: &mut Vec<RouteEvent>,
) -> Result<(), Box<dyn Error>> {
    let file = File::open(path)?;
    let mut rdr = csv::Reader::from_reader(file);
    for result in rdr.records() {
        let record = result?;
        let (Some(addr), Some(len)) = (record.get(0), record.get(1)) else {
            return Err(format!("short record {:?}", record).into());
        };
        let addr = IpAddr::from_str(addr.trim())?;
        let len: u8 = len.trim().parse()?;
        let payload = record.get(2).unwrap_or_default().trim().to_string();
        events.push(RouteEvent::insert(Prefix::new(addr, len)?, payload));
    }
    Ok(())
}

fn print_help() {
    println!("<address>/<len>\t\texact match");
    println!("<address>\t\tlongest match");
    println!("i <prefix> <payload>\tinsert or update a route");
    println!("w <prefix>\t\twithdraw a route");
    println!("s\t\t\tstatistics");
    println!("m\t\t\trun a migration batch");
    println!("c\t\t\trun a compaction pass");
    println!("y\t\t\tsync the disk tier");
    println!("q\t\t\tquit");
}

fn exec(rib: &TieredRib, line: &str) -> Result<bool, Box<dyn Error>> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(true);
    };

    match cmd {
        "q" => return Ok(false),
        "h" | "?" => print_help(),
        "s" => print!("{}", rib.stats()),
        "m" => println!("{:?}", rib.run_migration()),
        "c" => {
            let report = rib.run_compaction()?;
            println!(
                "{} ranges, removed {} versions and {} prefixes in {}ms",
                report.tasks.len(),
                report.removed_versions(),
                report.removed_prefixes(),
                report.duration_ms
            );
        }
        "y" => {
            rib.sync()?;
            println!("synced");
        }
        "i" => {
            let prefix = Prefix::from_str(words.next().unwrap_or_default())?;
            let payload = words.collect::<Vec<_>>().join(" ");
            let version =
                rib.apply_event(RouteEvent::insert(prefix, payload))?;
            println!("{} v{}", prefix, version);
        }
        "w" => {
            let prefix = Prefix::from_str(words.next().unwrap_or_default())?;
            match rib.apply_event(RouteEvent::withdraw(prefix))? {
                0 => println!(
                    "{}",
                    Colour::Yellow.paint(format!("{} is not known", prefix))
                ),
                version => println!("{} withdrawn, v{}", prefix, version),
            }
        }
        query if query.contains('/') => {
            let prefix = match Prefix::from_str(query) {
                Ok(prefix) => prefix,
                Err(_) => {
                    let (addr, len) =
                        query.split_once('/').unwrap_or_default();
                    let prefix = Prefix::new_relaxed(
                        IpAddr::from_str(addr)?,
                        len.parse()?,
                    )?;
                    println!(
                        "{}",
                        Colour::Yellow.paint(format!(
                            "Warning: Prefix has bits set to the right of \
                            the prefix length. Searching for {}.",
                            prefix
                        ))
                    );
                    prefix
                }
            };
            match rib.get(&prefix)? {
                Some(entry) => println!(
                    "{} ({})",
                    entry,
                    rib.location(&prefix)
                        .map(|l| l.to_string())
                        .unwrap_or_default()
                ),
                None => println!("{}", Colour::Red.paint("no match")),
            }
        }
        query => {
            let addr = IpAddr::from_str(query)?;
            match rib.longest_match(addr)? {
                Some(entry) => println!(
                    "{} ({})",
                    entry,
                    rib.location(&entry.prefix)
                        .map(|l| l.to_string())
                        .unwrap_or_default()
                ),
                None => println!("{}", Colour::Red.paint("no match")),
            }
        }
    }
    Ok(true)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();
    let args = Cli::parse();

    let config = match &args.config {
        Some(path) => {
            StorageConfig::from_toml_str(&std::fs::read_to_string(path)?)?
        }
        None => StorageConfig::default(),
    };
    let rib = TieredRib::new_with_config(config)?;
    println!("created {} RIB", rib.config().storage_type());

    let mut events = vec![];
    for path in &args.csv_files {
        load_prefixes(path, &mut events)?;
    }
    if !events.is_empty() {
        println!("finished loading {} prefixes...", events.len());
        let start = Instant::now();
        let count = events.len();
        for event in events {
            rib.apply_event(event)?;
        }
        println!(
            "finished inserting {} prefixes in {} msecs...",
            count,
            start.elapsed().as_millis()
        );
        print!("{}", rib.stats());
    }

    if args.no_prompt {
        return Ok(rib.shutdown()?);
    }

    let mut rl = DefaultEditor::new()?;
    if rl.load_history(HISTORY).is_err() {
        println!("No previous history.");
    }
    print_help();
    loop {
        match rl.readline("(rotonda-tiered-store)> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str())?;
                match exec(&rib, &line) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => println!(
                        "{}",
                        Colour::Red.paint(format!("Error: {}", err))
                    ),
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("CTRL-C");
                break;
            }
            Err(ReadlineError::Eof) => {
                println!("CTRL-D");
                break;
            }
            Err(_err) => {
                println!("Error: Can't parse the command");
                continue;
            }
        }
    }
    rl.save_history(HISTORY)?;
    rib.shutdown()?;
    Ok(())
}
