#[macro_use]
extern crate log;

use std::any::Any;
use std::error::Error;
use std::io::{self, BufWriter, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use cdx::batch::BatchOptions;
use cdx::record::to_cdxj;
use cdx::{Backend, CdxIndex, IndexOptions, MatchType, SearchRequest, Sort, StoreOptions};
use clap::{command, value_parser, Arg, ArgAction, ArgMatches, Command};
use indicatif::{ProgressBar, ProgressStyle};
use warcindex::{FileOutcome, Indexer};

type CliResult<T> = Result<T, Box<dyn Error>>;

fn cli() -> Command<'static> {
    command!()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("backend")
                .long("backend")
                .takes_value(true)
                .value_parser(value_parser!(Backend))
                .default_value("lmdb")
                .help("Storage backend: lmdb or redb"),
        )
        .arg(
            Arg::new("db")
                .long("db")
                .takes_value(true)
                .value_parser(value_parser!(PathBuf))
                .default_value("cdx-index")
                .help("Directory holding the index"),
        )
        .arg(
            Arg::new("db-name")
                .long("db-name")
                .takes_value(true)
                .value_parser(value_parser!(String))
                .help("Name of the index within the store, for stores shared by several"),
        )
        .arg(
            Arg::new("max-key-size")
                .long("max-key-size")
                .takes_value(true)
                .value_parser(value_parser!(usize))
                .help("Skip entries with keys longer than this many bytes"),
        )
        .arg(
            Arg::new("batch-size")
                .long("batch-size")
                .takes_value(true)
                .value_parser(value_parser!(usize))
                .help("Captures queued before a write to the store"),
        )
        .arg(
            Arg::new("batch-wait")
                .long("batch-wait")
                .takes_value(true)
                .value_name("SECONDS")
                .value_parser(value_parser!(u64))
                .help("Longest time a capture stays queued"),
        )
        .subcommand(
            Command::new("index")
                .about("Index WARC files, skipping those unchanged since they were last indexed")
                .arg(
                    Arg::new("files")
                        .required(true)
                        .multiple_values(true)
                        .value_parser(value_parser!(PathBuf)),
                ),
        )
        .subcommand(
            Command::new("search")
                .about("Print matching captures as CDXJ lines")
                .arg(
                    Arg::new("url")
                        .required(true)
                        .multiple_values(true)
                        .value_parser(value_parser!(String)),
                )
                .arg(
                    Arg::new("match")
                        .long("match")
                        .takes_value(true)
                        .value_parser(value_parser!(MatchType))
                        .help("exact, verbatim, prefix, host or domain"),
                )
                .arg(timestamp_arg("from", "Earliest capture time"))
                .arg(timestamp_arg("to", "Latest capture time"))
                .arg(timestamp_arg("closest", "Order captures by distance from this time"))
                .arg(
                    Arg::new("sort")
                        .long("sort")
                        .takes_value(true)
                        .value_parser(value_parser!(Sort))
                        .help("none, asc, desc or closest"),
                )
                .arg(
                    Arg::new("limit")
                        .long("limit")
                        .takes_value(true)
                        .value_parser(value_parser!(usize)),
                )
                .arg(
                    Arg::new("filter")
                        .long("filter")
                        .takes_value(true)
                        .action(ArgAction::Append)
                        .value_parser(value_parser!(String))
                        .help("[!][=|~]field:value, may be repeated"),
                ),
        )
        .subcommand(
            Command::new("resolve-id")
                .about("Print where a WARC record is stored")
                .arg(Arg::new("id").required(true).value_parser(value_parser!(String))),
        )
        .subcommand(
            Command::new("resolve-file")
                .about("Print what is known about an indexed file")
                .arg(Arg::new("name").required(true).value_parser(value_parser!(String))),
        )
        .subcommand(Command::new("reset").about("Remove everything from the index"))
}

fn timestamp_arg(name: &'static str, help: &'static str) -> Arg<'static> {
    Arg::new(name)
        .long(name)
        .takes_value(true)
        .value_name("YYYY[MM[DD[hh[mm[ss]]]]]")
        .value_parser(value_parser!(String))
        .help(help)
}

fn required<'a, T: Any + Clone + Send + Sync + 'static>(
    matches: &'a ArgMatches,
    id: &str,
) -> CliResult<&'a T> {
    matches
        .get_one::<T>(id)
        .ok_or_else(|| format!("missing argument {}", id).into())
}

fn index_options(matches: &ArgMatches) -> IndexOptions {
    let store = StoreOptions::default();
    let batch = BatchOptions::default();
    IndexOptions {
        store: StoreOptions {
            backend: matches.get_one::<Backend>("backend").copied().unwrap_or_default(),
            path: matches.get_one::<PathBuf>("db").cloned().unwrap_or(store.path),
            db_name: matches.get_one::<String>("db-name").cloned(),
            max_key_size: matches.get_one::<usize>("max-key-size").copied(),
            temporary: false,
        },
        batch: BatchOptions {
            max_size: matches
                .get_one::<usize>("batch-size")
                .copied()
                .unwrap_or(batch.max_size),
            max_wait: matches
                .get_one::<u64>("batch-wait")
                .map(|secs| Duration::from_secs(*secs))
                .unwrap_or(batch.max_wait),
        },
        ..Default::default()
    }
}

fn index_files(index: &CdxIndex, matches: &ArgMatches) -> CliResult<()> {
    let files: Vec<&PathBuf> = matches.get_many::<PathBuf>("files").into_iter().flatten().collect();
    let style = ProgressStyle::with_template("{msg:24!} [{bar:40}] {bytes}/{total_bytes} ({eta})")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar());

    let mut failures = 0;
    for path in &files {
        let bar = ProgressBar::new(0).with_style(style.clone());
        let indexer = Indexer::new(index).with_progress(bar.clone());
        match indexer.index_file(path) {
            Ok(FileOutcome::Unchanged) => {
                bar.finish_and_clear();
                println!("{}: unchanged", path.display());
            }
            Ok(FileOutcome::Indexed(stats)) => {
                bar.finish_and_clear();
                println!(
                    "{}: {} captures from {} records ({} not indexed, {} invalid)",
                    path.display(),
                    stats.indexed,
                    stats.records,
                    stats.skipped,
                    stats.invalid
                );
            }
            Ok(FileOutcome::Incomplete(stats)) => {
                bar.abandon();
                error!(
                    "{}: only partly indexed ({} of {} records queued)",
                    path.display(),
                    stats.indexed,
                    stats.records
                );
                failures += 1;
            }
            Err(e) => {
                bar.abandon();
                error!("Indexing {} failed: {}", path.display(), error_chain(&e));
                failures += 1;
            }
        }
    }

    if failures > 0 {
        return Err(format!("{} of {} files were not fully indexed", failures, files.len()).into());
    }
    Ok(())
}

fn search(index: &CdxIndex, matches: &ArgMatches) -> CliResult<()> {
    let strings = |id| {
        matches
            .get_many::<String>(id)
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
    };
    let request = SearchRequest {
        urls: strings("url"),
        match_type: matches.get_one::<MatchType>("match").copied().unwrap_or_default(),
        from: matches.get_one::<String>("from").cloned(),
        to: matches.get_one::<String>("to").cloned(),
        closest: matches.get_one::<String>("closest").cloned(),
        sort: matches.get_one::<Sort>("sort").copied().unwrap_or_default(),
        limit: matches.get_one::<usize>("limit").copied(),
        filters: strings("filter"),
    };

    let stdout = io::stdout();
    let mut out = BufWriter::new(stdout.lock());
    let mut errors = 0;
    for result in index.search(&request)? {
        match result {
            Ok(capture) => writeln!(out, "{}", to_cdxj(&capture)?)?,
            Err(e) => {
                error!("{}", error_chain(&e));
                errors += 1;
            }
        }
    }
    out.flush()?;

    if errors > 0 {
        return Err(format!("search ended with {} errors", errors).into());
    }
    Ok(())
}

fn run(matches: &ArgMatches) -> CliResult<()> {
    let index = CdxIndex::open(index_options(matches))?;

    match matches.subcommand() {
        Some(("index", sub)) => index_files(&index, sub)?,
        Some(("search", sub)) => search(&index, sub)?,
        Some(("resolve-id", sub)) => {
            let id = required::<String>(sub, "id")?;
            match index.resolve_id(id)? {
                Some(storage_ref) => println!("{}", storage_ref),
                None => return Err(format!("record {} is not indexed", id).into()),
            }
        }
        Some(("resolve-file", sub)) => {
            let name = required::<String>(sub, "name")?;
            match index.resolve_filename(name)? {
                Some(info) => println!(
                    "{} {} {} {}",
                    info.name,
                    info.path.display(),
                    info.size,
                    info.modified.to_rfc3339()
                ),
                None => return Err(format!("file {} is not indexed", name).into()),
            }
        }
        Some(("reset", _)) => {
            index.delete_all()?;
            info!("Removed every entry from the index");
        }
        Some((other, _)) => return Err(format!("unknown command {}", other).into()),
        None => return Err("no command given".into()),
    }

    index.close()?;
    Ok(())
}

/// An error and its sources, outermost first.
fn error_chain(e: &dyn Error) -> String {
    let mut out = e.to_string();
    let mut source = e.source();
    while let Some(e) = source {
        out += ": ";
        out += &e.to_string();
        source = e.source();
    }
    out
}

fn main() -> ExitCode {
    pretty_env_logger::init();

    let matches = cli().get_matches();
    match run(&matches) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("warcindex: {}", error_chain(&*e));
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn cli_is_consistent() {
        cli().debug_assert();
    }

    #[test]
    fn maps_global_flags() {
        let matches = cli()
            .try_get_matches_from([
                "warcindex",
                "--backend",
                "redb",
                "--db",
                "/tmp/idx",
                "--batch-size",
                "10",
                "--batch-wait",
                "2",
                "reset",
            ])
            .unwrap();
        let options = index_options(&matches);

        assert_eq!(options.store.backend, Backend::Redb);
        assert_eq!(options.store.path, PathBuf::from("/tmp/idx"));
        assert_eq!(options.store.db_name, None);
        assert_eq!(options.batch.max_size, 10);
        assert_eq!(options.batch.max_wait, Duration::from_secs(2));
    }

    #[test]
    fn parses_search() {
        let matches = cli()
            .try_get_matches_from([
                "warcindex",
                "search",
                "example.com/a",
                "example.com/b",
                "--match",
                "prefix",
                "--sort",
                "desc",
                "--filter",
                "status:2..",
                "--filter",
                "!mime:text/css",
            ])
            .unwrap();
        let (name, sub) = matches.subcommand().unwrap();
        assert_eq!(name, "search");
        assert_eq!(sub.get_one::<MatchType>("match"), Some(&MatchType::Prefix));
        assert_eq!(sub.get_one::<Sort>("sort"), Some(&Sort::Descending));
        assert_eq!(
            sub.get_many::<String>("filter").unwrap().collect::<Vec<_>>(),
            ["status:2..", "!mime:text/css"]
        );
        assert_eq!(sub.get_many::<String>("url").unwrap().count(), 2);
    }

    #[test]
    fn rejects_unknown_backend() {
        assert!(cli()
            .try_get_matches_from(["warcindex", "--backend", "rocksdb", "reset"])
            .is_err());
    }
}
