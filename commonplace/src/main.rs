use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use commonplace::agenda::{self, FoldRange};
use commonplace::core::{Instance, ParseConfig, Todos};
use commonplace::instantiate::{InstanceOptions, instances};
use commonplace::parse_todos;

#[derive(Debug, Parser)]
#[command(
    name = "commonplace",
    about = "Moment/todo tooling built on the commonplace crate",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON file with parse settings (delimiters, marks, date formats, ...).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Use this instant as "now" (e.g. 2019-03-23T00:00:00).
    #[arg(long, global = true)]
    fixed_time: Option<NaiveDateTime>,
    /// Override the indentation width of one nesting level.
    #[arg(long, global = true)]
    tab_size: Option<usize>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse a todo file and print its categories and moments.
    Parse(ParseArgs),

    /// List the instances of all moments inside a date window.
    Instances(InstancesArgs),

    /// Print the outline of the top-level moments.
    Outline(OutlineArgs),

    /// Print the foldable line ranges.
    Folds(FileArgs),

    /// Show moments that are due within the next days.
    Due(DueArgs),
}

#[derive(Debug, Args)]
struct FileArgs {
    /// Todo file to read.
    input: PathBuf,
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Todo file to parse.
    input: PathBuf,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct InstancesArgs {
    /// Todo file to read.
    input: PathBuf,
    /// Inclusive start date (YYYY-MM-DD).
    #[arg(long)]
    from: NaiveDate,
    /// Inclusive end date (YYYY-MM-DD).
    #[arg(long)]
    to: NaiveDate,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
    /// Print sub-instances as `parent/child` paths instead of nesting them.
    #[arg(long)]
    flat: bool,
}

#[derive(Debug, Args)]
struct OutlineArgs {
    /// Todo file to read.
    input: PathBuf,
    /// Include moments that are already done.
    #[arg(long)]
    include_done: bool,
}

#[derive(Debug, Args)]
struct DueArgs {
    /// Todo file to read.
    input: PathBuf,
    /// Day to count from. Defaults to the fixed time or today.
    #[arg(long)]
    today: Option<NaiveDate>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    // Library events reach `log` through tracing's `log` feature.
    env_logger::Builder::from_default_env()
        .filter_level(log_level(verbose))
        .init();
    let config = load_config(cli.config.as_deref(), cli.fixed_time, cli.tab_size, verbose)?;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, &config, verbose),
        Commands::Instances(args) => handle_instances(args, &config, verbose),
        Commands::Outline(args) => handle_outline(args, &config, verbose),
        Commands::Folds(args) => handle_folds(args, &config, verbose),
        Commands::Due(args) => handle_due(args, &config, verbose),
    }
}

fn log_level(verbose: bool) -> log::LevelFilter {
    if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Warn
    }
}

fn load_config(
    path: Option<&Path>,
    fixed_time: Option<NaiveDateTime>,
    tab_size: Option<usize>,
    verbose: bool,
) -> Result<ParseConfig> {
    let mut config = match path {
        Some(path) => {
            if verbose {
                eprintln!("Loading config {:?}", path);
            }
            let text =
                fs::read_to_string(path).with_context(|| format!("reading config {:?}", path))?;
            serde_json::from_str::<ParseConfig>(&text)
                .with_context(|| format!("parsing config {:?}", path))?
        }
        None => ParseConfig::default(),
    };

    if let Some(fixed_time) = fixed_time {
        config.fixed_time = Some(fixed_time);
    }
    if let Some(tab_size) = tab_size {
        config.tab_size = tab_size;
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read_todos(path: &Path, config: &ParseConfig, verbose: bool) -> Result<(String, Todos)> {
    if verbose {
        eprintln!("Parsing {:?}", path);
    }
    let source = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    let todos = parse_todos(&source, config);
    if verbose {
        eprintln!(
            "Found {} categories and {} top-level moments",
            todos.categories.len(),
            todos.moments.len()
        );
    }
    Ok((source, todos))
}

fn handle_parse(args: ParseArgs, config: &ParseConfig, verbose: bool) -> Result<()> {
    let ParseArgs { input, json } = args;
    let (_, todos) = read_todos(&input, config, verbose)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&todos)?);
    } else {
        println!("{:#?}", todos);
    }
    Ok(())
}

fn handle_instances(args: InstancesArgs, config: &ParseConfig, verbose: bool) -> Result<()> {
    let InstancesArgs {
        input,
        from,
        to,
        json,
        flat,
    } = args;
    if to < from {
        anyhow::bail!("--to ({to}) is before --from ({from})");
    }

    let (_, todos) = read_todos(&input, config, verbose)?;
    let window_start = commonplace::core::start_of_day(from);
    let window_end = commonplace::core::end_of_day(to);
    let found = instances(&todos.moments, window_start, window_end, InstanceOptions::default())
        .with_context(|| format!("instantiating {:?}", input))?;

    if found.is_empty() {
        eprintln!("No instances between {from} and {to}.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else if flat {
        for (path, inst) in flatten_paths(&found, "") {
            println!("{}", instance_line(inst, &path, 0));
        }
    } else {
        print_tree(&found, 0);
    }
    Ok(())
}

fn print_tree(found: &[Instance], depth: usize) {
    for inst in found {
        println!("{}", instance_line(inst, &inst.name, depth));
        print_tree(&inst.sub_instances, depth + 1);
    }
}

fn flatten_paths<'a>(found: &'a [Instance], parent: &str) -> Vec<(String, &'a Instance)> {
    let mut out = Vec::new();
    for inst in found {
        let path = format!("{parent}{}", inst.name);
        let children = flatten_paths(&inst.sub_instances, &format!("{path}/"));
        out.push((path, inst));
        out.extend(children);
    }
    out
}

fn instance_line(inst: &Instance, name: &str, depth: usize) -> String {
    let start = inst.start.date();
    let end = inst.end.date();
    let span = if start == end {
        start.to_string()
    } else {
        format!("{start}..{end}")
    };
    let time = inst
        .time_of_day
        .map(|t| format!(" {}", t.format("%H:%M")))
        .unwrap_or_default();
    let mark = if inst.done { "x" } else { " " };
    let open = if inst.ends_in_range { "" } else { " +" };
    format!(
        "{}[{mark}] {span}{time} {name}{open}",
        "  ".repeat(depth)
    )
}

fn handle_outline(args: OutlineArgs, config: &ParseConfig, verbose: bool) -> Result<()> {
    let OutlineArgs {
        input,
        include_done,
    } = args;
    let (source, todos) = read_todos(&input, config, verbose)?;
    for entry in agenda::outline(&todos, &source, include_done) {
        let detail = if entry.detail.is_empty() {
            String::new()
        } else {
            format!("  ({})", entry.detail)
        };
        println!(
            "{:>5}-{:<5} {}{}",
            entry.start_line + 1,
            entry.end_line + 1,
            entry.name,
            detail
        );
    }
    Ok(())
}

fn handle_folds(args: FileArgs, config: &ParseConfig, verbose: bool) -> Result<()> {
    let (_, todos) = read_todos(&args.input, config, verbose)?;
    let folds: Vec<FoldRange> = agenda::fold_ranges(&todos);
    println!("{}", serde_json::to_string(&folds)?);
    Ok(())
}

fn handle_due(args: DueArgs, config: &ParseConfig, verbose: bool) -> Result<()> {
    let DueArgs { input, today } = args;
    let now = match today {
        Some(day) => commonplace::core::start_of_day(day),
        None => config.now(),
    };
    let (_, todos) = read_todos(&input, config, verbose)?;

    let mut due = Vec::new();
    for moment in todos.moments.iter().filter(|m| !m.is_done()) {
        let days = agenda::due_in_days(moment, now)
            .with_context(|| format!("checking due date of {:?}", moment.name))?;
        if let Some(days) = days {
            due.push((days, moment.name.as_str()));
        }
    }
    due.sort();

    if due.is_empty() {
        eprintln!("Nothing due within {} days.", agenda::DUE_SOON_CUTOFF_DAYS);
        return Ok(());
    }
    for (days, name) in due {
        match days {
            0 => println!("today     {name}"),
            1 => println!("tomorrow  {name}"),
            n => println!("in {n:>2} days {name}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::fs;

    #[test]
    fn verbose_enables_library_debug_events() {
        assert_eq!(log_level(true), log::LevelFilter::Debug);
        assert!(log_level(true) >= log::Level::Debug);
        assert!(log_level(false) < log::Level::Debug);
        assert!(log_level(false) >= log::Level::Warn);
    }

    #[test]
    fn load_config_reads_json_and_applies_overrides() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.json");
        fs::write(
            &path,
            r#"{ "category_delim": "====", "date_formats": ["%Y-%m-%d"], "tab_size": 2 }"#,
        )
        .expect("write config");

        let fixed = NaiveDate::from_ymd_opt(2019, 3, 23)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .expect("valid time");
        let config = load_config(Some(&path), Some(fixed), Some(8), false).expect("load config");

        assert_eq!(config.category_delim, "====");
        assert_eq!(config.date_formats, vec!["%Y-%m-%d".to_string()]);
        assert_eq!(config.tab_size, 8);
        assert_eq!(config.fixed_time, Some(fixed));
        assert_eq!(config.priority_mark, '!');
    }

    #[test]
    fn load_config_rejects_invalid_values() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.json");
        fs::write(&path, r#"{ "done_mark": "w" }"#).expect("write config");

        let err = load_config(Some(&path), None, None, false).expect_err("duplicate mark");
        assert!(format!("{err:#}").contains("more than one purpose"));
        assert!(load_config(None, None, Some(0), false).is_err());
    }

    #[test]
    fn load_config_reports_missing_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let missing = tmp.path().join("nope.json");
        let err = load_config(Some(&missing), None, None, false).expect_err("missing file");
        assert!(format!("{err:#}").contains("reading config"));
    }

    #[test]
    fn read_todos_parses_file_contents() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("todo.txt");
        fs::write(&path, "------\nWork\n------\n[] a (18.06.2016)\n    note\n").expect("write");

        let (source, todos) =
            read_todos(&path, &ParseConfig::default(), false).expect("read todos");
        assert!(source.starts_with("------"));
        assert_eq!(todos.categories.len(), 1);
        assert_eq!(todos.moments[0].comments[0].content, "note");
    }

    #[test]
    fn flatten_paths_joins_names() {
        let config = ParseConfig::default();
        let todos = parse_todos("[] a (18.06.2016)\n    [] b\n        [] c", &config);
        let day = NaiveDate::from_ymd_opt(2016, 6, 18).expect("valid date");
        let found = instances(
            &todos.moments,
            commonplace::core::start_of_day(day),
            commonplace::core::end_of_day(day),
            InstanceOptions::default(),
        )
        .expect("instances");
        let paths: Vec<_> = flatten_paths(&found, "")
            .into_iter()
            .map(|(path, _)| path)
            .collect();
        assert_eq!(paths, vec!["a", "a/b", "a/b/c"]);
    }
}
