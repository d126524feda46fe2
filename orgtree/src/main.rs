use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use flexi_logger::{Logger, LoggerHandle};
use orgtree::config::Settings;
use orgtree::core::Outline;
use orgtree::projectors::agenda::{self, AgendaRange};
use orgtree::projectors::tagged::find_tagged;
use orgtree::storage::OutlineParser;
use orgtree::{NomOutlineParser, format_outline, pretty_print};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Parse Org outlines into a tree and query them",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG takes precedence).
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON settings file (orphan text policy, default sync tag).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse Org files and print their tree.
    Parse(ParseArgs),

    /// List the outermost headings carrying a tag.
    Tagged(TaggedArgs),

    /// List deadlines, scheduled and closed items across Org files.
    Agenda(AgendaArgs),

    /// Re-render Org files in canonical form.
    Format(FormatArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing Org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of the indented tree dump.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TaggedArgs {
    /// Org files or directories containing Org files to search.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Tag to look for. Defaults to `sync_tag` from the settings file.
    #[arg(long)]
    tag: Option<String>,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    /// Input Org files to include in the agenda.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    /// Org files or directories to format.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _logger = init_logging(cli.verbose)?;

    let settings = match &cli.settings {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    let parser = NomOutlineParser {
        options: settings.parse_options(),
    };

    match cli.command {
        Commands::Parse(args) => handle_parse(args, &parser),
        Commands::Tagged(args) => handle_tagged(args, &parser, &settings),
        Commands::Agenda(args) => handle_agenda(args, &parser),
        Commands::Format(args) => handle_format(args, &parser),
    }
}

fn init_logging(verbose: bool) -> Result<LoggerHandle> {
    let level = if verbose { "debug" } else { "warn" };
    let handle = Logger::try_with_env_or_str(level)
        .context("configuring logger")?
        .log_to_stderr()
        .start()
        .context("starting logger")?;
    Ok(handle)
}

fn parse_all(inputs: &[PathBuf], parser: &dyn OutlineParser) -> Result<Vec<(PathBuf, Outline)>> {
    let expanded = expand_inputs(inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no Org files found in the provided inputs");
    }

    let mut parsed = Vec::with_capacity(expanded.len());
    for path in expanded {
        log::debug!("parsing {:?}", path);
        let outline = parser.parse_file(&path)?;
        parsed.push((path, outline));
    }
    Ok(parsed)
}

fn handle_parse(args: ParseArgs, parser: &dyn OutlineParser) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let parsed = parse_all(&inputs, parser)?;

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            outline: &'a Outline,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, outline)| JsonOutput {
                path: path.display().to_string(),
                outline,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, outline)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            print!("{}", pretty_print(outline));
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_tagged(args: TaggedArgs, parser: &dyn OutlineParser, settings: &Settings) -> Result<()> {
    let TaggedArgs { inputs, tag } = args;
    let Some(tag) = tag.or_else(|| settings.sync_tag.clone()) else {
        anyhow::bail!("no tag given and no sync_tag in settings");
    };

    for (path, outline) in parse_all(&inputs, parser)? {
        for id in find_tagged(&outline, &tag) {
            let Some(node) = outline.get(id) else {
                continue;
            };
            println!("{}: {}", path.display(), node.text());
        }
    }
    Ok(())
}

fn handle_agenda(args: AgendaArgs, parser: &dyn OutlineParser) -> Result<()> {
    let AgendaArgs {
        inputs,
        from,
        to,
        json,
    } = args;

    let outlines: Vec<Outline> = parse_all(&inputs, parser)?
        .into_iter()
        .map(|(_, outline)| outline)
        .collect();
    let items = agenda::project_all(outlines.iter(), AgendaRange { from, to });

    if items.is_empty() {
        log::warn!("no agenda items found for the provided inputs");
        return Ok(());
    }

    if json {
        let json = serde_json::to_string_pretty(&items)?;
        println!("{json}");
    } else {
        for item in items {
            let status = item.status.keyword().unwrap_or("");
            let tags = if item.tags.is_empty() {
                String::new()
            } else {
                format!(
                    " :{}:",
                    item.tags
                        .iter()
                        .map(|tag| tag.as_str())
                        .collect::<Vec<_>>()
                        .join(":")
                )
            };
            println!(
                "{} {:<10} {:<5} {}{}",
                item.start.date(),
                item.when_kind.keyword(),
                status,
                item.title,
                tags
            );
        }
    }

    Ok(())
}

fn handle_format(args: FormatArgs, parser: &dyn OutlineParser) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let parsed = parse_all(&inputs, parser)?;
    let many = parsed.len() > 1;

    for (idx, (path, outline)) in parsed.iter().enumerate() {
        let formatted = format_outline(outline);

        if in_place {
            log::debug!("rewriting {:?}", path);
            fs::write(path, formatted.as_bytes()).with_context(|| format!("writing {:?}", path))?;
        } else {
            if many {
                if idx > 0 {
                    println!();
                }
                println!("== {} ==", path.display());
            }
            print!("{formatted}");
        }
    }

    Ok(())
}

/// Resolve CLI inputs to a sorted, de-duplicated set of `.org` files.
/// Directories are searched recursively; symlinks inside them are not followed.
fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut found = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        if canonical.is_dir() {
            log::debug!("scanning directory {:?}", canonical);
            scan_dir(&canonical, &mut found)?;
        } else if is_org_file(&canonical) {
            found.insert(canonical);
        } else {
            anyhow::bail!("{:?} is not an .org file", canonical);
        }
    }
    Ok(found.into_iter().collect())
}

fn scan_dir(dir: &Path, found: &mut BTreeSet<PathBuf>) -> Result<()> {
    let entries = fs::read_dir(dir).with_context(|| format!("listing {:?}", dir))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("listing {:?}", dir))?;
        let kind = entry.file_type()?;
        let path = entry.path();
        if kind.is_dir() {
            scan_dir(&path, found)?;
        } else if kind.is_file() && is_org_file(&path) {
            log::trace!("found org file {:?}", path);
            found.insert(path);
        }
    }
    Ok(())
}

fn is_org_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "org")
}
