use clap::{Parser, Subcommand};
use colored::Colorize;
use regex::Regex;
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// taskref - Cross-service task reference annotator for flat text reports
#[derive(Parser)]
#[command(name = "taskref")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = ".taskref.toml")]
    config: PathBuf,

    /// Quiet mode - suppress non-essential output
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Annotate task lines with the other services referencing them
    Annotate {
        /// Report file to annotate
        file: PathBuf,

        /// Suffix inserted before the output file's extension
        #[arg(short, long)]
        suffix: Option<String>,

        /// Print the annotated report to stdout instead of writing a file
        #[arg(long)]
        stdout: bool,
    },

    /// Print the task-to-services index without rewriting anything
    Index {
        /// Report file to index
        file: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    /// Inserted before the output file's extension
    suffix: String,
    /// Placed before each appended service name
    separator: String,
    service_pattern: String,
    task_pattern: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            suffix: "_updated".to_string(),
            separator: "\t\t".to_string(),
            service_pattern: r"^(\w+-service)\b".to_string(),
            task_pattern: r"^(I-\d{4,6})\b".to_string(),
        }
    }
}

fn load_config(path: &Path) -> Result<Config, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Compiled line patterns. Both are anchored to the start of the trimmed
/// line, so a line is a service header or a task line, never both.
struct ReportPatterns {
    service: Regex,
    task: Regex,
}

impl ReportPatterns {
    fn from_config(config: &Config) -> Result<Self, Box<dyn std::error::Error>> {
        Ok(ReportPatterns {
            service: Regex::new(&config.service_pattern)?,
            task: Regex::new(&config.task_pattern)?,
        })
    }

    fn service_header<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.service
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    fn task_id<'a>(&self, line: &'a str) -> Option<&'a str> {
        self.task
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    /// Drops trailing separator-delimited segments that are exactly a
    /// service name, i.e. annotations from a previous run. Separator
    /// occurrences inside genuine free text stay put.
    fn strip_annotations<'a>(&self, line: &'a str, separator: &str) -> &'a str {
        let mut core = line;
        while let Some(pos) = core.rfind(separator) {
            let tail = &core[pos + separator.len()..];
            if self.service_header(tail) != Some(tail) {
                break;
            }
            core = core[..pos].trim_end();
        }
        core
    }
}

/// Task -> referencing services, insertion order preserved on both axes,
/// no duplicate services per task.
#[derive(Debug, Default, PartialEq)]
struct TaskIndex {
    order: Vec<String>,
    services: HashMap<String, Vec<String>>,
}

impl TaskIndex {
    fn record(&mut self, task: &str, service: &str) {
        if !self.services.contains_key(task) {
            self.order.push(task.to_string());
        }
        let refs = self.services.entry(task.to_string()).or_default();
        if !refs.iter().any(|s| s == service) {
            refs.push(service.to_string());
        }
    }

    fn services_for(&self, task: &str) -> Option<&[String]> {
        self.services.get(task).map(|refs| refs.as_slice())
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &[String])> + '_ {
        self.order.iter().filter_map(|task| {
            self.services
                .get(task)
                .map(|refs| (task.as_str(), refs.as_slice()))
        })
    }

    fn task_count(&self) -> usize {
        self.order.len()
    }

    fn service_count(&self) -> usize {
        let mut seen: HashSet<&str> = HashSet::new();
        for refs in self.services.values() {
            for service in refs {
                seen.insert(service);
            }
        }
        seen.len()
    }
}

/// First pass: scan the report in order, tracking the current service
/// context, and record for every task the services whose blocks mention it.
fn build_index(lines: &[String], patterns: &ReportPatterns) -> TaskIndex {
    let mut index = TaskIndex::default();
    let mut current_service: Option<String> = None;

    for line in lines {
        let line = line.trim();

        if let Some(service) = patterns.service_header(line) {
            current_service = Some(service.to_string());
        } else if let Some(task) = patterns.task_id(line) {
            // A task line ahead of the first service header has no context
            // to attribute it to; it stays out of the index.
            if let Some(service) = &current_service {
                index.record(task, service);
            }
        }
    }

    index
}

/// Second pass: rebuild every line, appending to each task line the other
/// services that reference the same task. The context cursor is recomputed
/// here rather than shared with the index pass, so either pass can be
/// exercised on its own.
fn annotate_lines(
    lines: &[String],
    index: &TaskIndex,
    patterns: &ReportPatterns,
    separator: &str,
) -> Vec<String> {
    let mut output = Vec::with_capacity(lines.len());
    let mut current_service: Option<String> = None;

    for line in lines {
        let line = line.trim();

        if let Some(service) = patterns.service_header(line) {
            current_service = Some(service.to_string());
            output.push(line.to_string());
            continue;
        }

        if let Some(task) = patterns.task_id(line) {
            // Strip annotations from a previous run so re-annotating an
            // already-annotated report leaves it unchanged.
            let mut annotated = patterns.strip_annotations(line, separator).to_string();

            // A task line ahead of the first service header stays
            // unannotated, as does a task the index never saw (the latter
            // cannot happen when both passes saw the same lines).
            if let Some(current) = &current_service {
                if let Some(services) = index.services_for(task) {
                    for service in services {
                        if service != current {
                            annotated.push_str(separator);
                            annotated.push_str(service);
                        }
                    }
                }
            }
            output.push(annotated);
            continue;
        }

        output.push(line.to_string());
    }

    output
}

fn main() {
    let cli = Cli::parse();

    let result = load_config(&cli.config).and_then(|config| match cli.command {
        Commands::Annotate { file, suffix, stdout } => {
            cmd_annotate(&file, suffix.as_deref(), stdout, &config, cli.quiet)
        }
        Commands::Index { file, json } => cmd_index(&file, json, &config),
    });

    if let Err(e) = result {
        eprintln!("{}: {}", "error".red().bold(), e);
        std::process::exit(1);
    }
}

fn cmd_annotate(
    file: &Path,
    suffix: Option<&str>,
    to_stdout: bool,
    config: &Config,
    quiet: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();

    let patterns = ReportPatterns::from_config(config)?;
    let lines = read_lines(file)?;

    let index = build_index(&lines, &patterns);
    let annotated = annotate_lines(&lines, &index, &patterns, &config.separator);

    if to_stdout {
        for line in &annotated {
            println!("{}", line);
        }
        return Ok(());
    }

    let suffix = suffix.unwrap_or(&config.suffix);
    let output = derived_path(file, suffix);
    write_lines(&output, &annotated)?;

    let elapsed = start.elapsed();

    if !quiet {
        println!();
        println!("{}", "Annotation Summary".green().bold());
        println!("  Services seen:    {}", index.service_count().to_string().cyan());
        println!("  Tasks indexed:    {}", index.task_count().to_string().cyan());
        println!("  Lines written:    {}", annotated.len().to_string().cyan());
        println!("  Time elapsed:     {:.2?}", elapsed);
        println!();
        println!(
            "{} {}",
            "Annotated report written to".green(),
            output.display().to_string().cyan()
        );
    }

    Ok(())
}

fn cmd_index(file: &Path, json: bool, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    let patterns = ReportPatterns::from_config(config)?;
    let lines = read_lines(file)?;
    let index = build_index(&lines, &patterns);

    if json {
        let entries: Vec<serde_json::Value> = index
            .iter()
            .map(|(task, services)| {
                serde_json::json!({
                    "task": task,
                    "services": services,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if index.task_count() == 0 {
        println!("{}", "No tasks found".yellow());
        return Ok(());
    }

    for (task, services) in index.iter() {
        println!("{}  {}", task.cyan(), services.join(", "));
    }

    Ok(())
}

// I/O collaborators

fn read_lines(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("input file not found: {}", path.display()).into());
    }
    let content = fs::read_to_string(path)?;
    Ok(content.lines().map(|l| l.to_string()).collect())
}

/// Inserts the suffix before the final extension separator, or appends it
/// when the file name has no extension.
fn derived_path(path: &Path, suffix: &str) -> PathBuf {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => {
            let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
            path.with_file_name(format!("{}{}.{}", stem, suffix, ext))
        }
        None => {
            let name = path.file_name().and_then(|s| s.to_str()).unwrap_or_default();
            path.with_file_name(format!("{}{}", name, suffix))
        }
    }
}

fn write_lines(path: &Path, lines: &[String]) -> Result<(), Box<dyn std::error::Error>> {
    let mut content = lines.join("\n");
    content.push('\n');

    // Stage to a sibling file and rename, so a failed write never leaves a
    // half-written report at the output path.
    let tmp = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => path.with_file_name(format!("{}.tmp", name)),
        None => return Err(format!("invalid output path: {}", path.display()).into()),
    };

    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;

    Ok(())
}
