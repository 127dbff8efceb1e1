use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use orgtree::core::ParseConfig;
use orgtree::query::{meta, tasks};
use orgtree::storage::DocumentSource;
use orgtree::{Document, TreeParser};

#[derive(Debug, Parser)]
#[command(
    name = "orgtree",
    about = "Inspect org-mode documents as structured trees",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse org files and print their trees.
    Parse(ParseArgs),

    /// List actionable sections (state keywords and planning dates).
    Tasks(TasksArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Org files or directories containing org files to parse.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct TasksArgs {
    /// Org files or directories containing org files to scan.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Inclusive earliest planning date to keep (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive latest planning date to keep (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let verbose = cli.verbose;
    match cli.command {
        Commands::Parse(args) => handle_parse(args, verbose),
        Commands::Tasks(args) => handle_tasks(args, verbose),
    }
}

fn handle_parse(args: ParseArgs, verbose: bool) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no org files found in the provided inputs");
    }

    let parser = TreeParser::new();
    let mut parsed = Vec::new();
    for path in expanded {
        if verbose {
            eprintln!("Parsing {:?}", path);
        }
        let document = parser
            .load(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        parsed.push((path, document));
    }

    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a> {
            path: String,
            document: &'a Document,
        }

        let payload: Vec<JsonOutput<'_>> = parsed
            .iter()
            .map(|(path, document)| JsonOutput {
                path: path.display().to_string(),
                document,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, document)) in parsed.iter().enumerate() {
            if parsed.len() > 1 {
                println!("== {} ==", path.display());
            }
            if let Some(title) = meta::of(document).title {
                println!("title: {title}");
            }
            println!("{:#?}", document);
            if parsed.len() > 1 && idx + 1 < parsed.len() {
                println!();
            }
        }
    }
    Ok(())
}

fn handle_tasks(args: TasksArgs, verbose: bool) -> Result<()> {
    let TasksArgs {
        inputs,
        from,
        to,
        json,
    } = args;

    let expanded = expand_inputs(&inputs)?;
    if expanded.is_empty() {
        anyhow::bail!("no org files found in the provided inputs");
    }

    let parser = TreeParser::new();
    let config = ParseConfig::default();
    let mut items = Vec::new();
    for path in expanded {
        if verbose {
            eprintln!("Scanning {:?}", path);
        }
        let document = parser
            .load(&path)
            .with_context(|| format!("parsing {:?}", path))?;
        items.extend(tasks::collect(&document, &config));
    }

    let mut items = tasks::within(items, from, to);
    items.sort_by_key(|item| item.next_date());

    if items.is_empty() {
        eprintln!("No tasks found for the provided inputs.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }

    for item in items {
        let date = item
            .next_date()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "—".to_string());
        let state = item.todo.as_ref().map(|t| t.text.as_str()).unwrap_or("");
        let cookie = item
            .priority
            .map(|p| format!("[#{}] ", p.0))
            .unwrap_or_default();
        let tags = if item.tags.is_empty() {
            String::new()
        } else {
            format!(
                " :{}:",
                item.tags
                    .iter()
                    .map(|tag| tag.0.as_str())
                    .collect::<Vec<_>>()
                    .join(":")
            )
        };
        println!("{date:<10} {state:<8} {cookie}{}{tags}", item.title);
    }

    Ok(())
}

fn expand_inputs(inputs: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    for input in inputs {
        let metadata =
            fs::metadata(input).with_context(|| format!("reading metadata for {:?}", input))?;
        if metadata.is_dir() {
            visit_dir(input, &mut out)?;
        } else {
            out.push(input.clone());
        }
    }
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("reading directory {:?}", dir))? {
        let entry = entry.with_context(|| format!("reading entry in {:?}", dir))?;
        let path = entry.path();
        if path.is_dir() {
            visit_dir(&path, out)?;
        } else if path.extension().is_some_and(|ext| ext == "org") {
            out.push(path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn expand_inputs_finds_nested_org_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let nested = tmp.path().join("journal");
        fs::create_dir(&nested).expect("mkdir");
        for name in ["a.org", "journal/b.org", "journal/skip.txt"] {
            let mut file = fs::File::create(tmp.path().join(name)).expect("create");
            writeln!(file, "* H").expect("write");
        }

        let found = expand_inputs(&[tmp.path().to_path_buf()]).expect("expand");
        let names: Vec<String> = found
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.org", "b.org"]);
    }

    #[test]
    fn expand_inputs_keeps_explicit_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("notes.txt");
        fs::File::create(&path).expect("create");

        let found = expand_inputs(&[path.clone()]).expect("expand");
        assert_eq!(found, vec![path]);
    }
}
