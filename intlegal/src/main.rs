//! intlegal CLI

use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};

use intlegal::config::PlatformConfig;
use intlegal::error::report_error;
use intlegal::ir::verify::verify_function;
use intlegal::ir::Module;
use intlegal::legalize::{self, check::check_legality, LegalityTable};

#[derive(Parser)]
#[command(name = "intlegal", version, about = "Integer type legalization for SSA IR")]
struct Cli {
    /// Log at debug level unless INTLEGAL_LOG says otherwise
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args)]
struct PlatformArgs {
    /// Platform table (TOML)
    #[arg(long)]
    platform: Option<PathBuf>,
    /// Built-in platform table
    #[arg(long, conflicts_with = "platform")]
    preset: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Legalize every function and print the result
    Legalize {
        /// IR file
        file: PathBuf,
        #[command(flatten)]
        platform: PlatformArgs,
        /// Write the result here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
        /// Print the promotion decisions to stderr first
        #[arg(long)]
        dump: bool,
        /// Print statistics as JSON to stderr
        #[arg(long)]
        stats: bool,
        /// Legalize functions in parallel
        #[arg(short = 'j', long)]
        parallel: bool,
    },
    /// Check that a file only uses legal types where it must
    Check {
        /// IR file
        file: PathBuf,
        #[command(flatten)]
        platform: PlatformArgs,
    },
    /// Print the promotion decisions without rewriting
    Analyze {
        /// IR file
        file: PathBuf,
        #[command(flatten)]
        platform: PlatformArgs,
    },
    /// List the built-in platform tables
    Presets,
}

fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "warn" };
    env_logger::init_from_env(env_logger::Env::new().filter_or("INTLEGAL_LOG", default_filter));

    let result = match cli.command {
        Command::Legalize {
            file,
            platform,
            output,
            dump,
            stats,
            parallel,
        } => legalize_file(&file, &platform, output.as_deref(), dump, stats, parallel),
        Command::Check { file, platform } => check_file(&file, &platform),
        Command::Analyze { file, platform } => analyze_file(&file, &platform),
        Command::Presets => list_presets(),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load_table(args: &PlatformArgs) -> Result<LegalityTable, Box<dyn std::error::Error>> {
    let config = match (&args.platform, &args.preset) {
        (Some(path), _) => PlatformConfig::from_file(path)?,
        (None, Some(name)) => PlatformConfig::preset(name).ok_or_else(|| {
            format!(
                "unknown preset `{name}` (available: {})",
                PlatformConfig::preset_names().join(", ")
            )
        })?,
        (None, None) => PlatformConfig::default(),
    };
    log::debug!("platform `{}`", config.name);
    Ok(LegalityTable::new(config)?)
}

fn load_module(path: &Path) -> Result<Module, Box<dyn std::error::Error>> {
    let source = std::fs::read_to_string(path)?;
    let filename = path.display().to_string();
    match intlegal::parser::parse_str(&filename, &source) {
        Ok(module) => Ok(module),
        Err(e) => {
            report_error(&filename, &source, &e);
            Err(format!("{filename}: could not be parsed").into())
        }
    }
}

fn legalize_file(
    path: &Path,
    platform: &PlatformArgs,
    output: Option<&Path>,
    dump: bool,
    stats: bool,
    parallel: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(platform)?;
    let mut module = load_module(path)?;

    if dump {
        for func in &module.functions {
            eprint!("{}", legalize::analyze(func, &table)?);
        }
    }

    let summary = legalize::legalize_module(&mut module, &table, parallel)?;

    let mut problems = Vec::new();
    for func in &module.functions {
        if let Err(errors) = verify_function(func) {
            problems.extend(errors);
        }
        if let Err(errors) = check_legality(func, &table) {
            problems.extend(errors);
        }
    }
    if !problems.is_empty() {
        return Err(format!("legalized output is invalid:\n  {}", problems.join("\n  ")).into());
    }

    if stats {
        eprintln!("{}", serde_json::to_string_pretty(&summary)?);
    }
    match output {
        Some(out) => std::fs::write(out, module.to_string())?,
        None => print!("{module}"),
    }
    Ok(())
}

fn check_file(path: &Path, platform: &PlatformArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(platform)?;
    let module = load_module(path)?;

    let mut problems = Vec::new();
    for func in &module.functions {
        if let Err(errors) = check_legality(func, &table) {
            problems.extend(errors);
        }
    }
    if !problems.is_empty() {
        for p in &problems {
            println!("{p}");
        }
        return Err(format!("{} illegal use(s)", problems.len()).into());
    }

    println!("✓ {} uses only legal types", path.display());
    Ok(())
}

fn analyze_file(path: &Path, platform: &PlatformArgs) -> Result<(), Box<dyn std::error::Error>> {
    let table = load_table(platform)?;
    let module = load_module(path)?;
    for func in &module.functions {
        print!("{}", legalize::analyze(func, &table)?);
    }
    Ok(())
}

fn list_presets() -> Result<(), Box<dyn std::error::Error>> {
    for name in PlatformConfig::preset_names() {
        if let Some(config) = PlatformConfig::preset(name) {
            println!("# {name}\n{}", config.to_toml_string()?);
        }
    }
    Ok(())
}
