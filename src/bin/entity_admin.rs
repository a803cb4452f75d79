//! entity-admin - maintenance tool for the entity infrastructure
//!
//! Usage:
//!   cargo run --features cli --bin entity-admin -- migrate
//!   cargo run --features cli --bin entity-admin -- types --all
//!   cargo run --features cli --bin entity-admin -- check \
//!     --principal 7f6c... --type task --instance 1b2e... --level edit
//!   cargo run --features cli --bin entity-admin -- predicate \
//!     --principal 7f6c... --type task --level view --alias t
//!   cargo run --features cli --bin entity-admin -- resolve rows.json
//!
//! Connection and resolver settings come from the environment (see
//! `InfraConfig::from_env`).

use std::io::{self, Read};
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use serde_json::{json, Value};
use uuid::Uuid;

use entity_infra::entity_infra_core::{PermissionLevel, PermissionSource};
use entity_infra::{telemetry, DatabaseManager, EntityService, InfraConfig};

#[derive(Parser)]
#[command(name = "entity-admin")]
#[command(version)]
#[command(about = "Inspect and maintain entity types, permissions and references")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format: json or pretty (default)
    #[arg(long, short = 'o', global = true, default_value = "pretty", value_enum)]
    format: OutputFormat,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply the entity_infra schema migrations
    Migrate,

    /// List registered entity types
    Types {
        /// Include deactivated types
        #[arg(long)]
        all: bool,
    },

    /// Explain a principal's permission on an instance (or the whole type)
    Check {
        #[arg(long)]
        principal: Uuid,

        #[arg(long = "type")]
        type_code: String,

        /// Instance id; omit to ask about the type as a whole
        #[arg(long)]
        instance: Option<Uuid>,

        /// Required level: name (view..owner) or number (0..7)
        #[arg(long, value_parser = parse_level)]
        level: PermissionLevel,
    },

    /// Print the list-query filter for a principal
    Predicate {
        #[arg(long)]
        principal: Uuid,

        #[arg(long = "type")]
        type_code: String,

        #[arg(long, value_parser = parse_level, default_value = "view")]
        level: PermissionLevel,

        #[arg(long, default_value = "t")]
        alias: String,
    },

    /// Resolve instance references in a JSON array of rows
    Resolve {
        /// Input file (reads stdin if not provided)
        file: Option<PathBuf>,
    },
}

fn parse_level(raw: &str) -> Result<PermissionLevel, String> {
    PermissionLevel::parse(raw).ok_or_else(|| format!("unknown permission level '{raw}'"))
}

#[tokio::main]
async fn main() -> ExitCode {
    telemetry::init_tracing();
    let cli = Cli::parse();

    match run(cli.command, cli.format).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Commands, format: OutputFormat) -> Result<()> {
    let config = InfraConfig::from_env()?;
    let db = DatabaseManager::new(&config.database)
        .await
        .context("connecting to database")?;

    let service = EntityService::new(db.pool().clone(), &config)?;
    match command {
        Commands::Migrate => {
            let applied = db.run_migrations().await?;
            println!("{} schema up to date ({applied} migrations)", "✓".green());
            Ok(())
        }
        Commands::Types { all } => cmd_types(&service, all, format).await,
        Commands::Check {
            principal,
            type_code,
            instance,
            level,
        } => {
            let instance = instance.unwrap_or(config.resolver.all_instances_id);
            cmd_check(&service, principal, &type_code, instance, level, format).await
        }
        Commands::Predicate {
            principal,
            type_code,
            level,
            alias,
        } => {
            let predicate = service.permission_predicate(principal, &type_code, level, &alias)?;
            match format {
                OutputFormat::Json => println!("{}", json!({ "predicate": predicate.as_sql() })),
                OutputFormat::Pretty => println!("{predicate}"),
            }
            Ok(())
        }
        Commands::Resolve { file } => cmd_resolve(&service, file, format).await,
    }
}

async fn cmd_types(service: &EntityService, all: bool, format: OutputFormat) -> Result<()> {
    let types = service.entity_types(all).await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&types)?);
        return Ok(());
    }
    for entity_type in types {
        let code = if entity_type.active {
            entity_type.code.bold()
        } else {
            entity_type.code.dimmed()
        };
        println!(
            "{code:<24} {:<24} children: [{}]",
            entity_type.name,
            entity_type.child_type_codes.join(", ")
        );
    }
    Ok(())
}

async fn cmd_check(
    service: &EntityService,
    principal: Uuid,
    type_code: &str,
    instance: Uuid,
    level: PermissionLevel,
    format: OutputFormat,
) -> Result<()> {
    let breakdown = service
        .explain_permission(principal, type_code, instance)
        .await?;
    let allowed = breakdown.satisfies(level);

    if format == OutputFormat::Json {
        println!(
            "{}",
            serde_json::to_string_pretty(&json!({
                "allowed": allowed,
                "required": level,
                "effective": breakdown.effective_value(),
                "sources": breakdown.sources,
            }))?
        );
        return Ok(());
    }

    for source in [
        PermissionSource::DirectGrant,
        PermissionSource::RoleGrant,
        PermissionSource::ParentView,
        PermissionSource::ParentCreate,
    ] {
        let shown = breakdown
            .level_from(source)
            .map_or_else(|| "-".to_string(), |l| l.to_string());
        println!("  {:<14} {shown}", source.to_string());
    }
    let verdict = if allowed {
        "ALLOWED".green().bold()
    } else {
        "DENIED".red().bold()
    };
    println!(
        "{verdict} {level} (effective {})",
        breakdown
            .effective
            .map_or_else(|| "none".to_string(), |l| l.to_string())
    );
    Ok(())
}

async fn cmd_resolve(
    service: &EntityService,
    file: Option<PathBuf>,
    format: OutputFormat,
) -> Result<()> {
    let source = match &file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?,
        None => {
            let mut buf = String::new();
            io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    let rows = match serde_json::from_str::<Value>(&source).context("parsing rows")? {
        Value::Array(rows) => rows,
        _ => bail!("expected a JSON array of rows"),
    };

    let resolved = service.resolve_references(&rows).await?;
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(&resolved)?);
        return Ok(());
    }
    let mut type_codes: Vec<_> = resolved.keys().collect();
    type_codes.sort();
    for type_code in type_codes {
        println!("{}", type_code.bold());
        for (id, name) in &resolved[type_code] {
            println!("  {id}  {name}");
        }
    }
    Ok(())
}
