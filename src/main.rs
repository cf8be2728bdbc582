mod cli;

use imagetiles::config;
use imagetiles_common::ImageFileId;
use imagetiles_db::migrations::{latest_version, MIGRATIONS};
use imagetiles_db::models::{ImageFileUpdate, NewImageFile};
use imagetiles_db::snapshot::SchemaSnapshot;
use imagetiles_db::store::ImageStore;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Commands, UpdateArgs};
use serde::Serialize;

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = config::load_config_or_default(cli.config.as_deref())?;
    if let Some(db) = &cli.db {
        config.database.path = db.clone();
    }

    // Respect RUST_LOG if set, otherwise pick by verbose flag or config
    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        if cli.verbose {
            "imagetiles=debug,imagetiles_db=debug".to_string()
        } else {
            config.logging.filter.clone()
        }
    });

    // Records go to stdout, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(&env_filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Migrate => migrate(&config),
        Commands::Status => status(&config),
        Commands::Snapshot { refresh } => snapshot(&config, refresh),
        Commands::Create {
            filename,
            project,
            width,
            height,
            description,
        } => {
            let mut new = NewImageFile::new(filename, project, width, height);
            new.description = description;
            let store = open_store(&config)?;
            print_json(&store.create(new)?)
        }
        Commands::Get { id } => {
            let store = open_store(&config)?;
            print_json(&store.get(parse_id(&id)?)?)
        }
        Commands::Update(args) => update(&config, args),
        Commands::Delete { id } => {
            let store = open_store(&config)?;
            let id = parse_id(&id)?;
            store.delete(id)?;
            println!("Deleted {id}");
            Ok(())
        }
        Commands::List { project } => list(&config, project.as_deref()),
        Commands::Projects => {
            let store = open_store(&config)?;
            for project in store.list_projects()? {
                println!("{project}");
            }
            Ok(())
        }
        Commands::Validate { file } => {
            let path = file.or(cli.config);
            validate_config(path.as_deref())
        }
        Commands::Version => {
            println!("imagetiles {}", env!("CARGO_PKG_VERSION"));
            println!("schema version {}", latest_version());
            Ok(())
        }
    }
}

fn open_store(config: &config::Config) -> Result<ImageStore> {
    let target = config.database.target();
    tracing::debug!("Opening image store at {}", target);
    ImageStore::open(target.clone(), config.database.store_options())
        .with_context(|| format!("Failed to open image store at {target}"))
}

fn parse_id(id: &str) -> Result<ImageFileId> {
    id.parse()
        .with_context(|| format!("Invalid image file id: {id:?}"))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn migrate(config: &config::Config) -> Result<()> {
    let store = ImageStore::new(config.database.target(), config.database.store_options())?;
    let report = store.migrate()?;

    if report.applied.is_empty() {
        println!("Schema is up to date (version {})", report.current_version);
    } else {
        for version in &report.applied {
            if let Some(m) = MIGRATIONS.iter().find(|m| m.version == *version) {
                println!("Applied migration {}: {}", m.version, m.name);
            }
        }
        println!(
            "Schema migrated from version {} to {}",
            report.previous_version, report.current_version
        );
    }
    Ok(())
}

fn status(config: &config::Config) -> Result<()> {
    let store = ImageStore::new(config.database.target(), config.database.store_options())?;
    print_json(&store.status()?)
}

fn snapshot(config: &config::Config, refresh: bool) -> Result<()> {
    let snapshot = if refresh {
        open_store(config)?.regenerate_snapshot()?
    } else {
        SchemaSnapshot::from_ledger(MIGRATIONS, latest_version())?
    };
    print_json(&snapshot)
}

fn update(config: &config::Config, args: UpdateArgs) -> Result<()> {
    let description = if args.clear_description {
        Some(None)
    } else {
        args.description.map(Some)
    };
    let update = ImageFileUpdate {
        id: None,
        filename: args.filename,
        project: args.project,
        width: args.width,
        height: args.height,
        description,
    };
    if update.is_empty() {
        anyhow::bail!("Nothing to update: pass at least one field to change");
    }

    let store = open_store(config)?;
    print_json(&store.update(parse_id(&args.id)?, &update)?)
}

fn list(config: &config::Config, project: Option<&str>) -> Result<()> {
    let store = open_store(config)?;
    let mut count = 0usize;
    for file in store.list(project)? {
        let file = file?;
        println!("{}", serde_json::to_string(&file)?);
        count += 1;
    }
    tracing::debug!("Listed {} image files", count);
    Ok(())
}

fn validate_config(path: Option<&std::path::Path>) -> Result<()> {
    match path {
        Some(p) => {
            println!("Validating config: {:?}", p);
            let config = config::load_config(p)?;
            println!("✓ Configuration is valid");
            println!("  Database: {}", config.database.path.display());
            println!("  Pool size: {}", config.database.pool_size);
            println!("  Lock timeout: {}s", config.database.lock_timeout_secs);
            println!("  List page size: {}", config.database.list_page_size);
        }
        None => {
            println!("No config file specified, using defaults");
            let config = config::Config::default();
            println!("Default config:");
            println!("  Database: {}", config.database.path.display());
        }
    }

    Ok(())
}
