use clap::{Parser, Subcommand, ValueEnum};
use nodb::{CollectionConfig, Database, Filter};
use std::process;

/// nodb CLI: inspect and edit a nodb database from the command line
#[derive(Parser)]
#[command(name = "nodb", version, about)]
struct Cli {
    /// Directory that holds the database (default: current directory)
    #[arg(long, default_value = ".")]
    root: String,

    /// Database name
    #[arg(long, default_value = "nodb")]
    db: String,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// List collection descriptors
    Collections,

    /// Create a collection (config is ignored if it already exists)
    Create {
        /// Collection name
        collection: String,
        /// Stamp created_date/modified_date on insert
        #[arg(long)]
        date_audit: bool,
        /// Extra config values (e.g. --config owner=ops)
        #[arg(long = "config", value_parser = parse_key_value)]
        config: Vec<(String, String)>,
        /// Read collection config from a YAML file
        #[arg(long)]
        config_file: Option<String>,
    },

    /// Insert a new document
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field name=ashutosh)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Find documents matching every --where pair
    Find {
        /// Collection name
        collection: String,
        /// Equality filters (e.g. --where name=ashutosh)
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Count documents matching every --where pair
    Count {
        /// Collection name
        collection: String,
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Merge --set values into matching documents
    Update {
        /// Collection name
        collection: String,
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
        /// Field values to write (e.g. --set status=done)
        #[arg(long = "set", value_parser = parse_key_value, required = true)]
        fields: Vec<(String, String)>,
    },

    /// Soft delete matching documents
    Delete {
        /// Collection name
        collection: String,
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Physically remove matching documents, including soft-deleted ones
    HardDelete {
        /// Collection name
        collection: String,
        #[arg(long = "where", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut db = Database::open(&cli.root, &cli.db)?;
    log::debug!("Opened database at {}", db.path().display());

    match cli.command {
        Command::Collections => {
            let descriptors = serde_json::to_value(&db.metadata().collections)?;
            print_output(&descriptors, &cli.format)?;
        }

        Command::Create {
            collection,
            date_audit,
            config,
            config_file,
        } => {
            let mut cfg = match config_file {
                Some(path) => read_config_file(&path)?,
                None => CollectionConfig::new(),
            };
            if date_audit {
                cfg.date_audit = true;
            }
            for (key, value) in &config {
                cfg = cfg.with(key.clone(), parse_value(value));
            }
            let col = db.collection(&collection, Some(cfg))?;
            print_output(&serde_json::to_value(col.descriptor())?, &cli.format)?;
        }

        Command::Insert { collection, fields } => {
            let col = db.collection(&collection, None)?;
            let doc = col.insert(fields_to_value(&fields))?;
            print_output(&doc.to_value()?, &cli.format)?;
        }

        Command::Find {
            collection,
            filters,
        } => {
            let col = db.collection(&collection, None)?;
            let docs = col.find(&to_filter(&filters))?;
            let items = docs
                .iter()
                .map(|d| d.to_value())
                .collect::<Result<Vec<_>, _>>()?;
            print_output(&serde_json::Value::Array(items), &cli.format)?;
        }

        Command::Count {
            collection,
            filters,
        } => {
            let col = db.collection(&collection, None)?;
            let count = col.count(&to_filter(&filters))?;
            print_output(&serde_json::json!({ "count": count }), &cli.format)?;
        }

        Command::Update {
            collection,
            filters,
            fields,
        } => {
            let col = db.collection(&collection, None)?;
            let updates = match fields_to_value(&fields) {
                serde_json::Value::Object(map) => map,
                _ => serde_json::Map::new(),
            };
            let result = col.update(&to_filter(&filters), updates)?;
            print_output(&serde_json::to_value(result)?, &cli.format)?;
        }

        Command::Delete {
            collection,
            filters,
        } => {
            let col = db.collection(&collection, None)?;
            let result = col.soft_delete(&to_filter(&filters))?;
            print_output(&serde_json::to_value(result)?, &cli.format)?;
        }

        Command::HardDelete {
            collection,
            filters,
        } => {
            let col = db.collection(&collection, None)?;
            let result = col.hard_delete(&to_filter(&filters))?;
            print_output(&serde_json::to_value(result)?, &cli.format)?;
        }
    }

    Ok(())
}

fn print_output(
    value: &serde_json::Value,
    format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

/// Parse as JSON when possible (numbers, booleans, arrays, objects),
/// otherwise keep the raw string.
fn parse_value(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        map.insert(key.clone(), parse_value(val));
    }
    serde_json::Value::Object(map)
}

fn to_filter(filters: &[(String, String)]) -> Filter {
    filters
        .iter()
        .map(|(k, v)| (k.clone(), parse_value(v)))
        .collect()
}

fn read_config_file(path: &str) -> Result<CollectionConfig, Box<dyn std::error::Error>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config file '{path}': {e}"))?;
    let config: CollectionConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
