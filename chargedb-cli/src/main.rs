use chargedb::config::{DB_PATH_ENV, DEFAULT_DB_PATH, PROFILE_ENV};
use chargedb::provision;
use chargedb::retention::{RetentionMonitor, DEFAULT_INTERVAL};
use chargedb::schema::drift::diff_profiles;
use chargedb::schema::{parse_schema, SchemaDefinition};
use chargedb::{Credentials, Filter, Profile, Provisioner, SchemaRegistry, Store};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

/// chargedb: provision and query the Iquitos EV-charging analytics store
#[derive(Parser)]
#[command(name = "chargedb", version, about)]
struct Cli {
    /// Path to the store file
    #[arg(long, env = DB_PATH_ENV, default_value = DEFAULT_DB_PATH)]
    db: String,

    /// Schema profile (production or development)
    #[arg(long, env = PROFILE_ENV, default_value = "production", value_parser = parse_profile)]
    profile: Profile,

    /// Load the schema declaration from a YAML file instead of the profile's built-in one
    #[arg(long)]
    schema_file: Option<PathBuf>,

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
    /// Create users, collections, indexes, seed data and views
    Provision {
        /// Override every retention horizon (for test environments)
        #[arg(long)]
        retention_seconds: Option<u64>,
    },

    /// Show provisioning state, collection stats, views and users
    Status,

    /// Compute an aggregation view
    View {
        /// View name
        name: String,
    },

    /// Get a single document by ID
    Get {
        /// Collection name
        collection: String,
        /// Document ID
        id: String,
    },

    /// List documents, optionally filtered by field equality
    List {
        /// Collection or view name
        collection: String,
        /// Equality filters (e.g. --filter playa=Playa_Motos)
        #[arg(long = "filter", value_parser = parse_key_value)]
        filters: Vec<(String, String)>,
    },

    /// Insert a document
    Insert {
        /// Collection name
        collection: String,
        /// Field values (e.g. --field charger_id=12)
        #[arg(long = "field", value_parser = parse_key_value, conflicts_with = "json")]
        fields: Vec<(String, String)>,
        /// The whole document as JSON
        #[arg(long)]
        json: Option<String>,
    },

    /// List the indexes of a collection
    Indexes {
        /// Collection name
        collection: String,
    },

    /// Check stored documents against the current validators
    Validate,

    /// Delete documents past their retention horizon, once
    Purge,

    /// Keep deleting expired documents in the foreground
    Retain {
        /// Seconds between sweeps
        #[arg(long)]
        interval_seconds: Option<u64>,
    },

    /// Compare the selected profile with the other one
    Drift,
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: no '=' found in '{s}'"))?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn parse_profile(s: &str) -> Result<Profile, String> {
    s.parse().map_err(|e: chargedb::ChargeDbError| e.to_string())
}

/// The declaration to provision: `--schema-file` wins over the built-in profile
fn load_definition(cli: &Cli) -> chargedb::Result<SchemaDefinition> {
    match &cli.schema_file {
        Some(path) => parse_schema(path),
        None => cli.profile.definition(),
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Command::Provision { retention_seconds } => {
            let mut definition = load_definition(&cli)?;
            if let Some(secs) = retention_seconds {
                let names: Vec<String> = definition.collections.keys().cloned().collect();
                for name in names {
                    if definition.set_retention_horizon(&name, secs) > 0 {
                        log::warn!("Retention on {name} shortened to {secs}s");
                    }
                }
            }

            let registry = SchemaRegistry::new(definition)?;
            let credentials = Credentials::from_env();
            let seeds = cli.profile.seeds(Utc::now())?;
            let provisioner = Provisioner::new(registry, credentials, seeds);

            let store = Store::open(&cli.db)?;
            match provisioner.run(&store) {
                Ok(report) => {
                    for step in &report.steps {
                        println!("{step}");
                    }
                    println!("{}", report.state);
                }
                Err(failure) => {
                    for step in &failure.report.steps {
                        println!("{step}");
                    }
                    return Err(failure.into());
                }
            }
        }

        Command::Status => {
            let store = Store::open(&cli.db)?;
            let registry = SchemaRegistry::new(load_definition(&cli)?)?;
            let seeds = cli.profile.seeds(Utc::now())?;
            let state = provision::inspect(&registry, &seeds, &store)?;
            let mut status = store.status()?;
            status["profile"] = serde_json::json!(cli.profile.as_str());
            status["state"] = serde_json::json!(state.as_str());
            print_output(&status, &cli.format)?;
        }

        Command::View { name } => {
            let store = Store::open(&cli.db)?;
            let rows = store.read_view(&name)?;
            print_output(&serde_json::Value::Array(rows), &cli.format)?;
        }

        Command::Get { collection, id } => {
            let store = Store::open(&cli.db)?;
            let doc = store.get(&collection, &id)?;
            print_output(&doc, &cli.format)?;
        }

        Command::List {
            collection,
            filters,
        } => {
            let store = Store::open(&cli.db)?;
            let filter = filters
                .into_iter()
                .fold(Filter::new(), |f, (key, val)| f.eq(key, parse_scalar(&val)));
            let docs = store.find(&collection, &filter)?;
            print_output(&serde_json::Value::Array(docs), &cli.format)?;
        }

        Command::Insert {
            collection,
            fields,
            json,
        } => {
            let store = Store::open(&cli.db)?;
            let data = match json {
                Some(text) => serde_json::from_str(&text)?,
                None => fields_to_value(&fields),
            };
            let id = store.insert(&collection, data)?;
            print_output(&serde_json::json!({ "id": id }), &cli.format)?;
        }

        Command::Indexes { collection } => {
            let store = Store::open(&cli.db)?;
            let indexes: Vec<serde_json::Value> = store
                .list_indexes(&collection)?
                .iter()
                .map(|spec| serde_json::json!({ "name": spec.name, "spec": spec.describe() }))
                .collect();
            print_output(&serde_json::Value::Array(indexes), &cli.format)?;
        }

        Command::Validate => {
            let store = Store::open(&cli.db)?;
            print_output(&store.validate_all()?, &cli.format)?;
        }

        Command::Purge => {
            let store = Store::open(&cli.db)?;
            let events: Vec<serde_json::Value> = store
                .purge_expired(Utc::now())?
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "collection": e.collection,
                        "index": e.index,
                        "cutoff": e.cutoff.to_rfc3339(),
                        "removed": e.removed,
                    })
                })
                .collect();
            print_output(&serde_json::Value::Array(events), &cli.format)?;
        }

        Command::Retain { interval_seconds } => {
            let interval = interval_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_INTERVAL);
            let monitor = RetentionMonitor::start(Path::new(&cli.db), interval)?;
            // runs until the process is killed
            for event in monitor.event_rx.iter() {
                println!(
                    "{}: removed {} document(s) older than {}",
                    event.collection,
                    event.removed,
                    event.cutoff.to_rfc3339()
                );
            }
        }

        Command::Drift => {
            let other = match cli.profile {
                Profile::Production => Profile::Development,
                Profile::Development => Profile::Production,
            };
            let drift: Vec<String> = diff_profiles(&cli.profile.definition()?, &other.definition()?)
                .iter()
                .map(|d| d.describe())
                .collect();
            print_output(
                &serde_json::json!({
                    "base": cli.profile.as_str(),
                    "other": other.as_str(),
                    "differences": drift,
                }),
                &cli.format,
            )?;
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

/// Numbers, booleans and JSON literals keep their type; anything else is a string.
fn parse_scalar(val: &str) -> serde_json::Value {
    serde_json::from_str(val).unwrap_or_else(|_| serde_json::Value::String(val.to_string()))
}

fn fields_to_value(fields: &[(String, String)]) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        map.insert(key.clone(), parse_scalar(val));
    }
    serde_json::Value::Object(map)
}
