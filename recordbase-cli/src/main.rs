use clap::{Parser, Subcommand, ValueEnum};
use recordbase::columns::ColumnTree;
use recordbase::permission::AllowAll;
use recordbase::query::{build_query, QueryRequest};
use recordbase::sql::pretty;
use recordbase::store::{Change, ChangeListener};
use recordbase::{
    parse_model, sync, Config, Context, Database, PatchLedger, Request, Service, SharedContext, User,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

/// recordbase CLI: schema sync, column catalogue and requests against a record database
#[derive(Parser)]
#[command(name = "recordbase", version, about)]
struct Cli {
    /// Metadata model file (default: $RECORDBASE_METADATA)
    #[arg(long)]
    metadata: Option<PathBuf>,

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
    /// Bring the database schema in line with the metadata model
    Sync {
        /// Show the planned changes without applying them
        #[arg(long)]
        dry_run: bool,
    },
    /// List every query column of a table
    Columns {
        /// Record name of the table (e.g. Family)
        table: String,
    },
    /// Print the SQL a QUERY request compiles to
    Sql {
        /// JSON request file, or - for stdin
        request: String,
    },
    /// Run a JSON request
    Request {
        /// JSON request file, or - for stdin
        request: String,
        /// Id of the user the request runs as
        #[arg(long)]
        user: String,
    },
    /// Show the audit trail of a record
    History {
        /// Record name of the table
        table: String,
        /// Record id
        id: String,
        #[arg(long)]
        user: String,
    },
}

/// Logs every committed change.
struct LogListener;

impl ChangeListener for LogListener {
    fn record_changed(&self, change: &Change) {
        let action = match (&change.old, &change.new) {
            (None, _) => "inserted",
            (_, None) => "deleted",
            _ => "updated",
        };
        log::info!("{} {}/{} by {}", action, change.table, change.id, change.user_id);
    }
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
    match &cli.command {
        Command::Columns { table } => {
            let model = parse_model(&metadata_path(&cli)?)?;
            let tree = ColumnTree::build(&model)?;
            let columns: Vec<Value> = tree
                .describe_columns(table)?
                .into_iter()
                .map(|c| json!({ "path": c.path, "kind": c.kind, "subkey": c.subkey }))
                .collect();
            print_output(&Value::Array(columns), &cli.format)?;
        }
        Command::Sql { request } => {
            let model = Arc::new(parse_model(&metadata_path(&cli)?)?);
            let context = Context::declared(model)?;
            let request: QueryRequest = serde_json::from_str(&read_input(request)?)?;
            let statement = build_query(&context, &request)?;
            println!("{}", pretty(&statement.sql.to_inline()));
        }
        Command::Sync { dry_run } => {
            let config = config(&cli)?;
            let model = parse_model(&config.metadata)?;
            let mut database = connect(&config)?;
            let output = if *dry_run {
                let live = database.transaction(|backend| sync::LiveSchema::introspect(backend, &config.schema))?;
                let plan = sync::plan(&model, &config.schema, &live)?;
                let changes: Vec<String> = plan.changes.iter().map(|c| c.to_string()).collect();
                json!({ "dry_run": true, "changes": changes })
            } else {
                let report = database.transaction(|backend| sync::synchronize(backend, &model, &config.schema))?;
                json!({
                    "applied": report.applied.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                    "skipped": report.skipped.iter().map(|c| c.to_string()).collect::<Vec<_>>(),
                    "statements": report.statements,
                })
            };
            print_output(&output, &cli.format)?;
        }
        Command::Request { request, user } => {
            let body: Value = serde_json::from_str(&read_input(request)?)?;
            let config = config(&cli)?;
            let (mut database, service) = open(&config)?;
            let response = service.process_json(&mut database, &User::new(user.clone()), &body);
            print_output(&response, &cli.format)?;
        }
        Command::History { table, id, user } => {
            let config = config(&cli)?;
            let (mut database, service) = open(&config)?;
            let request: Request = serde_json::from_value(json!({
                "type": "FETCH_HISTORY",
                "tableName": table,
                "id": id,
            }))?;
            let response = service.process(&mut database, &User::new(user.clone()), &request)?;
            print_output(&serde_json::to_value(response)?, &cli.format)?;
        }
    }
    Ok(())
}

fn metadata_path(cli: &Cli) -> Result<PathBuf, Box<dyn std::error::Error>> {
    match &cli.metadata {
        Some(path) => Ok(path.clone()),
        None => std::env::var("RECORDBASE_METADATA")
            .map(PathBuf::from)
            .map_err(|_| "no metadata model: pass --metadata or set RECORDBASE_METADATA".into()),
    }
}

fn config(cli: &Cli) -> Result<Config, Box<dyn std::error::Error>> {
    let metadata = metadata_path(cli)?;
    let mut config = Config::from_lookup(|name| match name {
        "RECORDBASE_METADATA" => Some(metadata.display().to_string()),
        _ => std::env::var(name).ok(),
    })?;
    config.metadata = metadata;
    Ok(config)
}

fn connect(config: &Config) -> recordbase::Result<Database> {
    Ok(Database::connect(&config.database_url, &config.schema)?.log_queries(config.log_queries))
}

fn open(config: &Config) -> recordbase::Result<(Database, Service)> {
    let model = Arc::new(parse_model(&config.metadata)?);
    let mut database = connect(config)?;
    let layout = database.transaction(|backend| sync::live_layout(backend, &model, &config.schema))?;
    let context = Context::new(model, layout)?;
    let ledger = match &config.ledger_path {
        Some(path) => PatchLedger::open(path)?,
        None => PatchLedger::open_in_memory()?,
    };
    let mut service = Service::new(Arc::new(SharedContext::new(context)), Box::new(AllowAll), ledger)
        .history_limit(config.history_limit)
        .editing_ttl(chrono::Duration::minutes(config.editing_ttl_minutes));
    service.listen(Box::new(LogListener));
    Ok((database, service))
}

fn read_input(source: &str) -> Result<String, Box<dyn std::error::Error>> {
    if source == "-" {
        use std::io::Read;
        let mut content = String::new();
        std::io::stdin().read_to_string(&mut content)?;
        Ok(content)
    } else {
        std::fs::read_to_string(source).map_err(|e| format!("Failed to read '{source}': {e}").into())
    }
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}
