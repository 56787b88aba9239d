use clap::{Parser, Subcommand};

use qcommerce_router::config::Config;
use qcommerce_router::context::AppContext;
use qcommerce_router::indexer::{IndexReport, index_all};
use qcommerce_router::pipeline::{self, AskOptions};
use qcommerce_router::resolver::RelevanceMatch;
use qcommerce_router::schema::TableSchema;

#[derive(Parser)]
#[command(
    name = "qcr",
    about = "Ask natural language questions across quick-commerce databases"
)]
struct Cli {
    /// Output machine-readable JSON (default: human-readable)
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer a question across every database with relevant tables
    Ask {
        /// Natural language question (positional, collects remaining args)
        query: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long = "db")]
        database: Option<String>,
        #[arg(long, help = "Add a short cross-platform summary")]
        summarize: bool,
    },
    /// Show the tables relevant to a question, with scores
    Tables {
        query: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long = "db")]
        database: Option<String>,
    },
    /// Extract schemas and (re)build the vector index
    Index {
        #[arg(long = "db")]
        database: Option<String>,
    },
    /// Print the live schema of one database
    Schema {
        #[arg(long = "db")]
        database: String,
    },
}

// ============================================================================
// Output Formatting
// ============================================================================

fn print_matches(matches: &[RelevanceMatch]) {
    if matches.is_empty() {
        eprintln!("No relevant tables found. Run `qcr index` first if the index is empty.");
        return;
    }
    for m in matches {
        println!("{:.3}  {}.{}", m.score, m.database, m.table);
    }
}

fn print_reports(reports: &[IndexReport]) {
    for report in reports {
        println!("{}: {} tables indexed", report.database, report.indexed);
        for (table, message) in &report.failures {
            println!("  ! {table}: {message}");
        }
    }
}

fn print_schemas(database: &str, schemas: &[TableSchema]) {
    if schemas.is_empty() {
        eprintln!("No tables found in '{database}'.");
        return;
    }
    for (i, schema) in schemas.iter().enumerate() {
        if i > 0 {
            println!();
        }
        println!("{}", schema.table_name);
        for col in &schema.columns {
            println!("  {} {}", col.name, col.data_type);
        }
    }
}

fn join_query(words: &[String]) -> Result<String, String> {
    let query = words.join(" ");
    if query.trim().is_empty() {
        return Err("A question is required, e.g. `qcr ask cheapest milk`".to_string());
    }
    Ok(query)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;
    let ctx = AppContext::from_config(config)?;

    match cli.command {
        Command::Ask {
            query,
            top_k,
            database,
            summarize,
        } => {
            let query = join_query(&query)?;
            let options = AskOptions {
                top_k,
                summarize,
                database,
            };
            let answer = pipeline::ask(&ctx, &query, &options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&answer)?);
            } else {
                print!("{}", answer.render());
            }
        }
        Command::Tables {
            query,
            top_k,
            database,
        } => {
            let query = join_query(&query)?;
            let matches =
                pipeline::resolve_tables(&ctx, &query, top_k, database.as_deref()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&matches)?);
            } else {
                print_matches(&matches);
            }
        }
        Command::Index { database } => {
            let reports = index_all(&ctx, database.as_deref()).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&reports)?);
            } else {
                print_reports(&reports);
            }
        }
        Command::Schema { database } => {
            let schemas = pipeline::describe_schema(&ctx, &database).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&schemas)?);
            } else {
                print_schemas(&database, &schemas);
            }
        }
    }

    Ok(())
}
