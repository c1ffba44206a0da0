use std::path::PathBuf;
use std::time::Instant;

use aviation_loader::config::{Backend, Config, ViewMode};
use aviation_loader::import::{Importer, ViewReport};
use aviation_loader::record::{EVENT_DATE, MAKE};
use aviation_loader::reports;
use aviation_loader::store::{Document, DocumentStore, ElasticStore, Filter, MemoryStore};
use aviation_loader::view::{AggregatedPeriod, Period, ViewDefinition, ViewMaintainer};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use elasticsearch::auth::Credentials;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "aviation-loader", version, about = "Imports aviation crash reports and maintains views over them")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Import a pipe-delimited file, index it and update the views
    Import {
        data: PathBuf,
        database: String,
        collection: String,
        /// Records per bulk insert
        #[arg(long)]
        checkpoint: Option<usize>,
        #[arg(long)]
        views_dir: Option<PathBuf>,
        /// Update views record by record instead of rebuilding them
        #[arg(long)]
        incremental: bool,
        /// Drop the collection and its views first
        #[arg(long)]
        drop: bool,
    },
    /// Rebuild every view of a collection
    Rebuild {
        database: String,
        collection: String,
        #[arg(long)]
        views_dir: Option<PathBuf>,
    },
    /// Run a query and print one JSON document per line
    Report {
        database: String,
        collection: String,
        #[command(subcommand)]
        query: Query,
    },
}

#[derive(Subcommand)]
enum Query {
    /// Find one crash by id
    Id { id: String },
    /// Crashes with FROM <= Event Date < TO (YYYY-MM-DD)
    Range { from: NaiveDate, to: NaiveDate },
    /// All crashes sorted by make, descending
    Makes {
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Crashes of one make
    Make {
        make: String,
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Count the crashes of one make
    CountMake {
        make: String,
        #[arg(long)]
        map_reduce: bool,
    },
    /// Crashes per make
    GroupMakes {
        #[arg(long)]
        map_reduce: bool,
        /// Documents read by the map/reduce version
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },
    /// Crashes and fatalities per period, computed from the crashes
    Periods {
        #[arg(long, value_enum, default_value_t = PeriodArg::YearMonth)]
        period: PeriodArg,
        #[arg(long)]
        make: Option<String>,
        #[arg(long, requires = "to")]
        from: Option<NaiveDate>,
        #[arg(long, requires = "from")]
        to: Option<NaiveDate>,
    },
    /// Crashes and fatalities per period, read from the materialized view
    View {
        #[arg(long, default_value = "event_date")]
        name: String,
        #[arg(long, value_enum, default_value_t = PeriodArg::YearMonth)]
        period: PeriodArg,
        #[arg(long, requires = "to_year")]
        from_year: Option<i32>,
        #[arg(long, requires = "from_year")]
        to_year: Option<i32>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum PeriodArg {
    YearMonth,
    Year,
    All,
}

impl From<PeriodArg> for Period {
    fn from(period: PeriodArg) -> Self {
        match period {
            PeriodArg::YearMonth => Period::YearMonth,
            PeriodArg::Year => Period::Year,
            PeriodArg::All => Period::All,
        }
    }
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    init_logging(&config);

    let database = match &cli.command {
        Command::Import { database, .. }
        | Command::Rebuild { database, .. }
        | Command::Report { database, .. } => database.clone(),
    };
    match &cli.command {
        Command::Import {
            checkpoint,
            views_dir,
            incremental,
            ..
        } => {
            if let Some(checkpoint) = checkpoint {
                config.import.checkpoint = *checkpoint;
            }
            if let Some(views_dir) = views_dir {
                config.import.views_dir = views_dir.clone();
            }
            if *incremental {
                config.import.view_mode = ViewMode::Incremental;
            }
        }
        Command::Rebuild {
            views_dir: Some(views_dir),
            ..
        } => config.import.views_dir = views_dir.clone(),
        _ => {}
    }
    config.validate()?;

    match config.store.backend {
        Backend::Elasticsearch => {
            let mut builder = ElasticStore::builder()
                .with_uri(config.store.uri.clone())
                .with_database(database)
                .with_page_size(config.store.page_size)
                .with_retry_on_conflict(config.store.retry_on_conflict);
            if let (Some(username), Some(password)) = (&config.store.username, &config.store.password) {
                builder = builder.with_credentials(Credentials::Basic(username.clone(), password.clone()));
            }
            execute(&builder.build()?, &config, cli.command).await
        }
        Backend::Memory => {
            log::warn!("Using the in-memory store, nothing is kept after this run");
            execute(&MemoryStore::new(), &config, cli.command).await
        }
    }
}

fn init_logging(config: &Config) {
    let mut builder = pretty_env_logger::formatted_builder();
    match std::env::var("RUST_LOG") {
        Ok(filters) => builder.parse_filters(&filters),
        Err(_) => builder.filter_level(config.logging.level.to_level_filter()),
    };
    builder.init();
}

async fn execute<S: DocumentStore>(
    store: &S,
    config: &Config,
    command: Command,
) -> Result<(), Box<dyn std::error::Error>> {
    let start = Instant::now();
    match command {
        Command::Import {
            data,
            collection,
            drop,
            ..
        } => {
            let report = Importer::new(store, config.import.clone())
                .with_drop(drop)
                .run(&data, &collection)
                .await?;
            println!("{}", report.stats);
            print_views(&report.views);
        }
        Command::Rebuild { collection, .. } => {
            let views = Importer::new(store, config.import.clone())
                .rebuild_views(&collection)
                .await?;
            print_views(&views);
        }
        Command::Report { collection, query, .. } => {
            report(store, config, &collection, query).await?;
        }
    }
    println!("Time: {:.3}", start.elapsed().as_secs_f64());
    Ok(())
}

fn print_views(views: &[ViewReport]) {
    for view in views {
        match view.mode {
            ViewMode::Rebuild => println!(
                "Created view {} ({} key(s)) in {:.3} seconds",
                view.name,
                view.keys.unwrap_or_default(),
                view.elapsed.as_secs_f64()
            ),
            ViewMode::Incremental => println!(
                "Updated view {} with {} document(s)",
                view.name, view.records
            ),
        }
    }
}

fn print_periods(periods: &[AggregatedPeriod]) {
    for period in periods {
        println!(
            "{}",
            json!({
                "_id": period.key,
                "value": { "crashes": period.crashes, "fatalities": period.fatalities },
            })
        );
    }
}

async fn report<S: DocumentStore>(
    store: &S,
    config: &Config,
    collection: &str,
    query: Query,
) -> Result<(), Box<dyn std::error::Error>> {
    let documents: Vec<Document> = match query {
        Query::Id { id } => {
            log::info!("Finding crash with ID {id}");
            reports::find_by_id(store, collection, &id)
                .await?
                .into_iter()
                .collect()
        }
        Query::Range { from, to } => {
            log::info!("Finding crashes between {from} and {to}");
            reports::find_by_range(store, collection, from, to).await?
        }
        Query::Makes { limit } => {
            log::info!("Finding all documents sorted by '{MAKE}'");
            reports::find_all_makes(store, collection, limit).await?
        }
        Query::Make { make, limit } => {
            log::info!("Finding all crashes of '{make}'");
            reports::find_by_make(store, collection, &make, limit).await?
        }
        Query::CountMake { make, map_reduce } => {
            let count = if map_reduce {
                reports::count_by_make_map_reduce(store, collection, &make).await?
            } else {
                reports::count_by_make(store, collection, &make).await?
            };
            println!("{}", json!({ "_id": make, "value": { "crashes": count } }));
            return Ok(());
        }
        Query::GroupMakes { map_reduce, limit } => {
            if map_reduce {
                for reduced in reports::group_by_make_map_reduce(store, collection, limit).await? {
                    println!("{}", Value::Object(reduced.to_document()));
                }
            } else {
                for (make, crashes) in reports::group_by_make(store, collection).await? {
                    println!("{}", json!({ MAKE: make, "crashes": crashes }));
                }
            }
            return Ok(());
        }
        Query::Periods {
            period,
            make,
            from,
            to,
        } => {
            let mut filter = Filter::All;
            if let Some(make) = make {
                filter = filter.and(Filter::eq(MAKE, make));
            }
            if let (Some(from), Some(to)) = (from, to) {
                filter = filter.and(Filter::date_range(EVENT_DATE, from, to));
            }
            let periods = reports::crashes_by_period(store, collection, period.into(), filter).await?;
            print_periods(&periods);
            return Ok(());
        }
        Query::View {
            name,
            period,
            from_year,
            to_year,
        } => {
            let path = config.import.views_dir.join(format!("{name}.toml"));
            let definition = if path.is_file() {
                ViewDefinition::load(&path)?
            } else {
                ViewDefinition::event_date()
            };
            let view = ViewMaintainer::new(definition, collection).with_view_collection(name);
            let years = from_year.zip(to_year).map(|(from, to)| from..=to);
            let periods = view.rollup(store, period.into(), years).await?;
            print_periods(&periods);
            return Ok(());
        }
    };

    for document in documents {
        println!("{}", Value::Object(document));
    }
    Ok(())
}
