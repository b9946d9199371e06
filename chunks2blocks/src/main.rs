//! Command line entry point: converts one plan file into one TSDB block.
#![deny(rustdoc::broken_intra_doc_links, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::clone_on_ref_ptr,
    clippy::todo,
    clippy::dbg_macro
)]

use std::{fs, io, path::PathBuf, process::ExitCode, sync::Arc};

use block_builder::{cleanup, schema::SchemaConfig, Builder, BuilderConfig};
use clap::Parser;
use object_store::{local::LocalFileSystem, memory::InMemory, DynObjectStore};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use ulid::Ulid;

mod plan;

/// Which object store implementation backs chunk reads and block uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ObjectStoreKind {
    /// Objects in a local directory, for production-like runs and tests.
    File,
    /// Ephemeral in-process store, for tests.
    Memory,
}

#[derive(Debug, Parser)]
#[clap(
    name = "chunks2blocks",
    about = "Converts per-series chunk objects into per-day TSDB blocks"
)]
struct Config {
    #[clap(flatten)]
    builder: BuilderConfig,

    /// Plan file to process: a JSON header line `{"tenant": ..., "day":
    /// ...}` followed by one plan entry per line.
    #[clap(long = "plan-file", env = "CHUNKS2BLOCKS_PLAN_FILE")]
    plan_file: PathBuf,

    /// JSON file mapping day periods to chunk store prefixes.
    #[clap(long = "chunks-schema-config", env = "CHUNKS2BLOCKS_SCHEMA_CONFIG")]
    schema_config: PathBuf,

    /// Object store implementation.
    #[clap(
        long = "object-store",
        env = "CHUNKS2BLOCKS_OBJECT_STORE",
        value_enum,
        default_value = "file"
    )]
    object_store: ObjectStoreKind,

    /// Root directory of the `file` object store.
    #[clap(long = "data-dir", env = "CHUNKS2BLOCKS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log filter, e.g. `info` or `block_builder=debug`.
    #[clap(long = "log-filter", env = "LOG_FILTER", default_value = "info")]
    log_filter: String,
}

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("invalid log filter {filter:?}: {source}"))]
    LogFilter {
        filter: String,
        source: tracing_subscriber::filter::ParseError,
    },

    #[snafu(display("--data-dir is required with --object-store file"))]
    MissingDataDir,

    #[snafu(display("failed to create data directory {}: {source}", path.display()))]
    CreateDataDir { path: PathBuf, source: io::Error },

    #[snafu(display("failed to open object store: {source}"))]
    Store { source: object_store::Error },

    #[snafu(display("failed to load schema config: {source}"))]
    Schema {
        source: block_builder::schema::SchemaError,
    },

    #[snafu(display("failed to clean up output directory: {source}"))]
    Cleanup {
        source: block_builder::cleanup::CleanupError,
    },

    #[snafu(display("{source}"))]
    Builder { source: block_builder::Error },

    #[snafu(display("failed to read plan file: {source}"))]
    Plan { source: plan::PlanError },

    #[snafu(display("plan feeder task panicked: {source}"))]
    FeederPanic { source: tokio::task::JoinError },
}

type Result<T, E = Error> = std::result::Result<T, E>;

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    if let Err(e) = init_logging(&config.log_filter) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    match run(config).await {
        Ok(Some(ulid)) => {
            // The produced block's ULID is the tool's output; the caller
            // records it in the plan's progress file.
            println!("{ulid}");
            ExitCode::SUCCESS
        }
        Ok(None) => {
            info!("plan produced no block");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "conversion failed");
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(filter: &str) -> Result<()> {
    let env_filter =
        tracing_subscriber::EnvFilter::try_new(filter).context(LogFilterSnafu { filter })?;
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(config: Config) -> Result<Option<Ulid>> {
    let store = make_object_store(&config)?;
    let schema = SchemaConfig::load(&config.schema_config).context(SchemaSnafu)?;

    let registry = prometheus::Registry::new();
    let builder = Builder::new(
        config.builder.clone(),
        Arc::clone(&store),
        store,
        schema,
        &registry,
    )
    .context(BuilderSnafu)?;

    // Reclaim unfinished blocks of prior runs before building anything.
    cleanup::cleanup_output_dir(&config.builder.output_dir).context(CleanupSnafu)?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let (header, entries, feeder) = plan::stream_plan_file(&config.plan_file, cancel.clone())
        .await
        .context(PlanSnafu)?;
    info!(
        tenant = %header.tenant,
        day = %header.day,
        plan = %config.plan_file.display(),
        "processing plan"
    );

    let result = builder
        .process_plan(&header.tenant, header.day, entries, cancel)
        .await;

    // A feeder failure cancels the build; report the root cause, not the
    // cancellation it provoked.
    let fed = feeder.await.context(FeederPanicSnafu)?;
    match (fed, result) {
        (Err(plan_error), _) => Err(Error::Plan { source: plan_error }),
        (Ok(entry_count), result) => {
            let block = result.context(BuilderSnafu)?;
            info!(entry_count, "plan drained");
            Ok(block)
        }
    }
}

fn make_object_store(config: &Config) -> Result<Arc<DynObjectStore>> {
    match config.object_store {
        ObjectStoreKind::Memory => Ok(Arc::new(InMemory::new())),
        ObjectStoreKind::File => {
            let data_dir = config.data_dir.as_ref().context(MissingDataDirSnafu)?;
            fs::create_dir_all(data_dir).context(CreateDataDirSnafu { path: data_dir })?;
            let store = LocalFileSystem::new_with_prefix(data_dir).context(StoreSnafu)?;
            Ok(Arc::new(store))
        }
    }
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, cancelling build");
            cancel.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::TENANT_ID_EXTERNAL_LABEL;
    use std::io::Write;

    fn write_file(path: &std::path::Path, content: &str) {
        let mut f = fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn config_parses_with_flattened_builder_flags() {
        let config = Config::parse_from([
            "chunks2blocks",
            "--output-dir",
            "/tmp/out",
            "--plan-file",
            "/tmp/plan",
            "--chunks-schema-config",
            "/tmp/schema.json",
            "--object-store",
            "memory",
            "--concurrency",
            "8",
            "--upload",
            "false",
        ]);
        assert_eq!(config.builder.concurrency, 8);
        assert!(!config.builder.upload);
        assert_eq!(config.object_store, ObjectStoreKind::Memory);
    }

    #[test]
    fn file_store_requires_data_dir() {
        let config = Config::parse_from([
            "chunks2blocks",
            "--output-dir",
            "/tmp/out",
            "--plan-file",
            "/tmp/plan",
            "--chunks-schema-config",
            "/tmp/schema.json",
        ]);
        assert!(matches!(
            make_object_store(&config),
            Err(Error::MissingDataDir)
        ));
    }

    #[tokio::test]
    async fn converts_a_plan_file_end_to_end() {
        use data_types::{Chunk, Labels, Sample};
        use object_store::{path::Path as ObjectPath, ObjectStore};

        let dir = tempfile::tempdir().unwrap();
        let data_dir = dir.path().join("data");
        let out_dir = dir.path().join("out");

        // Seed the chunk store through the same backend the binary opens.
        fs::create_dir_all(&data_dir).unwrap();
        let seed_store = LocalFileSystem::new_with_prefix(&data_dir).unwrap();
        let chunk = Chunk::new(
            Labels::from_pairs(&[("__name__", "up"), ("job", "api")]),
            vec![
                Sample {
                    timestamp: 0,
                    value: 1.0,
                },
                Sample {
                    timestamp: 10,
                    value: 1.0,
                },
            ],
        );
        seed_store
            .put(
                &ObjectPath::from("v9/tenant-1/c1"),
                chunk.encode().unwrap(),
            )
            .await
            .unwrap();

        let schema_path = dir.path().join("schema.json");
        write_file(
            &schema_path,
            r#"{"configs": [{"from": "2020-01-01", "prefix": "v9"}]}"#,
        );

        let plan_path = dir.path().join("plan.json");
        write_file(
            &plan_path,
            concat!(
                "{\"tenant\": \"tenant-1\", \"day\": \"2020-03-15\"}\n",
                "{\"series_id\": \"s1\", \"chunks\": [\"c1\"]}\n",
            ),
        );

        let config = Config::parse_from([
            "chunks2blocks",
            "--output-dir",
            out_dir.to_str().unwrap(),
            "--plan-file",
            plan_path.to_str().unwrap(),
            "--chunks-schema-config",
            schema_path.to_str().unwrap(),
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--delete-local-blocks",
            "false",
        ]);

        let ulid = run(config).await.unwrap().expect("block produced");

        // The block was uploaded back into the object store under the
        // tenant prefix.
        let uploaded = fs::read(
            data_dir
                .join("tenant-1")
                .join(ulid.to_string())
                .join("meta.json"),
        )
        .unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&uploaded).unwrap();
        assert_eq!(meta["thanos"]["labels"][TENANT_ID_EXTERNAL_LABEL], "tenant-1");
        assert_eq!(meta["stats"]["numSamples"], 2);

        // The local copy remains because --delete-local-blocks=false.
        assert!(out_dir.join(ulid.to_string()).join("index").is_file());
    }
}
