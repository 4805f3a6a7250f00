//! Runs the lakebook tutorial pipeline against a CSV file.
//!
//! ```bash
//! lakebook run --input sample_data.csv --warehouse /tmp/wh --dbfs-root /tmp/dbfs
//! ```
//!
//! The input needs the columns `id`, `column1`, `column2`, `date_column`
//! (`yyyy-MM-dd`) and `target`.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use datafusion::arrow::datatypes::DataType;
use datafusion::common::ScalarValue;
use datafusion::logical_expr::cast;
use lakebook_core::functions::{col, current_date, datediff, lit, to_date, udf, when};
use lakebook_core::ml::{LinearRegression, VectorAssembler};
use lakebook_core::{LakebookError, SaveMode, Session, conf};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lakebook", version, about = "Local lakehouse notebook engine")]
struct Cli {
    /// Tracing filter, e.g. `info` or `lakebook_core=debug`. Falls back to `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the tutorial pipeline end to end.
    Run(RunArgs),
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// CSV input with a header row.
    #[arg(long)]
    input: PathBuf,

    /// Directory holding catalog tables.
    #[arg(long, default_value = conf::DEFAULT_WAREHOUSE_DIR)]
    warehouse: PathBuf,

    /// Local directory standing in for `dbfs:/`.
    #[arg(long, default_value = conf::DEFAULT_DBFS_ROOT)]
    dbfs_root: PathBuf,

    /// Output directory for the delta table written by path.
    #[arg(long)]
    output: Option<String>,

    /// Widget binding, `key=value`. May be repeated.
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, String)>,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{s}'")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Run(args) => run(args).await,
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    if !args.input.is_file() {
        bail!("input file {} does not exist", args.input.display());
    }
    let input = std::path::absolute(&args.input)?;
    let input = input.to_string_lossy();

    // 1. Setup
    let spark = Session::builder()
        .app_name("DatabricksPySparkTutorial")
        .config(conf::WAREHOUSE_DIR, args.warehouse.to_string_lossy())
        .config(conf::DBFS_ROOT, args.dbfs_root.to_string_lossy())
        .get_or_create()?;
    println!("{}", spark.version());
    let spark = Session::builder()
        .app_name("DatabricksPySparkTutorial")
        .config(conf::DRIVER_MEMORY, "4g")
        .get_or_create()?;

    // 2. Loading and writing data
    let df = spark
        .read()
        .option("header", true)
        .option("inferSchema", true)
        .csv(&input)
        .await?;
    df.write()
        .mode(SaveMode::Overwrite)
        .parquet("dbfs:/FileStore/sample_data.parquet")
        .await?;
    let df_parquet = spark.read().parquet("dbfs:/FileStore/sample_data.parquet").await?;
    info!("Read {} rows back from parquet", df_parquet.count().await?);
    df.write()
        .mode(SaveMode::Overwrite)
        .parquet("dbfs:/FileStore/output_data")
        .await?;
    df_parquet
        .write()
        .mode(SaveMode::Overwrite)
        .format("parquet")
        .save_as_table("default.sample_table")
        .await?;
    let df_table = spark.table("default.sample_table").await?;

    // 3. Dataframe manipulation
    df.show(10).await?;
    df.print_schema();
    df.select(&["column1", "column2"])?.show_default().await?;
    let df_filtered = df.filter(df.col("column1")?.gt(lit(100)))?;
    df_filtered.show_default().await?;
    df.group_by(&["column1"])?
        .agg_map(&[("column2", "sum")])?
        .show_default()
        .await?;
    df.order_by(&["column1"], false)?.show_default().await?;
    let df_joined = df.join(&df_table, df.col("id")?.eq(df_table.col("id")?), "inner")?;
    df_joined.show_default().await?;
    let df_no_nulls = df.na().drop()?;
    let df_filled = df.na().fill(0)?;
    info!(
        "{} rows without nulls, {} rows after fill",
        df_no_nulls.count().await?,
        df_filled.count().await?
    );
    let df = df.with_column("new_column", col("column1") * lit(2))?;
    let df = df.with_column("constant", lit(100))?;

    // 4. SQL
    df.create_or_replace_temp_view("temp_table")?;
    let result = spark
        .sql("SELECT column1, COUNT(*) FROM temp_table GROUP BY column1")
        .await?;
    result.show_default().await?;

    // 5. Functions
    let df = df.with_column(
        "category",
        when(col("column1").gt(lit(100)), lit("High")).otherwise(lit("Low"))?,
    )?;
    let date_text = cast(col("date_column"), DataType::Utf8);
    let df = df.with_column("date", to_date(date_text, "yyyy-MM-dd")?)?;
    let df = df.with_column("days_diff", datediff(current_date(), col("date")))?;
    let my_function = udf(
        "my_function",
        vec![DataType::Float64],
        DataType::Utf8,
        |args: &[ScalarValue]| match &args[0] {
            ScalarValue::Float64(Some(x)) => Ok(ScalarValue::from(format!("{}", x * 2.0))),
            ScalarValue::Float64(None) => Ok(ScalarValue::Null),
            other => Err(LakebookError::invalid(format!(
                "my_function expects a double, got {other:?}"
            ))),
        },
    );
    spark.udf().register(&my_function);
    let df = df.with_column(
        "result",
        my_function.call(vec![cast(col("column1"), DataType::Float64)]),
    )?;

    // 6. Optimization and resource management
    let df = df.cache().await?;
    info!("Cached rows: {}", df.count().await?);
    let df = df.unpersist().await?;
    let df = df.repartition(10)?;
    let df = df.coalesce(2)?;
    df.explain(false).await?;

    // 7. Notebook utilities
    for info in spark.utils().fs().ls("dbfs:/FileStore/").await? {
        println!("{}\t{}", info.path, info.size);
    }
    let widgets = spark.utils().widgets();
    widgets.text("parameter", "default_value", None)?;
    for (key, value) in &args.params {
        widgets.bind(key, value)?;
    }
    let value = widgets.get("parameter")?;
    println!("Widget value: {value}");

    // 8. Machine learning
    let assembler = VectorAssembler::new(&["column1", "column2"], "features");
    let df_ml = assembler.transform(&df).await?;
    let lr = LinearRegression::new()
        .features_col("features")
        .label_col("target");
    let model = lr.fit(&df_ml).await?;
    let predictions = model.transform(&df_ml)?;
    predictions.show_default().await?;

    // 9. Delta
    let df_delta = df.drop(&["date", "days_diff"])?;
    df_delta
        .write()
        .format("delta")
        .mode(SaveMode::Overwrite)
        .save_as_table("default.delta_table")
        .await?;
    spark.sql("OPTIMIZE default.delta_table").await?.show_default().await?;

    // 10. Preview and export
    df.show(5).await?;
    let output = args
        .output
        .unwrap_or_else(|| "dbfs:/FileStore/delta_table".to_string());
    df_delta
        .write()
        .format("delta")
        .mode(SaveMode::Overwrite)
        .save(&output)
        .await
        .with_context(|| format!("writing delta table to {output}"))?;
    info!("Pipeline finished");
    spark.stop();
    Ok(())
}
