//! Command line interface for muninn product archives.
//!
//! Each subcommand opens the archive named by `--archive` (or the
//! `MUNINN_ARCHIVE` environment variable), performs one catalogue
//! operation and exits non-zero on error. Product type plug-ins, remote
//! backends and hook extensions are compiled in; builds that carry them
//! register their candidates in [`extension_set`].

mod json;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use muninn_archive::{
    Archive, AttachOptions, Extensions, IngestOptions, SearchQuery, SummaryQuery,
};
use muninn_core::expr::Parameters;
use muninn_core::Properties;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "muninn")]
#[command(about = "Product catalogue and archive management")]
#[command(version)]
struct Cli {
    /// Archive id, resolved through MUNINN_CONFIG_PATH, or a direct path
    /// to a configuration file.
    #[arg(short, long, env = "MUNINN_ARCHIVE", global = true)]
    archive: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone, Default)]
struct ExpressionArgs {
    /// Search expression.
    #[arg(default_value = "")]
    expression: String,

    /// Expression parameters as name=value pairs.
    #[arg(short, long = "parameter")]
    parameters: Vec<String>,
}

impl ExpressionArgs {
    fn parameters(&self) -> Result<Parameters> {
        let mut parameters = Parameters::new();
        for text in &self.parameters {
            let (name, value) = json::parse_parameter(text)?;
            parameters.insert(name, value);
        }
        Ok(parameters)
    }
}

#[derive(Subcommand)]
enum Command {
    /// Prepare the archive for first use.
    Prepare {
        /// Remove any existing catalogue and products first.
        #[arg(long)]
        force: bool,
    },
    /// Remove the archive: catalogue and products.
    Destroy {
        /// Remove the catalogue only, leaving stored bytes untouched.
        #[arg(long)]
        catalogue_only: bool,
    },
    /// Show archive information.
    Info,
    /// Ingest one or more files as a single product.
    Ingest {
        paths: Vec<PathBuf>,
        #[arg(long)]
        product_type: Option<String>,
        /// Create the catalogue record without storing the bytes.
        #[arg(long)]
        catalogue_only: bool,
        #[arg(long)]
        use_symlinks: bool,
        #[arg(long)]
        verify_hash: bool,
        /// Keep the files at their current location inside the archive root.
        #[arg(long)]
        use_current_path: bool,
        /// Replace an existing product with the same type and name.
        #[arg(long)]
        force: bool,
        /// Tags to set on the ingested product.
        #[arg(short, long = "tag")]
        tags: Vec<String>,
    },
    /// Attach files to an existing catalogue record (inverse of strip).
    Attach {
        paths: Vec<PathBuf>,
        #[arg(long)]
        product_type: Option<String>,
        #[arg(long)]
        use_symlinks: bool,
        #[arg(long)]
        verify_hash: bool,
        #[arg(long)]
        verify_hash_before: bool,
        /// Skip the size check against the catalogue record.
        #[arg(long)]
        force: bool,
        #[arg(long)]
        use_current_path: bool,
    },
    /// Fetch remote products into the archive.
    Pull {
        #[command(flatten)]
        expression: ExpressionArgs,
        #[arg(long)]
        verify_hash: bool,
    },
    /// Delete product bytes, keeping catalogue records.
    Strip {
        #[command(flatten)]
        expression: ExpressionArgs,
        #[arg(long)]
        force: bool,
    },
    /// Remove products from catalogue and storage.
    Remove {
        #[command(flatten)]
        expression: ExpressionArgs,
        #[arg(long)]
        force: bool,
    },
    /// Copy products out of the archive.
    Retrieve {
        #[command(flatten)]
        expression: ExpressionArgs,
        /// Target directory.
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,
        #[arg(long)]
        use_symlinks: bool,
    },
    /// Export products, optionally in a plug-in specific format.
    Export {
        #[command(flatten)]
        expression: ExpressionArgs,
        #[arg(short, long, default_value = ".")]
        directory: PathBuf,
        #[arg(short, long)]
        format: Option<String>,
    },
    /// Search the product catalogue.
    Search {
        #[command(flatten)]
        expression: ExpressionArgs,
        /// Properties to sort on, with optional +/- prefix.
        #[arg(short, long = "order-by")]
        order_by: Vec<String>,
        #[arg(short, long)]
        limit: Option<i64>,
        /// Count matching products instead of listing them.
        #[arg(long)]
        count: bool,
    },
    /// Aggregate over matching products.
    Summary {
        #[command(flatten)]
        expression: ExpressionArgs,
        /// Aggregates as <property>.<min|max|sum|avg>.
        #[arg(short = 'g', long = "aggregate")]
        aggregates: Vec<String>,
        #[arg(long = "group-by")]
        group_by: Vec<String>,
        #[arg(long)]
        group_by_tag: bool,
        #[arg(long)]
        having: Option<String>,
        #[arg(short, long = "order-by")]
        order_by: Vec<String>,
    },
    /// Set tags on a product.
    Tag { uuid: Uuid, tags: Vec<String> },
    /// Remove tags from a product (all tags when none are given).
    Untag { uuid: Uuid, tags: Vec<String> },
    /// List the tags of matching products.
    ListTags {
        #[command(flatten)]
        expression: ExpressionArgs,
    },
    /// Update product properties from a JSON object.
    Update {
        uuid: Uuid,
        /// JSON object mapping namespaces to field objects; a null
        /// namespace removes it.
        properties: String,
        /// Insert namespace records that do not exist yet.
        #[arg(long)]
        create_namespaces: bool,
    },
}

/// Extension candidates compiled into this binary.
fn extension_set() -> Extensions {
    Extensions::new()
}

async fn open_archive(cli: &Cli) -> Result<Archive> {
    let archive_id = cli
        .archive
        .as_deref()
        .context("no archive specified (use --archive or MUNINN_ARCHIVE)")?;
    Ok(muninn_archive::open(archive_id, extension_set()).await?)
}

fn print_product(product: &Properties) {
    println!(
        "{}  {:<12} {}",
        product
            .core_uuid()
            .map(|uuid| uuid.to_string())
            .unwrap_or_else(|_| "-".repeat(36)),
        product.core_text("product_type").unwrap_or("-"),
        product.core_text("product_name").unwrap_or("-"),
    );
}

async fn run(cli: Cli) -> Result<()> {
    let archive = open_archive(&cli).await?;

    match cli.command {
        Command::Prepare { force } => archive.prepare(force).await?,
        Command::Destroy { catalogue_only } => {
            if catalogue_only {
                archive.destroy_catalogue().await?;
            } else {
                archive.destroy().await?;
            }
        }
        Command::Info => {
            let count = archive.count("", &Parameters::new()).await?;
            println!("products:       {count}");
            println!("product types:  {}", archive.product_types().join(", "));
            println!("namespaces:     {}", archive.namespaces().join(", "));
            println!("export formats: {}", archive.export_formats().join(", "));
        }
        Command::Ingest {
            paths,
            product_type,
            catalogue_only,
            use_symlinks,
            verify_hash,
            use_current_path,
            force,
            tags,
        } => {
            let properties = archive
                .ingest(
                    &paths,
                    IngestOptions {
                        product_type,
                        ingest_product: !catalogue_only,
                        use_symlinks: use_symlinks.then_some(true),
                        verify_hash,
                        use_current_path,
                        force,
                        ..IngestOptions::default()
                    },
                )
                .await?;
            if !tags.is_empty() {
                archive.tag(properties.core_uuid()?, &tags).await?;
            }
            print_product(&properties);
        }
        Command::Attach {
            paths,
            product_type,
            use_symlinks,
            verify_hash,
            verify_hash_before,
            force,
            use_current_path,
        } => {
            let properties = archive
                .attach(
                    &paths,
                    AttachOptions {
                        product_type,
                        use_symlinks: use_symlinks.then_some(true),
                        verify_hash,
                        verify_hash_before,
                        force,
                        use_current_path,
                    },
                )
                .await?;
            print_product(&properties);
        }
        Command::Pull {
            expression,
            verify_hash,
        } => {
            let count = archive
                .pull(&expression.expression, &expression.parameters()?, verify_hash)
                .await?;
            println!("pulled {count} product(s)");
        }
        Command::Strip { expression, force } => {
            let count = archive
                .strip(&expression.expression, &expression.parameters()?, force)
                .await?;
            println!("stripped {count} product(s)");
        }
        Command::Remove { expression, force } => {
            let count = archive
                .remove(&expression.expression, &expression.parameters()?, force)
                .await?;
            println!("removed {count} product(s)");
        }
        Command::Retrieve {
            expression,
            directory,
            use_symlinks,
        } => {
            let paths = archive
                .retrieve(
                    &expression.expression,
                    &expression.parameters()?,
                    &directory,
                    use_symlinks,
                )
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Command::Export {
            expression,
            directory,
            format,
        } => {
            let paths = archive
                .export(
                    &expression.expression,
                    &expression.parameters()?,
                    &directory,
                    format.as_deref(),
                )
                .await?;
            for path in paths {
                println!("{}", path.display());
            }
        }
        Command::Search {
            expression,
            order_by,
            limit,
            count,
        } => {
            if count {
                let count = archive
                    .count(&expression.expression, &expression.parameters()?)
                    .await?;
                println!("{count}");
            } else {
                let query = SearchQuery {
                    where_clause: expression.expression.clone(),
                    parameters: expression.parameters()?,
                    order_by,
                    limit,
                    ..SearchQuery::default()
                };
                for product in archive.search(&query).await? {
                    print_product(&product);
                }
            }
        }
        Command::Summary {
            expression,
            aggregates,
            group_by,
            group_by_tag,
            having,
            order_by,
        } => {
            let result = archive
                .summary(&SummaryQuery {
                    where_clause: expression.expression.clone(),
                    parameters: expression.parameters()?,
                    aggregates,
                    group_by,
                    group_by_tag,
                    having,
                    order_by,
                })
                .await?;
            println!("{}", result.columns.join("\t"));
            for row in result.rows {
                let cells: Vec<String> = row
                    .iter()
                    .map(|value| match value {
                        Some(value) => value.to_string(),
                        None => String::new(),
                    })
                    .collect();
                println!("{}", cells.join("\t"));
            }
        }
        Command::Tag { uuid, tags } => {
            if tags.is_empty() {
                bail!("no tags specified");
            }
            archive.tag(uuid, &tags).await?;
        }
        Command::Untag { uuid, tags } => {
            let tags = if tags.is_empty() { None } else { Some(tags) };
            archive.untag(uuid, tags.as_deref()).await?;
        }
        Command::ListTags { expression } => {
            let query = SearchQuery::new(&expression.expression)
                .with_parameters(expression.parameters()?)
                .with_property_names(&["uuid", "product_name"]);
            for product in archive.search(&query).await? {
                let uuid = product.core_uuid()?;
                let tags = archive.tags(uuid).await?;
                println!(
                    "{} ({uuid}): {}",
                    product.core_text("product_name").unwrap_or("-"),
                    tags.join(", ")
                );
            }
        }
        Command::Update {
            uuid,
            properties,
            create_namespaces,
        } => {
            let value: serde_json::Value =
                serde_json::from_str(&properties).context("invalid properties JSON")?;
            let mut update = json::properties_from_json(&value, archive.schemas())?;
            archive
                .update_properties(&mut update, Some(uuid), create_namespaces)
                .await?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(error) = run(cli).await {
        eprintln!("muninn: {error:#}");
        std::process::exit(1);
    }
}
