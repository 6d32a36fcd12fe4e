use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use pressmigrate_core::delimited::{Delimiter, read_delimited};
use pressmigrate_core::error::{as_configuration, configuration};
use pressmigrate_core::media::StoreMediaImporter;
use pressmigrate_core::outcome_log::OutcomeLog;
use pressmigrate_core::pipeline::{
    Persister, RunOptions, RunSummary, Transform, WriterPersister, run_batch,
};
use pressmigrate_core::record::{Filter, RecordId, RecordKind};
use pressmigrate_core::remote::HttpFetcher;
use pressmigrate_core::runtime::{
    InitOptions, PathOverrides, ResolutionContext, Runtime, init_layout, normalize_for_display,
    resolve_runtime,
};
use pressmigrate_core::store::{MemorySource, RecordSource, SqliteStore};
use pressmigrate_core::transforms::avatars::AvatarMetaMove;
use pressmigrate_core::transforms::featured_images::FeaturedImageFromBody;
use pressmigrate_core::transforms::fix_images::ImagePrefixRewrite;
use pressmigrate_core::transforms::galleries::{GalleryPersister, LegacyGalleries};
use pressmigrate_core::transforms::headings::MarkdownHeadings;
use pressmigrate_core::transforms::post_type_category::{
    CategoryResolution, PostTypeToCategory, resolve_category,
};
use pressmigrate_core::transforms::reparent_terms::{
    CHILD_COLUMN, PARENT_COLUMN, ReparentPlan, ReparentTerms,
};
use pressmigrate_core::transforms::subscriptions::{
    BILLING_COLUMNS, SubscriptionCsvPersister, SubscriptionRows,
};
use pressmigrate_core::url_map::read_list_map;
use tracing::debug;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

#[derive(Debug, Parser)]
#[command(
    name = "pressmigrate",
    version,
    about = "One-off migrations that move legacy publisher content into the common content schema"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH", help = "Content database to migrate")]
    db: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    db: Option<PathBuf>,
    config: Option<PathBuf>,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            project_root: cli.project_root.clone(),
            db: cli.db.clone(),
            config: cli.config.clone(),
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the .pressmigrate state directory and a default config
    Init(InitArgs),
    Db(DbArgs),
    /// Convert stray markdown headings in post bodies into heading elements
    Headings(HeadingsArgs),
    /// Rewrite <img src> URLs from a legacy prefix to a new one
    FixImages(FixImagesArgs),
    /// Set a featured image from the single image in each post body
    FeaturedImages(FeaturedImagesArgs),
    /// Turn a custom post type into regular posts filed under a category
    PostTypeToCategory(PostTypeToCategoryArgs),
    /// Move avatar attachment ids between user meta keys
    Avatars(AvatarsArgs),
    /// Re-parent taxonomy terms from a child,parent slug file
    ReparentTerms(ReparentTermsArgs),
    /// Import legacy galleries listed in a JSON map keyed by original URL
    ImportGalleries(ImportGalleriesArgs),
    /// Convert a billing export into a subscription import file
    ImportSubscriptions(ImportSubscriptionsArgs),
}

#[derive(Debug, Clone, Args)]
struct RunArgs {
    #[arg(long, help = "Transform and classify records without writing anything")]
    dry_run: bool,
    #[arg(
        long,
        value_name = "IDS",
        value_delimiter = ',',
        help = "Only process these record ids (comma separated)"
    )]
    ids: Vec<RecordId>,
    #[arg(long, help = "Print a unified diff of every changed body")]
    show_diff: bool,
}

impl RunArgs {
    fn options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            show_diff: self.show_diff,
        }
    }
}

#[derive(Debug, Args)]
struct InitArgs {
    #[arg(long, help = "Overwrite an existing config file")]
    force: bool,
}

#[derive(Debug, Args)]
struct DbArgs {
    #[command(subcommand)]
    command: DbSubcommand,
}

#[derive(Debug, Subcommand)]
enum DbSubcommand {
    /// Apply pending schema migrations
    Migrate,
    /// Print record counts
    Stats,
}

#[derive(Debug, Args)]
struct HeadingsArgs {
    #[arg(long, default_value = "post", value_name = "TYPE")]
    post_type: String,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct FixImagesArgs {
    #[arg(long, value_name = "PREFIX", help = "Legacy URL prefix to replace")]
    from: String,
    #[arg(long, value_name = "PREFIX", help = "Replacement URL prefix")]
    to: String,
    #[arg(long, help = "Fetch every rewritten URL and skip records with broken targets")]
    verify: bool,
    #[arg(long, default_value = "post", value_name = "TYPE")]
    post_type: String,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct FeaturedImagesArgs {
    #[arg(long, default_value = "post", value_name = "TYPE")]
    post_type: String,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct PostTypeToCategoryArgs {
    #[arg(long, value_name = "TYPE")]
    from_type: String,
    #[arg(long, value_name = "NAME", help = "Category name (defaults to the [categories] config entry)")]
    category: Option<String>,
    #[arg(long, help = "Create the category if it does not exist")]
    create_category: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct AvatarsArgs {
    #[arg(long, value_name = "KEY")]
    from_key: String,
    #[arg(long, value_name = "KEY")]
    to_key: String,
    #[arg(long, help = "Leave the source meta key in place")]
    keep_source: bool,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct ReparentTermsArgs {
    #[arg(value_name = "FILE", help = "Delimited file with child,parent slug columns")]
    file: PathBuf,
    #[arg(long, default_value = "category")]
    taxonomy: String,
    #[arg(long, value_name = "comma|tab")]
    delimiter: Option<String>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct ImportGalleriesArgs {
    #[arg(value_name = "FILE", help = "JSON object mapping original post URL to image URLs")]
    file: PathBuf,
    #[arg(long, value_name = "PATH", help = "Where downloaded images go (default: .pressmigrate/uploads)")]
    uploads_dir: Option<PathBuf>,
    #[command(flatten)]
    run: RunArgs,
}

#[derive(Debug, Args)]
struct ImportSubscriptionsArgs {
    #[arg(value_name = "FILE", help = "Billing export with email,plan,status,start,end,amount,id")]
    file: PathBuf,
    #[arg(long, value_name = "PATH", help = "Generated subscription import file")]
    output: PathBuf,
    #[arg(long, value_name = "comma|tab")]
    delimiter: Option<String>,
    #[command(flatten)]
    run: RunArgs,
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            if as_configuration(&error).is_some() {
                ExitCode::from(2)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let options = RuntimeOptions::from_cli(&cli);
    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };

    let runtime = resolve(&options)?;
    init_tracing(runtime.config.log_filter())?;
    debug!(
        project_root = %normalize_for_display(&runtime.paths.project_root),
        db = %normalize_for_display(&runtime.paths.db_path),
        db_source = runtime.paths.db_source.as_str(),
        "runtime resolved"
    );

    match command {
        Commands::Init(args) => run_init(&runtime, args)?,
        Commands::Db(DbArgs { command }) => match command {
            DbSubcommand::Migrate => run_db_migrate(&runtime)?,
            DbSubcommand::Stats => run_db_stats(&runtime)?,
        },
        Commands::Headings(args) => run_headings(&runtime, args)?,
        Commands::FixImages(args) => run_fix_images(&runtime, args)?,
        Commands::FeaturedImages(args) => run_featured_images(&runtime, args)?,
        Commands::PostTypeToCategory(args) => run_post_type_to_category(&runtime, args)?,
        Commands::Avatars(args) => run_avatars(&runtime, args)?,
        Commands::ReparentTerms(args) => run_reparent_terms(&runtime, args)?,
        Commands::ImportGalleries(args) => run_import_galleries(&runtime, args)?,
        Commands::ImportSubscriptions(args) => run_import_subscriptions(&runtime, args)?,
    }

    if options.diagnostics {
        println!("\n[diagnostics]\n{}", runtime.paths.diagnostics());
    }
    Ok(())
}

fn run_init(runtime: &Runtime, args: InitArgs) -> Result<()> {
    let paths = &runtime.paths;
    let report = init_layout(paths, &InitOptions { force: args.force })?;
    println!("Initialized pressmigrate layout");
    println!("project_root: {}", normalize_for_display(&paths.project_root));
    println!("state_dir: {}", normalize_for_display(&paths.state_dir));
    println!("log_dir: {}", normalize_for_display(&paths.log_dir));
    println!("config_path: {}", normalize_for_display(&paths.config_path));
    println!("db_path: {}", normalize_for_display(&paths.db_path));
    println!("created_dirs: {}", report.created_dirs.len());
    println!("wrote_config: {}", report.wrote_config);
    println!("next: pressmigrate db migrate");
    Ok(())
}

fn run_db_migrate(runtime: &Runtime) -> Result<()> {
    let store = SqliteStore::open(&runtime.paths.db_path)?;
    let report = store.migrate()?;
    println!("db migrate");
    println!("db_path: {}", normalize_for_display(store.path()));
    if report.applied.is_empty() {
        println!("applied: none (already current)");
    }
    for migration in &report.applied {
        println!("applied: v{:03}_{}", migration.version, migration.name);
    }
    println!("schema_version: {}", report.current_version);
    Ok(())
}

fn run_db_stats(runtime: &Runtime) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let stats = store.stats()?;
    println!("db stats");
    println!("db_path: {}", normalize_for_display(store.path()));
    println!("schema_version: {}", stats.schema_version);
    println!("posts: {}", stats.posts);
    for (post_type, count) in &stats.posts_by_type {
        println!("posts.{post_type}: {count}");
    }
    println!("post_meta: {}", stats.post_meta_rows);
    println!("users: {}", stats.users);
    println!("terms: {}", stats.terms);
    Ok(())
}

fn run_headings(runtime: &Runtime, args: HeadingsArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let mut transform = MarkdownHeadings::new()?;
    execute(
        runtime,
        "headings",
        &store,
        MarkdownHeadings::filter(&args.post_type),
        &mut transform,
        &mut WriterPersister(&store),
        &args.run,
    )?;
    Ok(())
}

fn run_fix_images(runtime: &Runtime, args: FixImagesArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let verifier = if args.verify {
        Some(HttpFetcher::new(&runtime.config.remote_settings())?)
    } else {
        None
    };
    let mut transform = ImagePrefixRewrite::new(&args.from, &args.to, verifier)?;
    let filter = transform.filter(&args.post_type);
    execute(
        runtime,
        "fix-images",
        &store,
        filter,
        &mut transform,
        &mut WriterPersister(&store),
        &args.run,
    )?;
    Ok(())
}

fn run_featured_images(runtime: &Runtime, args: FeaturedImagesArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let mut transform = FeaturedImageFromBody::new(&store)?;
    execute(
        runtime,
        "featured-images",
        &store,
        FeaturedImageFromBody::<&SqliteStore>::filter(&args.post_type),
        &mut transform,
        &mut WriterPersister(&store),
        &args.run,
    )?;
    Ok(())
}

fn run_post_type_to_category(runtime: &Runtime, args: PostTypeToCategoryArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let category = match args.category.as_deref().map(str::trim) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => runtime
            .config
            .category_for_type(args.from_type.trim())
            .map(str::to_string)
            .ok_or_else(|| {
                configuration(format!(
                    "no --category given and no [categories] entry for {:?}",
                    args.from_type
                ))
            })?,
    };
    match resolve_category(&store, &category, args.create_category, args.run.dry_run)? {
        CategoryResolution::Existing(id) => println!("category: {category} (id {id})"),
        CategoryResolution::Created(id) => println!("category: {category} (created, id {id})"),
        CategoryResolution::Pending => println!("category: {category} (would be created)"),
    }

    let mut transform = PostTypeToCategory::new(&args.from_type, &category)?;
    let filter = transform.filter();
    execute(
        runtime,
        "post-type-to-category",
        &store,
        filter,
        &mut transform,
        &mut WriterPersister(&store),
        &args.run,
    )?;
    Ok(())
}

fn run_avatars(runtime: &Runtime, args: AvatarsArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let mut transform = AvatarMetaMove::new(&store, &args.from_key, &args.to_key, args.keep_source)?;
    let filter = transform.filter();
    execute(
        runtime,
        "avatars",
        &store,
        filter,
        &mut transform,
        &mut WriterPersister(&store),
        &args.run,
    )?;
    Ok(())
}

fn run_reparent_terms(runtime: &Runtime, args: ReparentTermsArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let delimiter = Delimiter::resolve(&args.file, args.delimiter.as_deref())?;
    let rows = read_delimited(&args.file, delimiter, &[CHILD_COLUMN, PARENT_COLUMN])?;
    let plan = ReparentPlan::build(&rows, &args.taxonomy, &store)?;
    for child in plan.unknown_children() {
        println!("not found: {} term {child:?} listed in {}", args.taxonomy, args.file.display());
    }
    let filter = plan.filter();
    let mut transform = ReparentTerms::new(plan);
    let mut persister = WriterPersister(&store);
    match filter {
        Some(filter) => execute(
            runtime,
            "reparent-terms",
            &store,
            filter,
            &mut transform,
            &mut persister,
            &args.run,
        )?,
        None => execute(
            runtime,
            "reparent-terms",
            &MemorySource::default(),
            Filter::terms(),
            &mut transform,
            &mut persister,
            &args.run,
        )?,
    };
    Ok(())
}

fn run_import_galleries(runtime: &Runtime, args: ImportGalleriesArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let galleries = read_list_map(&args.file)?;
    println!("galleries listed: {}", galleries.len());
    let uploads_dir = args
        .uploads_dir
        .clone()
        .unwrap_or_else(|| runtime.paths.state_dir.join("uploads"));
    let fetcher = HttpFetcher::new(&runtime.config.remote_settings())?;
    let mut persister = GalleryPersister::new(
        StoreMediaImporter::new(&store, fetcher, &uploads_dir),
        &store,
    );
    execute(
        runtime,
        "import-galleries",
        &store,
        LegacyGalleries::filter(),
        &mut LegacyGalleries::new(galleries),
        &mut persister,
        &args.run,
    )?;
    Ok(())
}

fn run_import_subscriptions(runtime: &Runtime, args: ImportSubscriptionsArgs) -> Result<()> {
    let store = SqliteStore::open_ready(&runtime.paths.db_path)?;
    let delimiter = Delimiter::resolve(&args.file, args.delimiter.as_deref())?;
    let rows = read_delimited(&args.file, delimiter, BILLING_COLUMNS)?;
    let source = MemorySource::new(rows);
    let mut transform = SubscriptionRows::new(&store)?;
    let mut persister = SubscriptionCsvPersister::new(&args.output, Delimiter::Comma);
    execute(
        runtime,
        "import-subscriptions",
        &source,
        Filter::new(RecordKind::Row),
        &mut transform,
        &mut persister,
        &args.run,
    )?;
    if !args.run.dry_run {
        println!(
            "output: {} ({} row(s))",
            normalize_for_display(&args.output),
            persister.rows_written()
        );
    }
    Ok(())
}

fn execute<S, T, P>(
    runtime: &Runtime,
    command: &str,
    source: &S,
    filter: Filter,
    transform: &mut T,
    persister: &mut P,
    run: &RunArgs,
) -> Result<RunSummary>
where
    S: RecordSource + ?Sized,
    T: Transform + ?Sized,
    P: Persister + ?Sized,
{
    let filter = filter.restrict_ids(&run.ids);
    let mut log = OutcomeLog::open(&runtime.paths.log_dir, command)?;
    let options = run.options();
    let summary = run_batch(source, &filter, transform, persister, &mut log, options)?;

    println!("{command} ({}): {}", options.mode().as_str(), summary.render());
    if let Some(path) = log.path() {
        println!("log: {}", display_relative(path, &runtime.paths.project_root));
    }
    Ok(summary)
}

fn resolve(options: &RuntimeOptions) -> Result<Runtime> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: options.project_root.clone(),
        db: options.db.clone(),
        config: options.config.clone(),
    };

    let initial = resolve_runtime(&context, &overrides)?;
    let project_env = initial.paths.project_root.join(".env");
    if !project_env.exists() {
        return Ok(initial);
    }
    let _ = dotenvy::from_path_override(&project_env);
    resolve_runtime(&context, &overrides)
}

/// Stderr only, so stdout stays the progress stream.
fn init_tracing(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing: {error}"))
}

fn display_relative(path: &Path, root: &Path) -> String {
    match path.strip_prefix(root) {
        Ok(relative) => normalize_for_display(relative),
        Err(_) => normalize_for_display(path),
    }
}
