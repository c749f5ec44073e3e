use clap::{Parser, Subcommand};
use colored::*;

use scanvault_core::{
    ArtifactKind, Config, EnumerationOptions, Orchestrator, Run, RunId, RunIndex, RunStatus,
    ArtifactStore, SubmitOptions,
};

#[derive(Parser, Debug)]
#[command(
    name = "scanvault",
    version,
    about = "Captures, stores, and indexes runs of an external SQL injection tool",
    after_help = "\x1b[1;36mEXAMPLES:\x1b[0m
  Enumerate databases:      scanvault scan http://target/item?id=1 --dbs
  Tables of one database:   scanvault scan http://target/item?id=1 --tables -D dvwa
  Dump a table:             scanvault scan http://target/item?id=1 --dump -D dvwa -T users
  Raw passthrough args:     scanvault scan http://target/item?id=1 --extra --cookie --extra 'PHPSESSID=abc'
  Show the command only:    scanvault scan http://target/item?id=1 --dbs --dry-run
  Browse past runs:         scanvault list
  Inspect one run:          scanvault show run_20260823T101500Z_x7k2pq
  Derived summary:          scanvault summary run_20260823T101500Z_x7k2pq"
)]
struct Cli {
    /// Storage root holding one directory per run
    #[arg(long, global = true, default_value = "runs")]
    store: std::path::PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the external tool against a target and capture its output
    Scan(ScanArgs),
    /// List recorded runs
    List(ListArgs),
    /// Show one run's record and captured output
    Show(ShowArgs),
    /// Recompute the derived summary for one run
    Summary(SummaryArgs),
}

#[derive(clap::Args, Debug)]
struct ScanArgs {
    /// Target URL handed to the tool
    target: String,

    /// External tool binary (name or path)
    #[arg(long, default_value = "sqlmap")]
    tool: String,

    /// Timeout in seconds for the whole run
    #[arg(long, default_value_t = 1800)]
    timeout: u64,

    /// Treat any normal exit as success, not just exit code 0
    #[arg(long, default_value_t = false)]
    allow_failure: bool,

    /// Enumerate databases
    #[arg(long, default_value_t = false)]
    dbs: bool,

    /// Enumerate tables
    #[arg(long, default_value_t = false)]
    tables: bool,

    /// Enumerate columns
    #[arg(long, default_value_t = false)]
    columns: bool,

    /// Dump table entries
    #[arg(long, default_value_t = false)]
    dump: bool,

    /// Dump everything
    #[arg(long, default_value_t = false)]
    dump_all: bool,

    /// Enumerate DBMS users
    #[arg(long, default_value_t = false)]
    users: bool,

    /// Enumerate password hashes
    #[arg(long, default_value_t = false)]
    passwords: bool,

    /// Enumerate privileges/roles
    #[arg(long, default_value_t = false)]
    roles: bool,

    /// Database to enumerate (-D)
    #[arg(short = 'D', long = "db")]
    selected_db: Option<String>,

    /// Table to enumerate (-T)
    #[arg(short = 'T', long = "table")]
    selected_table: Option<String>,

    /// Risk of tests to perform
    #[arg(long)]
    risk: Option<u8>,

    /// Level of tests to perform
    #[arg(long)]
    level: Option<u8>,

    /// Tool-side thread count
    #[arg(long)]
    threads: Option<u32>,

    /// Raw argument passed through to the tool (repeatable)
    #[arg(long = "extra")]
    extra: Vec<String>,

    /// Print the composed command without running it
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(clap::Args, Debug)]
struct ListArgs {
    /// Only runs against this target
    #[arg(long)]
    target: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ShowArgs {
    run_id: String,

    /// Maximum artifact lines to print
    #[arg(long, default_value_t = 200)]
    lines: usize,
}

#[derive(clap::Args, Debug)]
struct SummaryArgs {
    run_id: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Scan(args) => run_scan(cli.store, args).await,
        Command::List(args) => run_list(cli.store, args),
        Command::Show(args) => run_show(cli.store, args),
        Command::Summary(args) => run_summary(cli.store, args),
    }
}

fn parse_run_id(raw: &str) -> anyhow::Result<RunId> {
    RunId::parse(raw).ok_or_else(|| anyhow::anyhow!("'{}' is not a valid run id", raw))
}

fn open_index(store: &std::path::Path) -> anyhow::Result<RunIndex> {
    Ok(RunIndex::new(ArtifactStore::open(store)?))
}

async fn run_scan(store: std::path::PathBuf, args: ScanArgs) -> anyhow::Result<()> {
    let opts = EnumerationOptions {
        dbs: args.dbs,
        tables: args.tables,
        columns: args.columns,
        dump: args.dump,
        dump_all: args.dump_all,
        users: args.users,
        passwords: args.passwords,
        roles: args.roles,
        selected_db: args.selected_db.clone(),
        selected_table: args.selected_table.clone(),
        risk: args.risk,
        level: args.level,
        threads: args.threads,
        extra: args.extra.clone(),
    };
    let tool_args = opts.to_args();

    let config = Config {
        storage_root: store,
        tool: args.tool.clone(),
        default_timeout_secs: args.timeout,
        ..Default::default()
    };

    // The preview composes through the same config as the real run, so the
    // printed command is the one that would execute.
    if args.dry_run {
        println!(
            "[DRY RUN] Would run: {} {}",
            config.tool,
            config.compose_argv(&args.target, &tool_args).join(" ")
        );
        return Ok(());
    }

    let orch = Orchestrator::new(config)?;

    let submit = SubmitOptions {
        timeout_secs: Some(args.timeout),
        fail_on_nonzero_exit: !args.allow_failure,
    };
    let id = orch.submit(&args.target, &tool_args, submit)?;

    print!("{}\r\n", format!("[+] Target:  {}", args.target).green().bold());
    print!("{}\r\n", format!("[+] Run id:  {}", id).blue());
    print!("{}\r\n", format!("[+] Timeout: {}s", args.timeout).blue());
    print!("{}\r\n", "──────────────────────────────────────────────────".dimmed());

    let run = tokio::select! {
        run = orch.wait(&id) => run?,
        _ = tokio::signal::ctrl_c() => {
            print!("{}\r\n", "[!] Interrupt received, cancelling run...".yellow());
            orch.cancel(&id)?;
            orch.wait(&id).await?
        }
    };

    print!(
        "{}\r\n",
        format!("[+] Run {} finished: {}", run.id, status_label(run.status)).bold()
    );
    if let Some(code) = run.exit_code {
        print!("{}\r\n", format!("    Exit code: {}", code).dimmed());
    }

    let stdout = orch.store().read(&id, ArtifactKind::Stdout).unwrap_or_default();
    if !stdout.is_empty() {
        print!("{}\r\n", "\n----- captured stdout (preview) -----".bright_cyan());
        println!("{}", scanvault_core::utils::read_preview(&stdout, 200));
    }

    let summary = orch.index().summarize(&id)?;
    print_summary_fields(&summary);
    Ok(())
}

fn run_list(store: std::path::PathBuf, args: ListArgs) -> anyhow::Result<()> {
    let index = open_index(&store)?;
    let runs = match args.target {
        Some(target) => index.find_by_target(&target)?,
        None => index.all()?,
    };
    if runs.is_empty() {
        println!("No runs recorded.");
        return Ok(());
    }
    for run in runs {
        print_run_row(&run);
    }
    Ok(())
}

fn run_show(store: std::path::PathBuf, args: ShowArgs) -> anyhow::Result<()> {
    let id = parse_run_id(&args.run_id)?;
    let index = open_index(&store)?;
    let run = index.find_by_id(&id)?;

    println!("{}", format!("Run {}", run.id).bold());
    println!("  Target:   {}", run.target);
    println!("  Tool:     {}", run.tool);
    println!("  Command:  {} {}", run.tool, run.argv.join(" "));
    println!("  Status:   {}", status_label(run.status));
    println!("  Started:  {}", run.started_at.format("%Y-%m-%d %H:%M:%S UTC"));
    if let Some(ended) = run.ended_at {
        println!("  Ended:    {}", ended.format("%Y-%m-%d %H:%M:%S UTC"));
    }
    if let Some(code) = run.exit_code {
        println!("  Exit:     {}", code);
    }

    let store = ArtifactStore::open(&store)?;
    for kind in [ArtifactKind::Stdout, ArtifactKind::Stderr] {
        match store.read(&id, kind) {
            Ok(bytes) if !bytes.is_empty() => {
                println!("{}", format!("\n----- {} (preview) -----", kind).bright_cyan());
                println!("{}", scanvault_core::utils::read_preview(&bytes, args.lines));
            }
            _ => println!("{}", format!("\n(no {} captured)", kind).dimmed()),
        }
    }
    Ok(())
}

fn run_summary(store: std::path::PathBuf, args: SummaryArgs) -> anyhow::Result<()> {
    let id = parse_run_id(&args.run_id)?;
    let index = open_index(&store)?;
    let summary = index.summarize(&id)?;
    print_summary_fields(&summary);
    Ok(())
}

fn print_run_row(run: &Run) {
    println!(
        "{}  {:<10}  {}  {}",
        run.id.to_string().cyan(),
        status_label(run.status),
        run.started_at.format("%Y-%m-%d %H:%M:%S"),
        run.target
    );
}

fn status_label(status: RunStatus) -> ColoredString {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => text.green(),
        RunStatus::Failed => text.red(),
        RunStatus::TimedOut => text.yellow(),
        RunStatus::Cancelled => text.yellow(),
        RunStatus::Running => text.bright_cyan(),
        RunStatus::Pending => text.dimmed(),
    }
}

fn print_summary_fields(summary: &scanvault_core::Summary) {
    println!("{}", "\n----- derived summary -----".bright_cyan());
    if summary.is_empty() {
        println!("(no recognized fields in tool output)");
        return;
    }
    for (field, values) in &summary.fields {
        if values.is_empty() {
            println!("  {:<10} {}", field, "-".dimmed());
        } else {
            println!("  {:<10} {}", field, values.join(", ").bright_yellow());
        }
    }
}
