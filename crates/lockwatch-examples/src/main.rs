use facet::Facet;
use figue as args;
use std::time::Duration;

mod scenarios;

type AnyResult<T> = Result<T, String>;

#[derive(Facet, Debug)]
struct Cli {
    #[facet(flatten)]
    builtins: args::FigueBuiltins,
    /// Global stall timeout in milliseconds; defaults to LOCKWATCH_TIMEOUT_MS or 2000
    #[facet(args::named, default)]
    timeout_ms: Option<u64>,
    #[facet(args::subcommand)]
    command: CommandKind,
}

#[derive(Facet, Debug)]
#[repr(u8)]
enum CommandKind {
    LockOrderCycle,
    DoubleLock,
    ReadThenWrite,
    AsyncStall,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> AnyResult<()> {
    let cli = parse_cli()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Some(ms) = cli.timeout_ms {
        lockwatch::set_global_lock_timeout(
            Duration::from_millis(ms),
            Some(lockwatch::default_stall_handler()),
        );
    }
    let timeout = lockwatch::global_lock_timeout();
    if timeout.is_zero() {
        return Err("stall detection is disabled (timeout 0); pass --timeout-ms".to_string());
    }

    match cli.command {
        CommandKind::LockOrderCycle => scenarios::lock_order_cycle::run(timeout),
        CommandKind::DoubleLock => scenarios::double_lock::run(),
        CommandKind::ReadThenWrite => scenarios::read_then_write::run(),
        CommandKind::AsyncStall => scenarios::async_stall::run(timeout).await,
    }
}

fn parse_cli() -> AnyResult<Cli> {
    let figue_config = args::builder::<Cli>()
        .map_err(|e| format!("failed to build CLI schema: {e}"))?
        .cli(|cli| cli.strict())
        .help(|h| {
            h.program_name("lockwatch-examples")
                .description("Run lockwatch scenarios as subcommands")
                .version(option_env!("CARGO_PKG_VERSION").unwrap_or("dev"))
        })
        .build();

    args::Driver::new(figue_config)
        .run()
        .into_result()
        .map(|v| v.value)
        .map_err(|e| e.to_string())
}
