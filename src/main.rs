use anyhow::anyhow;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tm::clipboard::copy_to_clipboard;
use tm::entry::{DEFAULT_PERIOD, TokenCollection, TokenRecord, filter_labels};
use tm::otp;
use tm::prompt::{confirm, prompt_string};
use tm::registry::TokenRegistry;
use tm::scheduler::{self, CountdownScheduler, CountdownState};
use tm::storage::{FileBackend, StorageBackend, default_store_path};
use tm::store::SecretStore;
use tokio::sync::broadcast;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Parser, Debug)]
#[command(name = "tm", version, about = "Minimal TOTP token manager in Rust")]
struct Cli {
    /// Path to the storage file (defaults to $TM_STORE or the user data dir)
    #[arg(long, global = true)]
    store: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Add a token, or replace one with the same label
    ///
    /// Примеры:
    ///   tm add github JBSWY3DPEHPK3PXP
    ///   tm add github "otpauth://totp/GitHub:me?secret=JBSWY3DPEHPK3PXP&period=30"
    Add {
        /// Label, e.g. a service name
        label: String,
        /// Base32 secret or otpauth:// URI (prompted for when omitted)
        secret: Option<String>,
        /// Window length in seconds
        #[arg(long, default_value_t = DEFAULT_PERIOD)]
        period: u32,
        /// Service URL to keep alongside the secret
        #[arg(long, default_value = "")]
        url: String,
    },

    /// Remove a token
    Remove {
        label: String,
        /// Do not ask for confirmation
        #[arg(long)]
        yes: bool,
    },

    /// List token labels
    ///
    /// Примеры:
    ///   tm ls
    ///   tm ls --filter git
    Ls {
        /// Case-insensitive substring filter on the label
        #[arg(long)]
        filter: Option<String>,
    },

    /// Show the current code for one token
    Show {
        label: String,
        /// Print only the code
        #[arg(long)]
        code_only: bool,
    },

    /// Copy the current code to clipboard
    Clip { label: String },

    /// Live view of all tokens with a refresh countdown
    ///
    /// Примеры:
    ///   tm watch
    ///   tm watch --filter github
    Watch {
        /// Case-insensitive substring filter on the label
        #[arg(long)]
        filter: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();
    let registry = open_registry(cli.store)?;

    match cli.command {
        Commands::Add {
            label,
            secret,
            period,
            url,
        } => cmd_add(&registry, &label, secret, period, url).await?,
        Commands::Remove { label, yes } => cmd_remove(&registry, &label, yes).await?,
        Commands::Ls { filter } => cmd_ls(&registry, filter.as_deref()).await?,
        Commands::Show { label, code_only } => cmd_show(&registry, &label, code_only).await?,
        Commands::Clip { label } => cmd_clip(&registry, &label).await?,
        Commands::Watch { filter } => cmd_watch(registry, filter).await?,
    }

    Ok(())
}

/// Логи уходят в stderr, чтобы не мешать выводу кодов в пайпах.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .init();
}

fn open_registry(store: Option<PathBuf>) -> anyhow::Result<Arc<TokenRegistry>> {
    let path = match store {
        Some(path) => path,
        None => default_store_path()?,
    };
    debug!(path = %path.display(), "opening token store");
    let backend: Arc<dyn StorageBackend> = Arc::new(FileBackend::new(path));
    Ok(Arc::new(TokenRegistry::new(SecretStore::new(backend))))
}

async fn cmd_add(
    registry: &TokenRegistry,
    label: &str,
    secret: Option<String>,
    period: u32,
    url: String,
) -> anyhow::Result<()> {
    let raw = match secret {
        Some(s) => s,
        None => prompt_string("Secret (base32) or otpauth:// URI: ")?,
    };

    // Период из otpauth-URI важнее флага: его назначил сервер.
    let (secret, uri_period) = otp::parse_secret_input(&raw)?;
    let record = TokenRecord {
        secret,
        period: uri_period.unwrap_or(period),
        url,
    };

    registry.add(label, record).await?;
    println!("Saved token {}", label.trim());
    Ok(())
}

async fn cmd_remove(registry: &TokenRegistry, label: &str, yes: bool) -> anyhow::Result<()> {
    registry.refresh().await?;
    if registry.get(label).is_none() {
        println!("No token named '{label}'");
        return Ok(());
    }

    if !yes && !confirm(&format!("Remove '{label}'? [y/N]: "))? {
        println!("Aborted.");
        return Ok(());
    }

    registry.remove(label).await?;
    println!("Removed token {label}");
    Ok(())
}

async fn cmd_ls(registry: &TokenRegistry, filter: Option<&str>) -> anyhow::Result<()> {
    let tokens = registry.refresh().await?;
    for (label, _) in filter_labels(&tokens, filter.unwrap_or("")) {
        println!("{label}");
    }
    Ok(())
}

async fn cmd_show(registry: &TokenRegistry, label: &str, code_only: bool) -> anyhow::Result<()> {
    let record = find_token(registry, label).await?;
    let code = otp::generate(&record.secret, record.period)?;

    if code_only {
        println!("{code}");
        return Ok(());
    }

    println!("Label:   {label}");
    println!("Code:    {code}");
    println!("Period:  {}s", record.period);
    println!(
        "Expires: in {}s",
        scheduler::seconds_remaining(record.period)
    );
    if !record.url.is_empty() {
        println!("URL:     {}", record.url);
    }
    Ok(())
}

async fn cmd_clip(registry: &TokenRegistry, label: &str) -> anyhow::Result<()> {
    let record = find_token(registry, label).await?;
    let code = otp::generate(&record.secret, record.period)?;
    copy_to_clipboard(&code)?;
    println!("Code copied to clipboard.");
    Ok(())
}

async fn cmd_watch(registry: Arc<TokenRegistry>, filter: Option<String>) -> anyhow::Result<()> {
    // Сначала подписка, затем первое чтение: изменение в зазоре между
    // ними даст лишнее перечитывание, но не потеряется.
    let sync = Arc::clone(&registry).spawn_sync();
    let mut updates = registry.subscribe();
    registry.refresh().await?;

    let (tick_tx, mut tick_rx) = tokio::sync::mpsc::unbounded_channel();
    let mut timer = CountdownScheduler::new();
    timer.start(DEFAULT_PERIOD, move |tick| {
        let _ = tick_tx.send(tick);
    });

    let mut view = WatchView::new(filter);
    view.reload(registry.snapshot());

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            maybe_tick = tick_rx.recv() => {
                let Some(tick) = maybe_tick else { break };
                if tick.regenerates() {
                    view.regenerate();
                }
                view.render(tick.state);
            }
            update = updates.recv() => {
                match update {
                    Ok(tokens) => view.reload(tokens),
                    Err(broadcast::error::RecvError::Lagged(_)) => view.reload(registry.snapshot()),
                    Err(broadcast::error::RecvError::Closed) => break,
                }
                view.regenerate();
                view.render(CountdownState::capture(DEFAULT_PERIOD));
            }
            _ = &mut ctrl_c => break,
        }
    }

    timer.stop();
    sync.abort();
    println!();
    Ok(())
}

async fn find_token(registry: &TokenRegistry, label: &str) -> anyhow::Result<TokenRecord> {
    registry.refresh().await?;
    registry
        .get(label)
        .ok_or_else(|| anyhow!("no token named '{label}'"))
}

/// Состояние живого вида: снимок коллекции, фильтр и кэш показанных
/// кодов. Коды пересчитываются на bootstrap/rollover тиках и после
/// смены снимка.
struct WatchView {
    filter: Option<String>,
    tokens: TokenCollection,
    codes: HashMap<String, Option<String>>,
}

impl WatchView {
    fn new(filter: Option<String>) -> Self {
        Self {
            filter,
            tokens: TokenCollection::new(),
            codes: HashMap::new(),
        }
    }

    fn reload(&mut self, tokens: TokenCollection) {
        self.tokens = tokens;
    }

    fn regenerate(&mut self) {
        self.codes = self
            .tokens
            .iter()
            .map(|(label, record)| (label.clone(), otp::display_code(record)))
            .collect();
    }

    fn render(&self, state: CountdownState) {
        // ANSI: очистить экран, курсор в левый верхний угол
        print!("\x1b[2J\x1b[1;1H");
        println!("TOTP Tokens");
        println!("Refresh in: {}s", state.seconds_remaining);
        println!();

        let entries = filter_labels(&self.tokens, self.filter.as_deref().unwrap_or(""));
        if entries.is_empty() {
            println!("No tokens yet.");
        } else {
            for (label, _) in entries {
                let code = self
                    .codes
                    .get(label.as_str())
                    .and_then(|code| code.clone())
                    .unwrap_or_else(|| "—".to_string());
                println!("{label:<24} {code}");
            }
        }
        let _ = std::io::stdout().flush();
    }
}
