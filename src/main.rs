use std::io::{self, Write};

use clap::Parser;
use deltanorm::adapter::ProviderAdapter;
use deltanorm::config::{load_config, AppConfig};
use deltanorm::observability::init_tracing;
use deltanorm::protocol::canonical::{ChatMessage, ChatRequest};
use deltanorm::stream::UsageAccumulator;
use deltanorm::transport::HttpTransport;
use futures_util::StreamExt;

/// Stream one prompt through a configured upstream and print canonical events
/// as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "deltanorm", version)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "config.yaml")]
    config: String,

    /// Upstream service name; defaults to the service marked `is_default`.
    #[arg(long)]
    upstream: Option<String>,

    /// Prompt text. Words are joined with single spaces.
    #[arg(required = true, trailing_var_arg = true)]
    prompt: Vec<String>,
}

impl Cli {
    fn prompt_text(&self) -> String {
        self.prompt.join(" ")
    }
}

fn main() {
    // clap exits with 2 on usage errors and 0 on --help/--version.
    let cli = Cli::parse();

    let config = load_config(&cli.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {e}");
        eprintln!("Please copy 'config.example.yaml' to 'config.yaml' and modify as needed.");
        std::process::exit(1);
    });

    init_tracing(&config.features.log_level);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .enable_time()
        .build()
        .unwrap_or_else(|e| {
            eprintln!("Failed to initialize Tokio runtime: {e}");
            std::process::exit(1);
        });

    let code = runtime.block_on(run(&config, &cli));
    std::process::exit(code);
}

async fn run(config: &AppConfig, args: &Cli) -> i32 {
    let Some(service) = config.service(args.upstream.as_deref()) else {
        eprintln!(
            "Unknown upstream service '{}'",
            args.upstream.as_deref().unwrap_or_default()
        );
        return 1;
    };

    let adapter = match ProviderAdapter::from_config(service) {
        Ok(adapter) => adapter,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };
    let transport = HttpTransport::with_proxies(
        &config.transport,
        config
            .upstream_services
            .iter()
            .filter_map(|svc| svc.proxy.as_deref()),
    );

    tracing::info!(
        upstream = adapter.name(),
        provider = %adapter.kind(),
        model = %adapter.model_info().id,
        "deltanorm streaming prompt"
    );

    let request = ChatRequest {
        messages: vec![ChatMessage::user(args.prompt_text())],
        ..ChatRequest::default()
    };
    let usage = UsageAccumulator::with_system_clock(adapter.model_info().clone());

    let mut events = match adapter.stream_chat(&transport, &request, usage).await {
        Ok(events) => events,
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let stdout = io::stdout();
    let mut out = stdout.lock();
    while let Some(item) = events.next().await {
        match item {
            Ok(event) => {
                let line = match serde_json::to_string(&event) {
                    Ok(line) => line,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to serialize event");
                        continue;
                    }
                };
                if writeln!(out, "{line}").and_then(|()| out.flush()).is_err() {
                    // stdout closed, e.g. piped into `head`
                    return 0;
                }
            }
            Err(err) => {
                eprintln!("{err}");
                return 1;
            }
        }
    }
    0
}
