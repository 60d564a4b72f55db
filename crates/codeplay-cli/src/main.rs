use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codeplay_core::{
    config::ConfigLoader, ExecutionDispatcher, ExecutionRequest, ExecutionResult, Language,
};
use log::LevelFilter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;

#[derive(Parser, Debug)]
#[clap(name = "codeplay", author, version = "0.1.0", about = "Run code snippets in isolated engines")]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    #[clap(long, short, default_value = "codeplay.yaml", help = "Path to the YAML configuration file")]
    config: PathBuf,

    #[clap(long, short, help = "Log level (overrides the configuration file)")]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a file, or stdin when no file is given
    Run {
        file: Option<PathBuf>,

        #[clap(long, short = 'L', help = "Language tag; inferred from the file extension when omitted")]
        language: Option<String>,

        #[clap(long, help = "Record the execution in this session")]
        session: Option<String>,

        #[clap(long, help = "Caller identity; an owned session only records its owner")]
        caller: Option<String>,

        #[clap(long, help = "Wall-clock limit in milliseconds")]
        timeout_ms: Option<u64>,

        #[clap(long, help = "Memory ceiling in bytes")]
        memory_limit: Option<u64>,

        #[clap(long = "package", short, help = "Package to install before running (repeatable)")]
        packages: Vec<String>,
    },
    /// List languages with a registered engine
    Languages,
    /// Check code without running it
    Validate {
        file: Option<PathBuf>,

        #[clap(long, short = 'L')]
        language: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::from_file_or_default(&cli.config)
        .await
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    env_logger::Builder::new()
        .filter_level(level.parse().unwrap_or(LevelFilter::Info))
        .target(env_logger::Target::Stderr)
        .init();

    let dispatcher = Arc::new(ExecutionDispatcher::from_config(&config)?);

    match cli.command {
        Commands::Languages => {
            for language in dispatcher.supported_languages() {
                println!("{:<12} {}", language.as_str(), language.display_name());
            }
            Ok(())
        }
        Commands::Validate { file, language } => {
            let language = resolve_language(language.as_deref(), file.as_deref())?;
            let code = read_source(file.as_deref()).await?;
            let valid = dispatcher.validate_code(&code, language).await;
            println!("{}", if valid { "valid" } else { "invalid" });
            dispatcher.shutdown().await;
            if !valid {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Run {
            file,
            language,
            session,
            caller,
            timeout_ms,
            memory_limit,
            packages,
        } => {
            let language = resolve_language(language.as_deref(), file.as_deref())?;
            let code = read_source(file.as_deref()).await?;

            let mut request = ExecutionRequest::new(code, language).with_packages(packages);
            if let Some(session) = session {
                request = request.with_session(session);
            }
            if let Some(caller) = caller {
                request = request.with_caller(caller);
            }
            if let Some(timeout_ms) = timeout_ms {
                request = request.with_timeout_ms(timeout_ms);
            }
            if let Some(bytes) = memory_limit {
                request = request.with_memory_limit(bytes);
            }

            let result = run_until_interrupted(dispatcher.clone(), request).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);

            dispatcher.shutdown().await;
            if !result.success {
                std::process::exit(1);
            }
            Ok(())
        }
    }
}

/// Run the request, cancelling it on Ctrl+C.
async fn run_until_interrupted(
    dispatcher: Arc<ExecutionDispatcher>,
    request: ExecutionRequest,
) -> Result<ExecutionResult> {
    let mut execution = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.execute(request).await })
    };

    tokio::select! {
        result = &mut execution => Ok(result?),
        _ = tokio::signal::ctrl_c() => {
            log::warn!("Interrupted, cancelling execution");
            dispatcher.cancel_all().await;
            Ok(execution.await?)
        }
    }
}

fn resolve_language(tag: Option<&str>, file: Option<&Path>) -> Result<Language> {
    if let Some(tag) = tag {
        return tag
            .parse()
            .map_err(|_| anyhow::anyhow!("Unknown language '{}'", tag));
    }
    file.and_then(|path| path.extension())
        .and_then(|extension| extension.to_str())
        .and_then(Language::from_extension)
        .context("Cannot infer the language; pass --language")
}

async fn read_source(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display())),
        None => {
            let mut code = String::new();
            tokio::io::stdin()
                .read_to_string(&mut code)
                .await
                .context("Failed to read code from stdin")?;
            Ok(code)
        }
    }
}
