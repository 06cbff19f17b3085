//! xRegistry CLI
//!
//! Verifies model documents and drives a registry store from the shell.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing_subscriber::EnvFilter;
use xregistry::model::export::render_model;
use xregistry::{dispatch, Method, Model, ReadOptions, Registry, RegistryConfig, Request, WriteOptions, XPath};

#[derive(Parser)]
#[command(name = "xreg")]
#[command(about = "Inspect and edit an xRegistry store")]
struct Cli {
    /// Config file layered over xregistry.toml and XREGISTRY__* variables
    #[arg(short, long)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Model documents
    Model {
        #[command(subcommand)]
        action: ModelAction,
    },

    /// Load a nested registry document
    Import {
        /// JSON document rooted at the Registry
        file: PathBuf,
    },

    /// Read an entity
    Get {
        /// Registry path, e.g. /dirs/d1/files/f1
        #[arg(default_value = "/")]
        path: String,
        /// Inline collections (comma separated, "*" for everything)
        #[arg(short, long)]
        inline: Option<String>,
        /// Omit empty collections
        #[arg(long)]
        compact: bool,
    },

    /// Send a raw request, e.g. `xreg request DELETE /dirs/d1?epoch=2`
    Request {
        method: String,
        /// Path with optional query
        target: String,
        /// Request body file
        #[arg(short, long)]
        body: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ModelAction {
    /// Check a model document without touching the store
    Verify { file: PathBuf },

    /// Install a model document
    Set { file: PathBuf },

    /// Render a model document, or the store's model when no file is given
    Export {
        file: Option<PathBuf>,
        /// Output format: xRegistry-json or jsonschema
        #[arg(short, long)]
        schema: Option<String>,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn read_json(path: &PathBuf) -> anyhow::Result<Value> {
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn print(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn open(config: Option<&str>) -> anyhow::Result<Registry> {
    let config = RegistryConfig::load_from(config)?;
    Ok(Registry::from_config(&config)?)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config.as_deref();

    match cli.command {
        Commands::Model { action } => match action {
            ModelAction::Verify { file } => {
                let model = Model::from_json(&read_json(&file)?)?;
                println!("✅ Model is valid ({} group types)", model.groups.len());
            }
            ModelAction::Set { file } => print(&open(config)?.set_model(&read_json(&file)?)?)?,
            ModelAction::Export { file: Some(file), schema } => {
                let model = Model::from_json(&read_json(&file)?)?;
                print(&render_model(&model, schema.as_deref())?)?;
            }
            ModelAction::Export { file: None, schema } => print(&open(config)?.render_model(schema.as_deref())?)?,
        },

        Commands::Import { file } => {
            let doc = read_json(&file)?;
            let opts = WriteOptions {
                nested: true,
                ..WriteOptions::default()
            };
            let written = open(config)?.put(&XPath::Registry, &doc, &opts)?;
            print(&written.value)?;
        }

        Commands::Get { path, inline, compact } => {
            let mut opts = inline.as_deref().map(ReadOptions::inline).unwrap_or_default();
            opts.compact = compact;
            let path = XPath::parse(&path)?;
            print(&open(config)?.get(&path, &opts)?)?;
        }

        Commands::Request { method, target, body } => {
            let mut request = Request::parse(Method::parse(&method)?, &target);
            if let Some(file) = body {
                request = request.with_body(std::fs::read(&file)?);
            }
            let response = dispatch(&open(config)?, &request);
            for (name, value) in &response.headers {
                eprintln!("{}: {}", name, value);
            }
            print!("{}", response.text());
            if response.status >= 400 {
                bail!("request failed with status {}", response.status);
            }
        }
    }

    Ok(())
}
