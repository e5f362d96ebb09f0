//! Trafficrec CLI

use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use trafficrec::config::{RecorderConfig, RecordingFormat};
use trafficrec::recording::Recorder;
use trafficrec::storage::read_recording;
use trafficrec::transport::{Script, ScriptedTransport};

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        process::exit(1);
    }

    let result = match args[1].as_str() {
        "record" => record(&args[2..]),
        "show" => match args.get(2) {
            Some(file) => show(Path::new(file)),
            None => {
                eprintln!("Usage: trafficrec show <file>");
                process::exit(1);
            }
        },
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        command => {
            eprintln!("Unknown command: {command}");
            eprintln!("Run 'trafficrec' for usage information.");
            process::exit(1);
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

fn print_usage() {
    eprintln!("Trafficrec v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: trafficrec <command> [options]");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  record <script.toml> [output-dir] [--format F] [--config C]");
    eprintln!("            Replay a capture script through a recorder");
    eprintln!("  show <file>");
    eprintln!("            Print a Mocktail or HTTP-message recording");
    eprintln!();
    eprintln!("Formats: body_only, mocktail, http_message");
}

struct RecordArgs {
    script: PathBuf,
    output: Option<PathBuf>,
    format: Option<RecordingFormat>,
    config: Option<PathBuf>,
}

fn parse_record_args(args: &[String]) -> Result<RecordArgs> {
    let mut positional = Vec::new();
    let mut format = None;
    let mut config = None;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--format" | "-f" => {
                let value = iter.next().context("--format needs a value")?;
                format = Some(value.parse::<RecordingFormat>()?);
            }
            "--config" | "-c" => {
                let value = iter.next().context("--config needs a value")?;
                config = Some(PathBuf::from(value));
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {flag}"),
            value => positional.push(PathBuf::from(value)),
        }
    }

    let mut positional = positional.into_iter();
    let Some(script) = positional.next() else {
        bail!("Usage: trafficrec record <script.toml> [output-dir] [--format F] [--config C]");
    };
    let output = positional.next();
    if positional.next().is_some() {
        bail!("Too many arguments");
    }

    Ok(RecordArgs {
        script,
        output,
        format,
        config,
    })
}

fn record(args: &[String]) -> Result<()> {
    let args = parse_record_args(args)?;

    let mut config = match &args.config {
        Some(path) => RecorderConfig::from_file(path)?,
        None => RecorderConfig::default(),
    };
    if let Some(format) = args.format {
        config.format = format;
    }
    if config.format == RecordingFormat::Custom {
        bail!("The custom format needs a serializer and is only available from the library");
    }

    let output = args
        .output
        .or_else(|| config.recording_dir.clone())
        .context("No output directory given and none configured")?;

    let script = Script::from_file(&args.script)?;

    let transport = Arc::new(ScriptedTransport::new());
    let recorder = Recorder::with_config(transport.clone(), &config)?;

    recorder
        .start(&output)
        .with_context(|| format!("Cannot record into {}", output.display()))?;
    let delivered = transport.play(&script);
    recorder.stop();

    info!("Delivered {} of {} events", delivered, script.len());

    let stats = recorder.stats();
    println!("Output directory: {}", output.display());
    println!("Format:           {}", config.format);
    println!("Recorded:         {}", stats.recorded);
    println!("Ignored:          {}", stats.ignored);
    println!("Aborted:          {}", stats.aborted);
    println!("Write failures:   {}", stats.write_failures);
    println!("Policy failures:  {}", stats.policy_failures);
    println!("Bytes written:    {}", stats.bytes_written);

    Ok(())
}

fn show(path: &Path) -> Result<()> {
    let recorded =
        read_recording(path).with_context(|| format!("Cannot read {}", path.display()))?;

    println!("File: {}", path.display());
    if let Some(method) = &recorded.method {
        println!("Method:  {method}");
    }
    if let Some(pattern) = &recorded.url_pattern {
        println!("Pattern: {pattern}");
    }
    println!("Status:  {}", recorded.status);
    println!("Headers:");
    for (name, value) in &recorded.headers {
        println!("  {name}: {value}");
    }
    println!(
        "Body:    {} bytes{}",
        recorded.body.len(),
        if recorded.was_base64 {
            " (stored base64)"
        } else {
            ""
        }
    );

    Ok(())
}
