use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sparkle_cover_core::db::history::SqliteHistoryStore;
use sparkle_cover_core::db::DbConfig;
use sparkle_cover_core::pipeline::capabilities::ModelCapabilities;
use sparkle_cover_core::pipeline::ingest::{HttpImageSource, RunRequest};
use sparkle_cover_core::pipeline::settings::load_settings;
use sparkle_cover_core::pipeline::tool_adapters::gemini::GeminiClient;
use sparkle_cover_core::pipeline::workflow::CoverWorkflow;
use sparkle_cover_core::storage::CandidateArtifactStore;
use tracing::info;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let cli_args = std::env::args().skip(1).collect::<Vec<_>>();
    if cli_args
        .iter()
        .any(|arg| matches!(arg.as_str(), "-h" | "--help"))
    {
        print_usage();
        return Ok(());
    }
    let args = parse_cli_args(cli_args.as_slice())?;

    let app_root = match args.app_root.clone() {
        Some(root) => root,
        None => std::env::current_dir()?,
    };
    let settings = load_settings(app_root.as_path(), args.settings_path.as_deref())?;

    let gemini = Arc::new(GeminiClient::new(settings.gemini_config())?);
    let capabilities = ModelCapabilities::from_single(gemini);
    let image_source = Arc::new(HttpImageSource::new(Duration::from_secs(
        settings.http_timeout_secs,
    ))?);
    let db = DbConfig::resolve(settings.catalog_db.as_path(), app_root.as_path());
    let history = SqliteHistoryStore::new(db.history_db_path());
    history.initialize()?;
    let artifacts = CandidateArtifactStore::new(resolve_under(
        settings.out_dir.as_path(),
        app_root.as_path(),
    ));

    let request = read_run_request(args.input_path.as_deref())?;
    info!(
        product_id = request.product_id.as_str(),
        images = request.images.len(),
        max_retries = settings.max_retries,
        "starting cover run"
    );

    let workflow = CoverWorkflow::new(image_source, capabilities, Arc::new(history), artifacts)
        .with_max_retries(settings.max_retries);
    let outcome = workflow.run(&request)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .try_init();
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CoverCliArgs {
    input_path: Option<PathBuf>,
    settings_path: Option<String>,
    app_root: Option<PathBuf>,
}

fn parse_cli_args(args: &[String]) -> Result<CoverCliArgs, Box<dyn std::error::Error>> {
    let mut parsed = CoverCliArgs::default();
    let mut i = 0usize;
    while i < args.len() {
        let flag = args[i].as_str();
        let needs_value = |idx: usize| -> Result<String, Box<dyn std::error::Error>> {
            let Some(value) = args.get(idx + 1) else {
                return Err(std::io::Error::other(format!("Missing value for {flag}")).into());
            };
            Ok(value.clone())
        };

        match flag {
            "--input" => {
                parsed.input_path = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            "--settings" => {
                parsed.settings_path = Some(needs_value(i)?);
                i += 2;
            }
            "--app-root" => {
                parsed.app_root = Some(PathBuf::from(needs_value(i)?));
                i += 2;
            }
            unknown => {
                return Err(std::io::Error::other(format!(
                    "Unknown argument: {unknown}\n\nUse --help for usage."
                ))
                .into());
            }
        }
    }
    Ok(parsed)
}

fn read_run_request(input_path: Option<&Path>) -> Result<RunRequest, Box<dyn std::error::Error>> {
    let raw = match input_path {
        Some(path) => std::fs::read_to_string(path)?,
        None => {
            let mut buf = String::new();
            std::io::stdin().read_to_string(&mut buf)?;
            buf
        }
    };
    Ok(serde_json::from_str::<RunRequest>(raw.as_str())?)
}

fn resolve_under(configured: &Path, app_root: &Path) -> PathBuf {
    if configured.is_absolute() {
        configured.to_path_buf()
    } else {
        app_root.join(configured)
    }
}

fn print_usage() {
    eprintln!(
        concat!(
            "Usage:\n",
            "  sparkle-cover [--input payload.json] [--settings PATH] [--app-root PATH]\n\n",
            "Defaults:\n",
            "  without --input the run payload is read from stdin\n",
            "  --app-root defaults to the current directory (.env and relative paths resolve here)\n",
            "  settings default: config/sparkle.settings.toml under the app root\n"
        )
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn parses_all_flags() {
        let parsed = parse_cli_args(&args(&[
            "--input",
            "payload.json",
            "--settings",
            "custom.toml",
            "--app-root",
            "/srv/sparkle",
        ]))
        .expect("flags should parse");
        assert_eq!(
            parsed,
            CoverCliArgs {
                input_path: Some(PathBuf::from("payload.json")),
                settings_path: Some(String::from("custom.toml")),
                app_root: Some(PathBuf::from("/srv/sparkle")),
            }
        );
    }

    #[test]
    fn no_flags_means_stdin_and_defaults() {
        let parsed = parse_cli_args(&[]).expect("empty args should parse");
        assert_eq!(parsed, CoverCliArgs::default());
    }

    #[test]
    fn rejects_missing_values_and_unknown_flags() {
        let missing = parse_cli_args(&args(&["--input"])).expect_err("missing value should fail");
        assert!(missing.to_string().contains("Missing value for --input"));
        let unknown = parse_cli_args(&args(&["--bogus"])).expect_err("unknown flag should fail");
        assert!(unknown.to_string().contains("Unknown argument: --bogus"));
    }

    #[test]
    fn relative_out_dir_resolves_under_app_root() {
        assert_eq!(
            resolve_under(Path::new("./out"), Path::new("/srv/app")),
            PathBuf::from("/srv/app/./out")
        );
        assert_eq!(
            resolve_under(Path::new("/data/out"), Path::new("/srv/app")),
            PathBuf::from("/data/out")
        );
    }
}
