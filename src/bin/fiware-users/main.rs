use argh::FromArgs;
use color_eyre::eyre::{self, WrapErr};
use fiware_users::{census, Census, Client, Report, Settings};
use tokio::io::{self, AsyncWriteExt};
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug)]
enum Format {
    Text,
    Json,
    Yaml,
}

impl std::str::FromStr for Format {
    type Err = eyre::Report;
    fn from_str(s: &str) -> eyre::Result<Self> {
        match s {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            "yaml" => Ok(Self::Yaml),
            _ => eyre::bail!("unsupported output format: {}", s),
        }
    }
}

impl Format {
    fn render(&self, report: &Report) -> eyre::Result<String> {
        let mut s = match self {
            Format::Text => report.to_string(),
            Format::Json => {
                serde_json::to_string_pretty(report).wrap_err("could not JSON serialize report")?
            }
            Format::Yaml => {
                serde_yaml::to_string(report).wrap_err("could not YAML serialize report")?
            }
        };
        if !s.ends_with('\n') {
            s.push('\n');
        }
        Ok(s)
    }
}

#[derive(Debug, FromArgs)]
/// Count the trial and community users of a FIWARE Lab region.
///
/// Settings are read from the file named by FIWARE_USERS_SETTINGS_FILE,
/// or /etc/fiware.d/fiware-users.ini.
struct Opts {
    /// settings file, overrides FIWARE_USERS_SETTINGS_FILE
    #[argh(option, short = 'c')]
    config: Option<std::path::PathBuf>,
    /// format to print the output, can be 'text' (the default), 'json' or 'yaml'.
    #[argh(option, short = 'o', default = "Format::Text")]
    format: Format,
    /// number of user lookups to run at once (default 8)
    #[argh(option, short = 'j', default = "census::DEFAULT_JOBS")]
    jobs: usize,
}

fn init_tracing() -> eyre::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .map_err(|e| eyre::eyre!(e))
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    init_tracing()?;
    let opts: Opts = argh::from_env();

    let settings = Settings::locate(opts.config).wrap_err("no usable settings file")?;
    let client = Client::from_settings(&settings).await?;
    let report = Census::new(&client)
        .jobs(opts.jobs)
        .run(&settings.region)
        .await
        .wrap_err_with(|| format!("census of region {} failed", settings.region))?;

    let out = opts.format.render(&report)?;
    io::stdout()
        .write_all(out.as_bytes())
        .await
        .wrap_err("could not print output")
}
