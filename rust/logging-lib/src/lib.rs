use clap::{Args, ValueEnum};
use is_terminal::IsTerminal;
use tracing::{Dispatch, dispatcher};
use tracing_log::AsLog;
use tracing_subscriber::EnvFilter;

/// Logging flags shared by the binaries of the workspace. Each flag can also
/// be set through its environment variable.
#[derive(Debug, Clone, Args)]
pub struct LoggingOpts {
    #[clap(long, env = "COLL_LOG_FORMAT", default_value = "text")]
    pub log_format: LogFormat,

    #[clap(long, env = "COLL_LOG_COLOR", default_value = "auto")]
    pub log_color: LogColor,

    /// Default level directives in the RUST_LOG format, e.g.
    /// `coll_lib=debug`. Targets also listed in RUST_LOG take the RUST_LOG level.
    #[clap(long, env = "COLL_LOG_DIRECTIVES")]
    pub log_directives: Option<String>,
}

impl Default for LoggingOpts {
    fn default() -> Self {
        Self { log_format: LogFormat::Text, log_color: LogColor::Auto, log_directives: None }
    }
}

impl LoggingOpts {
    fn env_filter(&self) -> anyhow::Result<EnvFilter> {
        let mut builder = EnvFilter::builder();
        if let Some(directives) = &self.log_directives {
            builder = builder.with_default_directive(directives.parse()?);
        }
        Ok(builder.from_env_lossy())
    }
}

/// Installs the global subscriber and forwards `log` records to it.
/// Fails if a global subscriber is already set.
pub fn init(opts: &LoggingOpts) -> anyhow::Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(opts.env_filter()?);

    #[cfg(test)]
    let builder = builder.with_test_writer();

    #[cfg(not(test))]
    let builder = builder.with_writer(std::io::stderr);

    let dispatch: Dispatch = match opts.log_format {
        LogFormat::Text => builder.with_ansi(opts.log_color.enabled()).finish().into(),
        LogFormat::Json => builder.json().with_current_span(false).finish().into(),
    };
    dispatcher::set_global_default(dispatch)?;

    // After the subscriber, so the max level hint is known.
    tracing_log::LogTracer::builder()
        .with_max_level(tracing_core::LevelFilter::current().as_log())
        .init()?;
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogColor {
    Auto,
    Always,
    Never,
}

impl LogColor {
    /// Whether ANSI colors go into the log output, which is stderr.
    pub fn enabled(self) -> bool {
        match self {
            LogColor::Auto => std::io::stderr().is_terminal(),
            LogColor::Always => true,
            LogColor::Never => false,
        }
    }
}
