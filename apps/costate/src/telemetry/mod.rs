fn env_truthy(var: &str) -> Option<bool> {
    std::env::var(var).map(|v| v != "0" && !v.is_empty()).ok()
}

pub mod logging {
    use clap::ValueEnum;
    use std::fs::OpenOptions;
    use std::path::PathBuf;
    use std::sync::OnceLock;
    use tracing::level_filters::LevelFilter;
    use tracing_appender::non_blocking::WorkerGuard;
    use tracing_subscriber::EnvFilter;

    /// Areas that log under `costate::<area>`.
    pub const COMPONENTS: &[&str] = &[
        "session",
        "dispatch",
        "intake",
        "outbound",
        "codec",
        "subscription",
        "catalog",
        "config",
        "replay",
        "telemetry",
    ];

    /// Emits one trace event per fragment; kept at debug unless asked for.
    const CHATTY_COMPONENT: &str = "codec";

    #[derive(Clone, Copy, Debug, Default, ValueEnum, PartialEq, Eq, PartialOrd, Ord)]
    pub enum LogLevel {
        Error,
        #[default]
        Warn,
        Info,
        Debug,
        Trace,
    }

    impl LogLevel {
        pub fn as_str(self) -> &'static str {
            match self {
                LogLevel::Error => "error",
                LogLevel::Warn => "warn",
                LogLevel::Info => "info",
                LogLevel::Debug => "debug",
                LogLevel::Trace => "trace",
            }
        }

        pub fn to_filter(self) -> LevelFilter {
            match self {
                LogLevel::Error => LevelFilter::ERROR,
                LogLevel::Warn => LevelFilter::WARN,
                LogLevel::Info => LevelFilter::INFO,
                LogLevel::Debug => LevelFilter::DEBUG,
                LogLevel::Trace => LevelFilter::TRACE,
            }
        }
    }

    #[derive(Clone, Debug, Default)]
    pub struct LogConfig {
        pub level: LogLevel,
        pub file: Option<PathBuf>,
        /// Restricts debug/trace output to these areas; empty means all.
        pub components: Vec<String>,
    }

    #[derive(thiserror::Error, Debug)]
    pub enum InitError {
        #[error("failed to open log file {path:?}: {source}")]
        Io {
            path: PathBuf,
            source: std::io::Error,
        },
        #[error("unknown log component {0:?}")]
        UnknownComponent(String),
        #[error("failed to configure logger: {0}")]
        Configure(String),
    }

    /// Directives derived from the configured level and components.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct FilterPlan {
        pub directives: String,
        pub chunk_traces_capped: bool,
    }

    static INIT: OnceLock<()> = OnceLock::new();
    static GUARD: OnceLock<WorkerGuard> = OnceLock::new();

    /// Installs the global fmt subscriber once; later calls are no-ops.
    pub fn init(config: &LogConfig) -> Result<(), InitError> {
        if INIT.get().is_some() {
            return Ok(());
        }

        let plan = match std::env::var("COSTATE_LOG_FILTER") {
            Ok(filter) => FilterPlan {
                directives: filter,
                chunk_traces_capped: false,
            },
            Err(_) => plan_filter(
                config.level.to_filter(),
                &config.components,
                allow_chunk_traces(),
            )?,
        };
        let env_filter = EnvFilter::try_new(&plan.directives)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let (writer, guard) = match &config.file {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|source| InitError::Io {
                        path: path.clone(),
                        source,
                    })?;
                tracing_appender::non_blocking(file)
            }
            None => tracing_appender::non_blocking(std::io::stderr()),
        };

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(config.level >= LogLevel::Debug)
            .with_thread_ids(config.level >= LogLevel::Trace)
            .with_ansi(config.file.is_none())
            .with_writer(writer)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .map_err(|err| InitError::Configure(err.to_string()))?;

        let _ = GUARD.set(guard);
        INIT.set(()).ok();
        tracing::debug!(
            target = "costate::telemetry",
            directives = %plan.directives,
            chunk_traces_capped = plan.chunk_traces_capped,
            "logging initialized"
        );
        Ok(())
    }

    fn allow_chunk_traces() -> bool {
        super::env_truthy("COSTATE_TRACE_CHUNKS").unwrap_or(false)
    }

    /// Builds the filter for `level`. At debug and trace only the selected
    /// `costate::*` areas are raised; everything else stays at info.
    pub fn plan_filter(
        level: LevelFilter,
        components: &[String],
        chunk_traces: bool,
    ) -> Result<FilterPlan, InitError> {
        let verbose = match level {
            LevelFilter::TRACE => "trace",
            LevelFilter::DEBUG => "debug",
            other => {
                return Ok(FilterPlan {
                    directives: other.to_string().to_lowercase(),
                    chunk_traces_capped: false,
                });
            }
        };

        let selected: Vec<&str> = if components.is_empty() {
            COMPONENTS.to_vec()
        } else {
            components
                .iter()
                .map(|name| {
                    COMPONENTS
                        .iter()
                        .copied()
                        .find(|known| *known == name.as_str())
                        .ok_or_else(|| InitError::UnknownComponent(name.clone()))
                })
                .collect::<Result<_, _>>()?
        };

        let mut capped = false;
        let mut directives = String::from("info");
        for component in selected {
            let component_level = if component == CHATTY_COMPONENT && verbose == "trace" && !chunk_traces {
                capped = true;
                "debug"
            } else {
                verbose
            };
            directives.push_str(&format!(",costate::{component}={component_level}"));
        }
        Ok(FilterPlan {
            directives,
            chunk_traces_capped: capped,
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn debug_raises_every_component() {
            let plan = plan_filter(LevelFilter::DEBUG, &[], false).expect("plan");
            for component in COMPONENTS {
                assert!(plan.directives.contains(&format!("costate::{component}=debug")));
            }
            assert!(!plan.chunk_traces_capped);
        }

        #[test]
        fn trace_caps_fragment_events_unless_enabled() {
            let plan = plan_filter(LevelFilter::TRACE, &[], false).expect("plan");
            assert!(plan.directives.contains("costate::codec=debug"));
            assert!(plan.directives.contains("costate::intake=trace"));
            assert!(plan.chunk_traces_capped);

            let plan = plan_filter(LevelFilter::TRACE, &[], true).expect("plan");
            assert!(plan.directives.contains("costate::codec=trace"));
            assert!(!plan.chunk_traces_capped);
        }

        #[test]
        fn component_selection_limits_verbosity() {
            let plan = plan_filter(
                LevelFilter::DEBUG,
                &["intake".to_string(), "session".to_string()],
                false,
            )
            .expect("plan");
            assert_eq!(
                plan.directives,
                "info,costate::intake=debug,costate::session=debug"
            );

            let err = plan_filter(LevelFilter::DEBUG, &["webrtc".to_string()], false)
                .expect_err("unknown");
            assert!(matches!(err, InitError::UnknownComponent(name) if name == "webrtc"));
        }

        #[test]
        fn quiet_levels_use_a_single_directive() {
            let plan = plan_filter(LevelFilter::WARN, &["codec".to_string()], false).expect("plan");
            assert_eq!(plan.directives, "warn");
            assert_eq!(LogLevel::default().as_str(), "warn");
            assert!(LogLevel::Trace > LogLevel::Debug);
        }
    }
}
