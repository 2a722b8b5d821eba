use pricebot_core::config::{AppConfig, LoadOptions, StoreBackend};
use pricebot_core::store::SharedStore;
use pricebot_db::{connect_from_config, migrations, SqlSharedStore};
use serde::Serialize;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
    Skipped,
}

#[derive(Debug, Serialize)]
struct DoctorCheck {
    name: &'static str,
    status: CheckStatus,
    details: String,
}

#[derive(Debug, Serialize)]
struct DoctorReport {
    overall_status: CheckStatus,
    summary: String,
    checks: Vec<DoctorCheck>,
}

impl DoctorReport {
    fn passed(&self) -> bool {
        self.overall_status != CheckStatus::Fail
    }
}

/// Returns the rendered report and whether every required check passed.
pub fn run(json_output: bool) -> (bool, String) {
    let report = build_report();
    let passed = report.passed();

    if json_output {
        let output = serde_json::to_string_pretty(&report).unwrap_or_else(|error| {
            format!(
                "{{\"overall_status\":\"fail\",\
                 \"summary\":\"doctor serialization failed\",\"error\":\"{}\"}}",
                escape_json(&error.to_string())
            )
        });
        return (passed, output);
    }

    (passed, render_human(&report))
}

fn build_report() -> DoctorReport {
    let mut checks = Vec::new();

    match AppConfig::load(LoadOptions::default()) {
        Ok(config) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Pass,
                details: "configuration loaded and validated".to_string(),
            });
            checks.push(check_chat_transport(&config));
            checks.extend(check_store(&config));
        }
        Err(error) => {
            checks.push(DoctorCheck {
                name: "config_validation",
                status: CheckStatus::Fail,
                details: error.to_string(),
            });
            for name in ["chat_transport", "store_connectivity", "store_migrations"] {
                checks.push(DoctorCheck {
                    name,
                    status: CheckStatus::Skipped,
                    details: "skipped because configuration did not load".to_string(),
                });
            }
        }
    }

    let failed = checks
        .iter()
        .any(|check| matches!(check.status, CheckStatus::Fail | CheckStatus::Skipped));
    let warned = checks.iter().any(|check| check.status == CheckStatus::Warn);
    let (overall_status, summary) = match (failed, warned) {
        (true, _) => (CheckStatus::Fail, "doctor: one or more readiness checks failed"),
        (false, true) => (CheckStatus::Warn, "doctor: ready, with warnings"),
        (false, false) => (CheckStatus::Pass, "doctor: all readiness checks passed"),
    };

    DoctorReport { overall_status, summary: summary.to_string(), checks }
}

fn check_chat_transport(config: &AppConfig) -> DoctorCheck {
    match &config.chat.bot_token {
        Some(_) => DoctorCheck {
            name: "chat_transport",
            status: CheckStatus::Pass,
            details: format!("replies are sent through `{}`", config.chat.api_base_url),
        },
        None => DoctorCheck {
            name: "chat_transport",
            status: CheckStatus::Warn,
            details: "chat.bot_token is unset; replies will only be logged".to_string(),
        },
    }
}

fn check_store(config: &AppConfig) -> Vec<DoctorCheck> {
    if config.store.backend == StoreBackend::Memory {
        return vec![
            DoctorCheck {
                name: "store_connectivity",
                status: CheckStatus::Warn,
                details: "memory backend: state is per process and not shared across workers"
                    .to_string(),
            },
            DoctorCheck {
                name: "store_migrations",
                status: CheckStatus::Pass,
                details: "memory backend needs no migrations".to_string(),
            },
        ];
    }

    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            return vec![DoctorCheck {
                name: "store_connectivity",
                status: CheckStatus::Fail,
                details: format!("failed to initialize async runtime: {error}"),
            }];
        }
    };

    runtime.block_on(async {
        let pool = match connect_from_config(&config.store).await {
            Ok(pool) => pool,
            Err(error) => {
                return vec![
                    DoctorCheck {
                        name: "store_connectivity",
                        status: CheckStatus::Fail,
                        details: format!("failed to connect to store: {error}"),
                    },
                    DoctorCheck {
                        name: "store_migrations",
                        status: CheckStatus::Skipped,
                        details: "skipped because the store is unreachable".to_string(),
                    },
                ];
            }
        };

        let store = SqlSharedStore::with_system_clock(pool.clone());
        let connectivity = match store.ping().await {
            Ok(()) => DoctorCheck {
                name: "store_connectivity",
                status: CheckStatus::Pass,
                details: format!("connected using `{}`", config.store.url),
            },
            Err(error) => DoctorCheck {
                name: "store_connectivity",
                status: CheckStatus::Fail,
                details: error.to_string(),
            },
        };

        let known = migrations::known_versions();
        let migrations = match migrations::applied_versions(&pool).await {
            Ok(applied) if applied == known => DoctorCheck {
                name: "store_migrations",
                status: CheckStatus::Pass,
                details: format!("{} migration(s) applied", applied.len()),
            },
            Ok(applied) => DoctorCheck {
                name: "store_migrations",
                status: CheckStatus::Fail,
                details: format!(
                    "{} of {} migration(s) applied; run `pricebot migrate`",
                    applied.len(),
                    known.len()
                ),
            },
            Err(error) => DoctorCheck {
                name: "store_migrations",
                status: CheckStatus::Fail,
                details: error.to_string(),
            },
        };

        pool.close().await;
        vec![connectivity, migrations]
    })
}

fn render_human(report: &DoctorReport) -> String {
    let mut lines = Vec::new();
    lines.push(report.summary.clone());

    for check in &report.checks {
        let marker = match check.status {
            CheckStatus::Pass => "ok",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
            CheckStatus::Skipped => "skip",
        };
        lines.push(format!("- [{marker}] {}: {}", check.name, check.details));
    }

    lines.join("\n")
}

fn escape_json(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}
