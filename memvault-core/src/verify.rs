/*!
Verifier: post-hoc, read-only health checks.

Runs independently of backup and restore, so it doubles as a standalone health
dashboard. Every check is a read-only probe; the verifier never mutates a
store. Overall status is `Pass` only when every check passed, `Degraded` when
only non-critical checks failed, `Fail` when a liveness probe failed.
*/

use crate::adapter::StoreAdapter;
use crate::config::{ApiEndpoint, StackConfig};
use crate::Result;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

/// Which slice of the stack to verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyMode {
    #[default]
    Full,
    /// Only the HTTP endpoints of the API/UI services
    ApiOnly,
    /// Only the data stores
    DataOnly,
    /// Only configuration completeness
    ConfigOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckKind {
    Liveness,
    Cardinality,
    Api,
    Config,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Pass { detail: String },
    Fail { reason: String },
}

/// One pass/fail result in the report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub kind: CheckKind,
    /// Critical checks (liveness probes) drive `Fail`; the rest only degrade
    pub critical: bool,
    pub outcome: CheckOutcome,
}

impl Check {
    pub fn passed(&self) -> bool {
        matches!(self.outcome, CheckOutcome::Pass { .. })
    }
}

/// Aggregate verdict of one verifier run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStatus {
    Pass,
    Degraded,
    Fail,
}

/// All checks from one verifier run.
#[derive(Debug, Clone, Default)]
pub struct CheckReport {
    pub checks: Vec<Check>,
}

impl CheckReport {
    pub fn push(&mut self, check: Check) {
        self.checks.push(check);
    }

    pub fn status(&self) -> VerifyStatus {
        let critical_failed = self.checks.iter().any(|c| c.critical && !c.passed());
        if critical_failed {
            VerifyStatus::Fail
        } else if self.checks.iter().any(|c| !c.passed()) {
            VerifyStatus::Degraded
        } else {
            VerifyStatus::Pass
        }
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed())
    }
}

/// Stateless, read-only verifier over the configured stack.
pub struct Verifier {
    config: StackConfig,
    client: Client,
}

impl Verifier {
    pub fn new(config: StackConfig) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self { config, client })
    }

    /// Run the checks selected by `mode` against the given adapters.
    pub async fn run(&self, adapters: &[Box<dyn StoreAdapter>], mode: VerifyMode) -> CheckReport {
        let mut report = CheckReport::default();

        if matches!(mode, VerifyMode::Full | VerifyMode::ConfigOnly) {
            self.config_checks(&mut report);
        }
        if matches!(mode, VerifyMode::Full | VerifyMode::ApiOnly) {
            self.api_checks(&mut report).await;
        }
        if matches!(mode, VerifyMode::Full | VerifyMode::DataOnly) {
            self.store_checks(adapters, &mut report).await;
        }

        info!(
            checks = report.checks.len(),
            status = ?report.status(),
            "verification finished"
        );
        report
    }

    fn config_checks(&self, report: &mut CheckReport) {
        let outcome = match self.config.validate() {
            Ok(()) => CheckOutcome::Pass {
                detail: "connection parameters complete".to_string(),
            },
            Err(e) => CheckOutcome::Fail {
                reason: e.to_string(),
            },
        };
        report.push(Check {
            name: "config".to_string(),
            kind: CheckKind::Config,
            critical: false,
            outcome,
        });
    }

    async fn api_checks(&self, report: &mut CheckReport) {
        for ApiEndpoint { name, url } in &self.config.api_endpoints {
            debug!(name, url, "probing API endpoint");
            let outcome = match self.client.get(url).send().await {
                Ok(response) if response.status().is_success() => CheckOutcome::Pass {
                    detail: format!("{}", response.status()),
                },
                Ok(response) => CheckOutcome::Fail {
                    reason: format!("{url} returned {}", response.status()),
                },
                Err(e) => CheckOutcome::Fail {
                    reason: format!("{url} unreachable: {e}"),
                },
            };
            report.push(Check {
                name: format!("api/{name}"),
                kind: CheckKind::Api,
                critical: true,
                outcome,
            });
        }
    }

    async fn store_checks(&self, adapters: &[Box<dyn StoreAdapter>], report: &mut CheckReport) {
        for adapter in adapters {
            let kind = adapter.kind();

            let liveness = match adapter.probe().await {
                Ok(()) => CheckOutcome::Pass {
                    detail: "reachable".to_string(),
                },
                Err(e) => CheckOutcome::Fail {
                    reason: e.to_string(),
                },
            };
            let alive = matches!(liveness, CheckOutcome::Pass { .. });
            report.push(Check {
                name: format!("{kind}/liveness"),
                kind: CheckKind::Liveness,
                critical: true,
                outcome: liveness,
            });

            // Counting against a dead store would only produce noise.
            if !alive {
                continue;
            }
            match adapter.cardinality().await {
                Ok(counts) => {
                    for c in counts {
                        report.push(Check {
                            name: format!("{kind}/{}", c.unit),
                            kind: CheckKind::Cardinality,
                            critical: false,
                            outcome: CheckOutcome::Pass {
                                detail: format!("{} {}", c.count, c.what),
                            },
                        });
                    }
                }
                Err(e) => report.push(Check {
                    name: format!("{kind}/cardinality"),
                    kind: CheckKind::Cardinality,
                    critical: false,
                    outcome: CheckOutcome::Fail {
                        reason: e.to_string(),
                    },
                }),
            }
        }
    }
}
