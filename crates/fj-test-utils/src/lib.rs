#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::any::Any;
use std::panic::{AssertUnwindSafe, UnwindSafe, catch_unwind};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const TEST_LOG_SCHEMA_VERSION: &str = "frankenjax.masking.test-log.v1";

/// Directory that receives one JSON log per logged test. Logging is off
/// when unset.
pub const TEST_LOG_DIR_ENV: &str = "FJ_TEST_LOG_DIR";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestMode {
    /// Deterministic example-based test.
    Strict,
    /// Property test driven by a random seed.
    Property,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestResult {
    Pass,
    Fail,
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogEnv {
    pub rust_version: String,
    pub os: String,
    pub cargo_target_dir: String,
    pub timestamp_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TestPhaseTimings {
    pub setup_ms: u64,
    pub execute_ms: u64,
    pub teardown_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLogV1 {
    pub schema_version: String,
    pub suite_id: String,
    pub test_id: String,
    pub fixture_id: String,
    pub seed: Option<u64>,
    pub mode: TestMode,
    pub env: TestLogEnv,
    pub artifact_refs: Vec<String>,
    pub result: TestResult,
    pub duration_ms: u64,
    pub details: Option<String>,
    pub phase_timings: TestPhaseTimings,
}

impl TestLogV1 {
    #[must_use]
    pub fn unit(
        suite_id: impl Into<String>,
        test_id: impl Into<String>,
        fixture_id: impl Into<String>,
        mode: TestMode,
        result: TestResult,
    ) -> Self {
        Self {
            schema_version: TEST_LOG_SCHEMA_VERSION.to_owned(),
            suite_id: suite_id.into(),
            test_id: test_id.into(),
            fixture_id: fixture_id.into(),
            seed: capture_proptest_seed(),
            mode,
            env: capture_env(),
            artifact_refs: Vec::new(),
            result,
            duration_ms: 0,
            details: None,
            phase_timings: TestPhaseTimings::default(),
        }
    }
}

#[must_use]
pub fn capture_env() -> TestLogEnv {
    TestLogEnv {
        rust_version: rust_version(),
        os: std::env::consts::OS.to_owned(),
        cargo_target_dir: std::env::var("CARGO_TARGET_DIR")
            .unwrap_or_else(|_| "<default>".to_owned()),
        timestamp_unix_ms: now_unix_ms_u64(),
    }
}

/// SHA-256 hex digest of the fixture's JSON encoding.
pub fn fixture_id_from_json<T: Serialize>(fixture: &T) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(fixture)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

#[must_use]
pub fn property_test_case_count() -> u32 {
    if let Ok(raw) = std::env::var("FJ_PROPTEST_CASES")
        && let Ok(parsed) = raw.parse::<u32>()
        && parsed > 0
    {
        return parsed;
    }

    if std::env::var_os("CI").is_some() {
        1024
    } else {
        256
    }
}

#[must_use]
pub fn capture_proptest_seed() -> Option<u64> {
    if let Ok(raw) = std::env::var("FJ_PROPTEST_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    if let Ok(raw) = std::env::var("PROPTEST_RNG_SEED")
        && let Ok(seed) = raw.parse::<u64>()
    {
        return Some(seed);
    }

    None
}

#[must_use]
pub fn test_id(module_path: &str, test_name: &str) -> String {
    format!("{module_path}::{test_name}")
}

#[must_use]
pub fn test_log_path(dir: &Path, suite_id: &str, test_id: &str) -> PathBuf {
    dir.join(suite_id)
        .join(format!("{}.json", test_id.replace("::", "__")))
}

/// Runs `body`, records a [`TestLogV1`] under `$FJ_TEST_LOG_DIR` when set,
/// and re-raises any failure.
///
/// `body` returns artifact references on success or a failure detail.
pub fn run_logged_test<Fixture, F>(
    suite_id: &str,
    module_path: &str,
    test_name: &str,
    fixture: &Fixture,
    mode: TestMode,
    body: F,
) where
    Fixture: Serialize,
    F: FnOnce() -> Result<Vec<String>, String> + UnwindSafe,
{
    let overall_start = Instant::now();
    let setup_start = Instant::now();
    let fixture_id = fixture_id_from_json(fixture).unwrap_or_else(|err| format!("<{err}>"));
    let test_id = test_id(module_path, test_name);
    let mut log = TestLogV1::unit(suite_id, test_id.clone(), fixture_id, mode, TestResult::Fail);
    log.phase_timings.setup_ms = duration_ms(setup_start);

    let execute_start = Instant::now();
    let outcome = catch_unwind(AssertUnwindSafe(body));
    log.phase_timings.execute_ms = duration_ms(execute_start);

    let mut panic_payload: Option<Box<dyn Any + Send>> = None;
    let mut failure_detail: Option<String> = None;
    match outcome {
        Ok(Ok(artifact_refs)) => {
            log.result = TestResult::Pass;
            log.artifact_refs = artifact_refs;
        }
        Ok(Err(detail)) => {
            log.details = Some(detail.clone());
            failure_detail = Some(detail);
        }
        Err(payload) => {
            log.details = Some(panic_payload_to_string(payload.as_ref()));
            panic_payload = Some(payload);
        }
    }

    let teardown_start = Instant::now();
    if let Some(dir) = std::env::var_os(TEST_LOG_DIR_ENV) {
        let path = test_log_path(Path::new(&dir), suite_id, &test_id);
        log.phase_timings.teardown_ms = duration_ms(teardown_start);
        log.duration_ms = duration_ms(overall_start);
        if let Err(err) = write_log(&path, &log) {
            eprintln!("{test_id}: {err}");
        }
    }

    if let Some(payload) = panic_payload {
        std::panic::resume_unwind(payload);
    }
    if let Some(detail) = failure_detail {
        panic!("{detail}");
    }
}

fn write_log(path: &Path, log: &TestLogV1) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|err| format!("log dir create failed: {err}"))?;
    }
    let payload =
        serde_json::to_string_pretty(log).map_err(|err| format!("log serialize failed: {err}"))?;
    std::fs::write(path, payload).map_err(|err| format!("log write failed: {err}"))
}

fn panic_payload_to_string(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        return msg.clone();
    }
    if let Some(msg) = payload.downcast_ref::<&str>() {
        return (*msg).to_owned();
    }
    "non-string panic payload".to_owned()
}

fn duration_ms(start: Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}

fn now_unix_ms_u64() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn rust_version() -> String {
    let output = Command::new("rustc").arg("--version").output();
    match output {
        Ok(result) if result.status.success() => {
            String::from_utf8_lossy(&result.stdout).trim().to_owned()
        }
        _ => "rustc <unknown>".to_owned(),
    }
}
