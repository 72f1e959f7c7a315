//! Per-kind posture check evaluation.
//!
//! Every evaluation yields `Ok(())` or a [`CheckFailure`] carrying the
//! check's requirement and the endpoint's reported values. Missing posture
//! data is evaluated as empty data, so every check fails with empty actuals.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde_json::json;

use super::data::{ApiSessionPostureData, PostureData, SdkInfo};
use super::CheckFailure;
use crate::roles::Semantic;
use crate::types::posture_check::{MfaCheck, OperatingSystem, ProcessSpec, MFA_NO_TIMEOUT};
use crate::types::PostureCheck;

/// C SDKs below this version cannot re-prompt for MFA.
const LEGACY_C_SDK_TYPE: &str = "ziti-sdk-c";
const LEGACY_C_SDK_MAX: semver::Version = semver::Version::new(0, 25, 0);

static MAC_NON_HEX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"[^a-f0-9]+").ok());

/// Inputs shared by every check in one evaluation.
#[derive(Debug, Clone, Copy)]
pub struct CheckContext<'a> {
    /// Api session the request came from.
    pub api_session_id: &'a str,
    /// Identity posture, if any was reported.
    pub data: Option<&'a PostureData>,
    /// Evaluation time.
    pub now: DateTime<Utc>,
    /// Time allowed after wake/unlock before MFA must be repeated.
    pub mfa_grace: Duration,
}

/// Request-scoped memo of check results keyed by check id.
///
/// A check shared by several policies is evaluated once per request.
#[derive(Debug, Default)]
pub struct CheckResultCache {
    results: HashMap<String, Result<(), CheckFailure>>,
    evaluations: usize,
}

impl CheckResultCache {
    /// Empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached result for `check`, evaluating it on first use.
    pub fn evaluate(&mut self, check: &PostureCheck, ctx: &CheckContext<'_>) -> Result<(), CheckFailure> {
        if let Some(result) = self.results.get(&check.id) {
            return result.clone();
        }
        let result = evaluate(check, ctx);
        self.evaluations = self.evaluations.saturating_add(1);
        self.results.insert(check.id.clone(), result.clone());
        result
    }

    /// Number of checks actually evaluated.
    pub fn evaluations(&self) -> usize {
        self.evaluations
    }
}

/// Evaluate one check.
pub fn evaluate(check: &PostureCheck, ctx: &CheckContext<'_>) -> Result<(), CheckFailure> {
    let empty = PostureData::default();
    let data = ctx.data.unwrap_or(&empty);

    use crate::types::PostureCheckKind as K;
    let outcome = match &check.kind {
        K::Os { operating_systems } => os(operating_systems, data),
        K::Mac { mac_addresses } => mac(mac_addresses, data),
        K::Domain { domains } => domain(domains, data),
        K::Process { process } => {
            let passed = process_passes(process, data);
            Outcome {
                passed,
                expected: process_expected(process),
                actual: process_actual(process, data),
            }
        }
        K::ProcessMulti {
            semantic,
            processes,
        } => process_multi(*semantic, processes, data),
        K::Mfa(mfa) => mfa_outcome(mfa, ctx, data),
    };

    if outcome.passed {
        Ok(())
    } else {
        Err(CheckFailure {
            check_id: check.id.clone(),
            check_name: check.name.clone(),
            check_type: check.type_id(),
            expected: outcome.expected,
            actual: outcome.actual,
        })
    }
}

struct Outcome {
    passed: bool,
    expected: serde_json::Value,
    actual: serde_json::Value,
}

// ---------------------------------------------------------------------------
// OS
// ---------------------------------------------------------------------------

/// Parse a reported OS version leniently: up to three numeric components,
/// missing ones are zero, anything after the third is ignored.
pub fn parse_lenient_version(raw: &str) -> Option<semver::Version> {
    let mut parts = [0u64; 3];
    let mut seen = 0usize;
    for (slot, piece) in parts.iter_mut().zip(raw.trim().split('.')) {
        let digits: String = piece.chars().take_while(char::is_ascii_digit).collect();
        if digits.is_empty() {
            break;
        }
        *slot = digits.parse().ok()?;
        seen = seen.saturating_add(1);
    }
    if seen == 0 {
        return None;
    }
    Some(semver::Version::new(parts[0], parts[1], parts[2]))
}

fn os(allowed: &[OperatingSystem], data: &PostureData) -> Outcome {
    let (os_type, version) = data
        .os
        .as_ref()
        .map(|o| (o.os_type.as_str(), o.version.as_str()))
        .unwrap_or(("", ""));

    let passed = !os_type.is_empty()
        && allowed.iter().any(|candidate| {
            if !candidate.os_type.eq_ignore_ascii_case(os_type) {
                return false;
            }
            if candidate.os_versions.is_empty() {
                return true;
            }
            let Some(reported) = parse_lenient_version(version) else {
                return false;
            };
            candidate
                .os_versions
                .iter()
                .filter_map(|req| semver::VersionReq::parse(req).ok())
                .any(|req| req.matches(&reported))
        });

    Outcome {
        passed,
        expected: json!(allowed),
        actual: json!({ "osType": os_type, "osVersion": version }),
    }
}

// ---------------------------------------------------------------------------
// MAC / domain
// ---------------------------------------------------------------------------

/// Lower-case a MAC address and strip separators.
pub fn clean_mac(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    match MAC_NON_HEX.as_ref() {
        Some(re) => re.replace_all(&lower, "").into_owned(),
        None => lower.chars().filter(char::is_ascii_hexdigit).collect(),
    }
}

fn mac(allowed: &[String], data: &PostureData) -> Outcome {
    let allowed_clean: Vec<String> = allowed.iter().map(|m| clean_mac(m)).collect();
    let passed = data
        .mac_addresses
        .iter()
        .map(|m| clean_mac(m))
        .any(|m| !m.is_empty() && allowed_clean.contains(&m));

    Outcome {
        passed,
        expected: json!(allowed),
        actual: json!(data.mac_addresses),
    }
}

fn domain(allowed: &[String], data: &PostureData) -> Outcome {
    let passed = !data.domain.is_empty()
        && allowed
            .iter()
            .any(|d| d.trim().eq_ignore_ascii_case(data.domain.trim()));

    Outcome {
        passed,
        expected: json!(allowed),
        actual: json!(data.domain),
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

fn find_process<'a>(spec: &ProcessSpec, data: &'a PostureData) -> Option<&'a super::data::ProcessInfo> {
    data.processes
        .values()
        .find(|p| p.path.eq_ignore_ascii_case(&spec.path))
}

fn process_passes(spec: &ProcessSpec, data: &PostureData) -> bool {
    let Some(reported) = find_process(spec, data) else {
        return false;
    };
    if !reported.is_running {
        return false;
    }
    if !spec.hashes.is_empty() && !spec.hashes.iter().any(|h| h.eq_ignore_ascii_case(&reported.hash)) {
        return false;
    }
    if !spec.signer_fingerprints.is_empty()
        && !spec.signer_fingerprints.iter().any(|want| {
            reported
                .signer_fingerprints
                .iter()
                .any(|have| have.eq_ignore_ascii_case(want))
        })
    {
        return false;
    }
    true
}

fn process_expected(spec: &ProcessSpec) -> serde_json::Value {
    json!({
        "osType": spec.os_type,
        "path": spec.path,
        "isRunning": true,
        "hashes": spec.hashes,
        "signerFingerprints": spec.signer_fingerprints,
    })
}

fn process_actual(spec: &ProcessSpec, data: &PostureData) -> serde_json::Value {
    match find_process(spec, data) {
        Some(p) => json!({
            "path": p.path,
            "isRunning": p.is_running,
            "hash": p.hash,
            "signerFingerprints": p.signer_fingerprints,
        }),
        None => json!({ "path": spec.path, "isRunning": false }),
    }
}

fn process_multi(semantic: Semantic, processes: &[ProcessSpec], data: &PostureData) -> Outcome {
    let mut results = processes.iter().map(|p| process_passes(p, data));
    let passed = match semantic {
        Semantic::AllOf => results.all(|ok| ok),
        Semantic::AnyOf => results.any(|ok| ok),
    };

    Outcome {
        passed,
        expected: json!({
            "semantic": semantic,
            "processes": processes.iter().map(process_expected).collect::<Vec<_>>(),
        }),
        actual: json!(processes
            .iter()
            .map(|p| process_actual(p, data))
            .collect::<Vec<_>>()),
    }
}

// ---------------------------------------------------------------------------
// MFA
// ---------------------------------------------------------------------------

/// True for C SDKs too old to re-prompt for MFA.
pub fn is_legacy_sdk(info: Option<&SdkInfo>) -> bool {
    let Some(info) = info else {
        return false;
    };
    if info.sdk_type != LEGACY_C_SDK_TYPE {
        return false;
    }
    parse_lenient_version(&info.version).is_some_and(|v| v < LEGACY_C_SDK_MAX)
}

/// Effective timeout for an api session, honoring legacy endpoints.
pub fn effective_timeout_seconds(check: &MfaCheck, session: Option<&ApiSessionPostureData>) -> i64 {
    if check.timeout_seconds == MFA_NO_TIMEOUT {
        return MFA_NO_TIMEOUT;
    }
    if check.ignore_legacy_endpoints && is_legacy_sdk(session.and_then(|s| s.sdk_info.as_ref())) {
        return MFA_NO_TIMEOUT;
    }
    check.timeout_seconds
}

/// True unless the event happened after the last MFA and its grace period
/// has elapsed.
fn passed_since(
    event_at: Option<DateTime<Utc>>,
    passed_at: DateTime<Utc>,
    now: DateTime<Utc>,
    grace: Duration,
) -> bool {
    let Some(event_at) = event_at else {
        return true;
    };
    if passed_at >= event_at {
        return true;
    }
    match event_at.checked_add_signed(grace) {
        Some(deadline) => now <= deadline,
        None => true,
    }
}

fn mfa_outcome(check: &MfaCheck, ctx: &CheckContext<'_>, data: &PostureData) -> Outcome {
    let session = data.api_sessions.get(ctx.api_session_id);
    let passed_at = session.and_then(|s| s.mfa.passed_at);
    let legacy = check.ignore_legacy_endpoints
        && is_legacy_sdk(session.and_then(|s| s.sdk_info.as_ref()));
    let timeout = effective_timeout_seconds(check, session);

    let (passed_mfa, timed_out, on_wake, on_unlock) = match passed_at {
        None => (false, false, false, false),
        Some(passed_at) => {
            // Timeouts past chrono's range never expire.
            let timed_out = timeout != MFA_NO_TIMEOUT
                && Duration::try_seconds(timeout)
                    .and_then(|window| passed_at.checked_add_signed(window))
                    .is_some_and(|expires| ctx.now > expires);
            let state = session.map(|s| s.endpoint_state).unwrap_or_default();
            let on_wake = !check.prompt_on_wake
                || legacy
                || passed_since(state.woken_at, passed_at, ctx.now, ctx.mfa_grace);
            let on_unlock = !check.prompt_on_unlock
                || legacy
                || passed_since(state.unlocked_at, passed_at, ctx.now, ctx.mfa_grace);
            (true, timed_out, on_wake, on_unlock)
        }
    };

    Outcome {
        passed: passed_mfa && !timed_out && on_wake && on_unlock,
        expected: json!({
            "passedMfa": true,
            "timeoutSeconds": check.timeout_seconds,
            "passedOnWake": check.prompt_on_wake,
            "passedOnUnlock": check.prompt_on_unlock,
            "ignoreLegacyEndpoints": check.ignore_legacy_endpoints,
        }),
        actual: json!({
            "passedMfa": passed_mfa,
            "timedOut": timed_out,
            "timeoutSeconds": timeout,
            "passedOnWake": on_wake,
            "passedOnUnlock": on_unlock,
            "legacyEndpoint": legacy,
        }),
    }
}
