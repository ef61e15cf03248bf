// src/parser.rs
//
// =============================================================================
// XTB-FORGE: PARSER CASCADE (v 0.1)
// =============================================================================
//
// The Compatibility Adapter.
//
// xTB's output shape drifts across versions and invocation modes: some
// builds emit a JSON blob on stdout, some write `xtbout.json` next to the
// input, some print a JSON fragment buried in banner text, and the oldest
// builds only ever produce plain-text tables. Rather than special-case all
// four at the call site, each shape gets its own `ParseStrategy`, tried in
// a fixed order; the cascade stops at the first strategy that recovers an
// `energy` value, because partial output the earlier strategies can read
// is preferred over a possibly-stale number from a weaker fallback.

use crate::core::ParsedResult;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::Path;
use tokio::fs;

/// HOMO, eV. Used to back-derive HOMO/LUMO from a bare gap when xTB reports
/// only `homo_lumo_gap` (GFN2-xTB's typical compressed summary). This is a
/// domain-level approximation, not a measurement: it centers a plausible
/// frontier-orbital energy for organic molecules, not a physical constant.
const ASSUMED_HOMO_EV: f64 = -7.5;

pub struct ParseContext<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub work_dir: &'a Path,
}

#[async_trait]
pub trait ParseStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `Ok(Some(result))` only when this strategy found a usable
    /// energy value; `Ok(None)` lets the cascade fall through to the next
    /// strategy without this being treated as an error.
    async fn try_parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<Option<ParsedResult>>;
}

/// Runs every strategy in order, returns the first hit, post-processed by
/// the shared normalization pass.
pub struct ParserCascade {
    strategies: Vec<Box<dyn ParseStrategy>>,
}

impl Default for ParserCascade {
    fn default() -> Self {
        Self {
            strategies: vec![
                Box::new(StdoutJsonStrategy),
                Box::new(JsonFileStrategy),
                Box::new(JsonFragmentStrategy),
                Box::new(RegexTableStrategy),
            ],
        }
    }
}

impl ParserCascade {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<ParsedResult> {
        for strategy in &self.strategies {
            match strategy.try_parse(ctx).await {
                Ok(Some(mut result)) => {
                    normalize(&mut result, ctx);
                    log::debug!("parser cascade: {} produced a result", strategy.name());
                    return Ok(result);
                }
                Ok(None) => continue,
                Err(e) => {
                    log::debug!("parser cascade: {} errored: {e}", strategy.name());
                    continue;
                }
            }
        }
        Err(anyhow::anyhow!("no parse strategy recovered an energy value"))
    }
}

/// Shared post-processing applied regardless of which strategy won:
/// alias `gap`/`homo_lumo_gap`, estimate HOMO/LUMO when only the gap is
/// known, and derive `atom_count`/`gradient_norm` from whatever else is
/// present.
fn normalize(result: &mut ParsedResult, ctx: &ParseContext<'_>) {
    if result.gap.is_none() {
        result.gap = result.homo_lumo_gap;
    }
    if result.homo_lumo_gap.is_none() {
        result.homo_lumo_gap = result.gap;
    }

    if result.homo.is_none() && result.lumo.is_none() {
        if let Some(gap) = result.gap {
            result.homo = Some(ASSUMED_HOMO_EV);
            result.lumo = Some(ASSUMED_HOMO_EV + gap);
            result.homo_estimated = true;
        }
    }

    if result.atom_count.is_none() {
        result.atom_count = count_atoms(ctx.stdout).or_else(|| {
            result
                .optimized_geometry
                .as_deref()
                .and_then(count_atoms)
        });
    }

    if result.gradient_norm.is_none() {
        result.gradient_norm = extract_gradient_norm(ctx.stdout);
    }

    if result.convergence_status.is_none() {
        result.convergence_status = Some(infer_convergence(ctx.stdout).to_string());
    }
}

fn count_atoms(xyz_or_log: &str) -> Option<usize> {
    let first_line = xyz_or_log.lines().next()?.trim();
    first_line.parse::<usize>().ok()
}

static GRADIENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)gradient norm\s*[:=]?\s*([0-9.eE+-]+)").unwrap());

fn extract_gradient_norm(stdout: &str) -> Option<f64> {
    GRADIENT_RE
        .captures(stdout)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

fn infer_convergence(stdout: &str) -> &'static str {
    let lower = stdout.to_lowercase();
    if lower.contains("geometry optimization converged") || lower.contains("converged") {
        "converged"
    } else if lower.contains("failed") || lower.contains("aborted") {
        "error"
    } else {
        "not_converged"
    }
}

// ============================================================================
// STRATEGY 1: JSON object embedded directly in stdout
// ============================================================================

struct StdoutJsonStrategy;

#[async_trait]
impl ParseStrategy for StdoutJsonStrategy {
    fn name(&self) -> &'static str {
        "stdout_json"
    }

    async fn try_parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<Option<ParsedResult>> {
        let trimmed = ctx.stdout.trim();
        if !trimmed.starts_with('{') {
            return Ok(None);
        }
        let v: serde_json::Value = serde_json::from_str(trimmed)?;
        let result = xtb_json_to_result(&v);
        Ok(result.has_energy().then_some(result))
    }
}

// ============================================================================
// STRATEGY 2: `xtbout.json` written to the work directory
// ============================================================================

struct JsonFileStrategy;

#[async_trait]
impl ParseStrategy for JsonFileStrategy {
    fn name(&self) -> &'static str {
        "xtbout_json_file"
    }

    async fn try_parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<Option<ParsedResult>> {
        let path = ctx.work_dir.join("xtbout.json");
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path).await?;
        let result = parse_xtbout_json(&raw)?;
        Ok(result.has_energy().then_some(result))
    }
}

/// `xtbout.json`'s schema nests scalars under a `"properties"` object and
/// uses xTB's own key names rather than this crate's canonical ones. Shared
/// by every strategy that produces a `serde_json::Value` off the same raw
/// xTB schema (stdout-embedded JSON, the on-disk file, and the fragment
/// extracted from mixed banner text) so they all agree on the same output
/// shape regardless of which one recovered the result.
fn parse_xtbout_json(raw: &str) -> anyhow::Result<ParsedResult> {
    let v: serde_json::Value = serde_json::from_str(raw)?;
    Ok(xtb_json_to_result(&v))
}

/// Maps xTB's raw JSON schema (`{"properties": {"total energy": ..., "HOMO-LUMO gap/eV": ..., "dipole": {"total": ...}}}`)
/// onto this crate's canonical field names. Falls back to treating the
/// whole object as the properties object when there is no `"properties"`
/// wrapper, so a bare `{"total energy": ...}` fragment still resolves.
fn xtb_json_to_result(v: &serde_json::Value) -> ParsedResult {
    let props = v.get("properties").unwrap_or(v);

    let energy = props.get("total energy").and_then(|x| x.as_f64());
    let gap = props.get("HOMO-LUMO gap/eV").and_then(|x| x.as_f64());
    let dipole = props
        .get("dipole")
        .and_then(|x| x.get("total"))
        .and_then(|x| x.as_f64());

    ParsedResult {
        energy,
        gap,
        homo_lumo_gap: gap,
        dipole,
        ..Default::default()
    }
}

// ============================================================================
// STRATEGY 3: JSON fragment embedded in mixed banner/log text
// ============================================================================

struct JsonFragmentStrategy;

static FRAGMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

#[async_trait]
impl ParseStrategy for JsonFragmentStrategy {
    fn name(&self) -> &'static str {
        "json_fragment"
    }

    async fn try_parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<Option<ParsedResult>> {
        let Some(m) = FRAGMENT_RE.find(ctx.stdout) else {
            return Ok(None);
        };
        let v: serde_json::Value = match serde_json::from_str(m.as_str()) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        let result = xtb_json_to_result(&v);
        Ok(result.has_energy().then_some(result))
    }
}

// ============================================================================
// STRATEGY 4: regex extraction from xTB's plain-text summary table
// ============================================================================

struct RegexTableStrategy;

static ENERGY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)TOTAL ENERGY\s+([-0-9.]+)\s*Eh").unwrap());
static GAP_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)HOMO-LUMO GAP\s+([-0-9.]+)\s*eV").unwrap());
static DIPOLE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)molecular dipole.*?\n.*?full:\s+[-0-9.]+\s+[-0-9.]+\s+[-0-9.]+\s+([-0-9.]+)").unwrap());

#[async_trait]
impl ParseStrategy for RegexTableStrategy {
    fn name(&self) -> &'static str {
        "regex_table"
    }

    async fn try_parse(&self, ctx: &ParseContext<'_>) -> anyhow::Result<Option<ParsedResult>> {
        let energy = ENERGY_RE
            .captures(ctx.stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        let Some(energy) = energy else {
            return Ok(None);
        };
        let gap = GAP_RE
            .captures(ctx.stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());
        let dipole = DIPOLE_RE
            .captures(ctx.stdout)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok());

        Ok(Some(ParsedResult {
            energy: Some(energy),
            gap,
            homo_lumo_gap: gap,
            dipole,
            ..Default::default()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn ctx<'a>(stdout: &'a str, work_dir: &'a Path) -> ParseContext<'a> {
        ParseContext {
            stdout,
            stderr: "",
            work_dir,
        }
    }

    #[tokio::test]
    async fn stdout_json_wins_when_present() {
        // xTB's actual `--json` stdout schema, not this crate's canonical
        // field names: values nest under "properties" and use xTB's own
        // keys ("total energy", "HOMO-LUMO gap/eV", "dipole"."total").
        let cascade = ParserCascade::new();
        let stdout = r#"{"properties": {"total energy": -10.5, "HOMO-LUMO gap/eV": 4.2, "dipole": {"total": 1.1}}}"#;
        let dir = std::env::temp_dir();
        let result = cascade.parse(&ctx(stdout, &dir)).await.unwrap();
        assert_eq!(result.energy, Some(-10.5));
        assert_eq!(result.gap, Some(4.2));
        assert_eq!(result.dipole, Some(1.1));
        assert!(result.homo.is_some() && result.homo_estimated);
        assert_eq!(result.lumo, Some(ASSUMED_HOMO_EV + 4.2));
    }

    #[tokio::test]
    async fn json_fragment_maps_raw_xtb_keys_embedded_in_banner_text() {
        // Strategy 3 only kicks in when stdout isn't a bare JSON object;
        // the fragment here uses the same raw xTB schema as Strategy 2's
        // `xtbout.json`, embedded in surrounding log text.
        let cascade = ParserCascade::new();
        let stdout = "normal termination of xtb\n\
            {\"properties\": {\"total energy\": -8.25, \"HOMO-LUMO gap/eV\": 2.5}}\n\
            * finished run";
        let dir = std::env::temp_dir();
        let result = cascade.parse(&ctx(stdout, &dir)).await.unwrap();
        assert_eq!(result.energy, Some(-8.25));
        assert_eq!(result.gap, Some(2.5));
    }

    #[tokio::test]
    async fn regex_table_used_as_last_resort() {
        let cascade = ParserCascade::new();
        let stdout = "\n:: TOTAL ENERGY     -12.345678 Eh   ::\n:: HOMO-LUMO GAP      3.210000 eV   ::\n";
        let dir = std::env::temp_dir();
        let result = cascade.parse(&ctx(stdout, &dir)).await.unwrap();
        assert!((result.energy.unwrap() - (-12.345678)).abs() < 1e-9);
        assert_eq!(result.gap, Some(3.21));
    }

    #[tokio::test]
    async fn no_strategy_recovers_energy_is_an_error() {
        let cascade = ParserCascade::new();
        let dir = std::env::temp_dir();
        let result = cascade.parse(&ctx("nothing useful here", &dir)).await;
        assert!(result.is_err());
    }

    #[test]
    fn json_file_strategy_maps_xtbout_keys() {
        let raw = r#"{"properties": {"total energy": -5.5, "HOMO-LUMO gap/eV": 2.0}}"#;
        let result = parse_xtbout_json(raw).unwrap();
        assert_eq!(result.energy, Some(-5.5));
        assert_eq!(result.gap, Some(2.0));
    }

    #[test]
    fn atom_count_from_xyz_header() {
        assert_eq!(count_atoms("12\ncomment\nC 0 0 0\n"), Some(12));
        assert_eq!(count_atoms(""), None);
        let _ = PathBuf::new();
    }
}
