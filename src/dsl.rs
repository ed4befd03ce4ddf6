//! Requirement DSL evaluator (C10).
//!
//! Grounded on `original_source/src/dsl.c`: a requirement string is a
//! space-separated list of OR'd groups, each group a comma-separated
//! list of AND'd atoms (`name op value`). An atom calls a named rule
//! function with a comparator and a value; `dsl_compare_version` does
//! dotted-numeric version comparison with trailing-zero normalization.

use std::cmp::Ordering;
use std::collections::HashMap;

use crate::error::{NvcError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparator {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
}

impl Comparator {
    fn parse(s: &str) -> Option<(Self, usize)> {
        const OPS: &[(&str, Comparator)] = &[
            ("=", Comparator::Equal),
            ("!=", Comparator::NotEqual),
            ("<=", Comparator::LessEqual),
            ("<", Comparator::Less),
            (">=", Comparator::GreaterEqual),
            (">", Comparator::Greater),
        ];
        for (text, cmp) in OPS {
            if s.starts_with(text) {
                return Some((*cmp, text.len()));
            }
        }
        None
    }

    fn as_str(self) -> &'static str {
        match self {
            Comparator::Equal => "=",
            Comparator::NotEqual => "!=",
            Comparator::Less => "<",
            Comparator::LessEqual => "<=",
            Comparator::Greater => ">",
            Comparator::GreaterEqual => ">=",
        }
    }

    fn holds(self, ord: Ordering) -> bool {
        match self {
            Comparator::Equal => ord == Ordering::Equal,
            Comparator::NotEqual => ord != Ordering::Equal,
            Comparator::Less => ord == Ordering::Less,
            Comparator::LessEqual => ord != Ordering::Greater,
            Comparator::Greater => ord == Ordering::Greater,
            Comparator::GreaterEqual => ord != Ordering::Less,
        }
    }
}

/// Dotted-numeric version compare: `1.2` equals `1.2.0`, trailing zero
/// components are insignificant.
pub fn compare_version(v1: &str, cmp: Comparator, v2: &str) -> Result<bool> {
    let valid = |s: &str| s.chars().all(|c| c.is_ascii_digit() || c == '.');
    if !valid(v1) || !valid(v2) {
        return Err(NvcError::validation(format!("{v1} {v2}")));
    }

    let parts1: Vec<u64> = v1.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let parts2: Vec<u64> = v2.split('.').map(|p| p.parse().unwrap_or(0)).collect();
    let len = parts1.len().max(parts2.len());

    for i in 0..len {
        let a = parts1.get(i).copied().unwrap_or(0);
        let b = parts2.get(i).copied().unwrap_or(0);
        if a != b {
            return Ok(cmp.holds(a.cmp(&b)));
        }
    }
    Ok(cmp.holds(Ordering::Equal))
}

/// A named fact (`cuda`, `driver`, `arch`, `brand`, ...) available to
/// atoms in a requirement expression.
pub type RuleFn<'a> = dyn Fn(Comparator, &str) -> Result<bool> + 'a;

pub struct RuleSet<'a> {
    rules: HashMap<&'static str, Box<RuleFn<'a>>>,
}

impl<'a> RuleSet<'a> {
    pub fn new() -> Self {
        RuleSet { rules: HashMap::new() }
    }

    pub fn insert(&mut self, name: &'static str, f: impl Fn(Comparator, &str) -> Result<bool> + 'a) {
        self.rules.insert(name, Box::new(f));
    }
}

impl<'a> Default for RuleSet<'a> {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluates `expr` against `rules`; `Ok(())` if satisfied,
/// `Err(NvcError::Validation)` naming the first failing atom otherwise.
pub fn evaluate(expr: &str, rules: &RuleSet) -> Result<()> {
    let mut last_failure = String::new();

    for or_group in expr.split(' ').filter(|s| !s.is_empty()) {
        let mut group_ok = true;
        let mut evaluated_any = false;
        for atom in or_group.split(',').filter(|s| !s.is_empty()) {
            evaluated_any = true;
            let (ok, rendered) = evaluate_atom(atom, rules)?;
            if !ok {
                last_failure = rendered;
                group_ok = false;
                break;
            }
        }
        if evaluated_any && group_ok {
            return Ok(());
        }
    }
    Err(NvcError::validation(last_failure))
}

fn evaluate_atom(atom: &str, rules: &RuleSet) -> Result<(bool, String)> {
    let op_start = atom
        .find(|c| "<>=!".contains(c))
        .ok_or_else(|| NvcError::invalid("invalid expression", atom))?;
    let (name, rest) = atom.split_at(op_start);
    if name.is_empty() {
        return Err(NvcError::invalid("invalid expression", atom));
    }
    let (cmp, op_len) = Comparator::parse(rest).ok_or_else(|| NvcError::invalid("invalid expression", atom))?;
    let value = &rest[op_len..];
    if value.is_empty() {
        return Err(NvcError::invalid("invalid expression", atom));
    }

    let rule = rules
        .rules
        .get(name)
        .ok_or_else(|| NvcError::invalid("invalid expression", atom))?;
    let ok = rule(cmp, value)?;
    Ok((ok, format!("{name} {} {value}", cmp.as_str())))
}

/// Builds the driver-scoped rule set (`cuda`, `driver`) from a resolved
/// [`crate::info::DriverInfo`], matching `nvc_cli.c`'s `rules[]` table
/// (`check_cuda_version`/`check_driver_version`).
fn driver_rules(info: &crate::info::DriverInfo) -> RuleSet<'_> {
    let mut rules = RuleSet::new();
    rules.insert("cuda", move |cmp, v| compare_version(&info.cuda_version, cmp, v));
    rules.insert("driver", move |cmp, v| compare_version(&info.nvrm_version, cmp, v));
    rules
}

/// Adds the device-scoped facts (`arch`, `brand`) on top of
/// [`driver_rules`]; when no device is in scope these default to
/// satisfied rather than being omitted.
fn with_device_rules<'a>(mut rules: RuleSet<'a>, device: Option<&'a crate::device::DeviceInfo>) -> RuleSet<'a> {
    match device {
        Some(dev) => {
            rules.insert("arch", move |cmp, v| compare_version(&dev.arch, cmp, v));
            rules.insert("brand", move |cmp, v| Ok(string_compare(dev.brand.as_str(), cmp, v)));
        }
        None => {
            rules.insert("arch", |_, _| Ok(true));
            rules.insert("brand", |_, _| Ok(true));
        }
    }
    rules
}

fn string_compare(fact: &str, cmp: Comparator, value: &str) -> bool {
    let eq = fact.eq_ignore_ascii_case(value);
    match cmp {
        Comparator::Equal => eq,
        Comparator::NotEqual => !eq,
        _ => false,
    }
}

/// Checks every requirement expression in `reqs` against `info`,
/// attempting per-device evaluation first; if no device is in scope,
/// global evaluation runs once with no device facts. Mirrors the CLI's loop over
/// `ctx->reqs[i]` feeding `dsl_evaluate` once per requirement, gating
/// `nvc_driver_mount`/`nvc_device_mount` on every expression passing.
pub fn check_requirements(reqs: &[String], info: &crate::info::DriverInfo, devices: &[crate::device::DeviceInfo]) -> Result<()> {
    for expr in reqs {
        if devices.is_empty() {
            let rules = with_device_rules(driver_rules(info), None);
            evaluate(expr, &rules)?;
        } else {
            for device in devices {
                let rules = with_device_rules(driver_rules(info), Some(device));
                evaluate(expr, &rules)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_equal_ignores_trailing_zeros() {
        assert!(compare_version("11.2", Comparator::Equal, "11.2.0").unwrap());
    }

    #[test]
    fn version_greater_than() {
        assert!(compare_version("12.0", Comparator::Greater, "11.8").unwrap());
        assert!(!compare_version("11.8", Comparator::Greater, "12.0").unwrap());
    }

    #[test]
    fn or_group_satisfied_if_any_group_passes() {
        let mut rules = RuleSet::new();
        rules.insert("cuda", |cmp, v| compare_version("11.8", cmp, v));
        // First group fails (11.8 < 9.0 is false), second group ("cuda>=11.0") passes.
        assert!(evaluate("cuda<9.0 cuda>=11.0", &rules).is_ok());
    }

    #[test]
    fn and_group_requires_every_atom() {
        let mut rules = RuleSet::new();
        rules.insert("cuda", |cmp, v| compare_version("11.8", cmp, v));
        rules.insert("driver", |cmp, v| compare_version("535.1", cmp, v));
        assert!(evaluate("cuda>=11.0,driver>=999", &rules).is_err());
    }

    #[test]
    fn unknown_rule_name_is_invalid() {
        let rules = RuleSet::new();
        assert!(evaluate("nonexistent=1", &rules).is_err());
    }

    fn string_eq(fact: &'static str) -> impl Fn(Comparator, &str) -> Result<bool> {
        move |cmp, v| {
            let eq = fact.eq_ignore_ascii_case(v);
            Ok(match cmp {
                Comparator::Equal => eq,
                Comparator::NotEqual => !eq,
                _ => false,
            })
        }
    }

    #[test]
    fn failing_atom_message_has_spaced_operator() {
        let mut rules = RuleSet::new();
        rules.insert("driver", |cmp, v| compare_version("395.0", cmp, v));
        rules.insert("cuda", |cmp, v| compare_version("10.0", cmp, v));
        rules.insert("arch", |cmp, v| compare_version("7.0", cmp, v));
        rules.insert("brand", string_eq("GeForce"));

        let expr = "driver>=390 cuda>=10.0,arch=7.0 brand=Tesla";
        let err = evaluate(expr, &rules).unwrap_err();
        assert_eq!(err.message, "unsatisfied condition: brand = Tesla");
    }
}
