//! Dependency-aware installation planner.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::catalog::Catalog;

/// A single caller-supplied plan entry: either a bare service name or a
/// name with per-install environment overrides.
///
/// `WithEnv` must be tried first: untagged deserialization takes the first
/// variant that matches, and `Bare`'s `Value` is a catch-all that would
/// otherwise also match the object form, so the object shape would never
/// be reached.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InstallRequestEntry {
    WithEnv {
        name: Value,
        #[serde(default)]
        env: HashMap<String, Value>,
    },
    Bare(Value),
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidEntry {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct PlannedInstall {
    /// Topologically sorted service names, required services seeded first.
    pub order: Vec<String>,
    /// Normalized env overrides per service name.
    pub overrides: HashMap<String, HashMap<String, String>>,
    pub invalid: Vec<InvalidEntry>,
}

#[derive(Debug, Error)]
pub enum PlanError {
    #[error("circular dependency detected: {0}")]
    Cycle(String),
}

/// Normalizes a JSON scalar (string/number/bool) name value into a
/// trimmed, non-empty `String`, or `None` if it isn't a usable name.
fn normalize_name(value: &Value) -> Option<String> {
    let raw = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };

    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        Value::Array(_) | Value::Object(_) => None,
    }
}

pub struct InstallationPlanner;

impl InstallationPlanner {
    /// Expands, validates, deduplicates, and topologically sorts a batch of
    /// install request entries against the catalog's dependency graph.
    pub fn plan(
        catalog: &Catalog,
        entries: &[InstallRequestEntry],
    ) -> Result<PlannedInstall, PlanError> {
        let mut order: Vec<String> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut overrides: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut invalid = Vec::new();

        for name in catalog.required() {
            if seen.insert(name.clone()) {
                order.push(name.clone());
            }
        }

        for entry in entries {
            match entry {
                InstallRequestEntry::Bare(value) => match normalize_name(value) {
                    Some(name) => {
                        if seen.insert(name.clone()) {
                            order.push(name.clone());
                        }
                        overrides.entry(name).or_default();
                    }
                    None => invalid.push(InvalidEntry {
                        name: format!("{value:?}"),
                        reason: "entry name must be a non-empty string".to_owned(),
                    }),
                },
                InstallRequestEntry::WithEnv { name, env } => {
                    let Some(name) = normalize_name(name) else {
                        invalid.push(InvalidEntry {
                            name: format!("{name:?}"),
                            reason: "entry name must be a non-empty string".to_owned(),
                        });
                        continue;
                    };

                    let mut normalized_env = HashMap::new();
                    let mut bad_env = false;
                    for (k, v) in env {
                        match scalar_to_string(v) {
                            Some(s) => {
                                normalized_env.insert(k.clone(), s);
                            }
                            None => {
                                bad_env = true;
                                break;
                            }
                        }
                    }

                    if bad_env {
                        invalid.push(InvalidEntry {
                            name,
                            reason: "env overrides must be a flat mapping of string to scalar"
                                .to_owned(),
                        });
                        continue;
                    }

                    if seen.insert(name.clone()) {
                        order.push(name.clone());
                    }

                    let merged = overrides.entry(name).or_default();
                    for (k, v) in normalized_env {
                        merged.insert(k, v);
                    }
                }
            }
        }

        let sorted = topological_sort(catalog, &order)?;

        Ok(PlannedInstall {
            order: sorted,
            overrides,
            invalid,
        })
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum VisitState {
    Visiting,
    Visited,
}

/// DFS-based topological sort restricted to `universe`, with cycle
/// detection that reports the offending chain.
fn topological_sort(catalog: &Catalog, universe: &[String]) -> Result<Vec<String>, PlanError> {
    let universe_set: HashSet<&str> = universe.iter().map(String::as_str).collect();
    let mut state: HashMap<&str, VisitState> = HashMap::new();
    let mut output: Vec<String> = Vec::with_capacity(universe.len());

    fn visit<'a>(
        name: &'a str,
        catalog: &'a Catalog,
        universe_set: &HashSet<&'a str>,
        state: &mut HashMap<&'a str, VisitState>,
        stack: &mut Vec<&'a str>,
        output: &mut Vec<String>,
    ) -> Result<(), PlanError> {
        match state.get(name) {
            Some(VisitState::Visited) => return Ok(()),
            Some(VisitState::Visiting) => {
                let mut chain: Vec<&str> = stack
                    .iter()
                    .skip_while(|n| **n != name)
                    .copied()
                    .collect();
                chain.push(name);
                return Err(PlanError::Cycle(chain.join(" -> ")));
            }
            None => {}
        }

        state.insert(name, VisitState::Visiting);
        stack.push(name);

        if let Some(descriptor) = catalog.get(name) {
            let mut deps: Vec<&str> = descriptor
                .dependencies
                .iter()
                .map(String::as_str)
                .filter(|d| universe_set.contains(d))
                .collect();
            deps.sort_unstable();

            for dep in deps {
                visit(dep, catalog, universe_set, state, stack, output)?;
            }
        }

        stack.pop();
        state.insert(name, VisitState::Visited);
        output.push(name.to_owned());

        Ok(())
    }

    let mut stack = Vec::new();
    for name in universe {
        visit(
            name.as_str(),
            catalog,
            &universe_set,
            &mut state,
            &mut stack,
            &mut output,
        )?;
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{EnvVarConfig, ServiceCategory, ServiceDescriptor};
    use std::collections::HashMap as StdHashMap;

    fn descriptor(name: &str, deps: &[&str]) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_owned(),
            category: ServiceCategory::Addon,
            image: format!("{name}:latest"),
            port: None,
            host_service_url_override: None,
            health_url: None,
            env_template: vec![],
            volumes: vec![],
            env_config: Vec::<EnvVarConfig>::new(),
            dependencies: deps.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn test_catalog(required: Vec<&str>, descriptors: Vec<ServiceDescriptor>) -> Catalog {
        // Reuse Catalog's public shape via its loader is not possible since
        // fields are private; tests build through a parallel constructor.
        Catalog::from_parts(
            descriptors,
            required.into_iter().map(str::to_owned).collect(),
            StdHashMap::new(),
        )
    }

    #[test]
    fn required_injection_example() {
        let catalog = test_catalog(
            vec!["noona-mongo", "noona-redis", "noona-vault"],
            vec![
                descriptor("noona-mongo", &[]),
                descriptor("noona-redis", &[]),
                descriptor("noona-vault", &["noona-mongo", "noona-redis"]),
                descriptor("noona-portal", &["noona-vault"]),
            ],
        );

        let entries = vec![InstallRequestEntry::Bare(Value::String(
            "noona-portal".to_owned(),
        ))];

        let plan = InstallationPlanner::plan(&catalog, &entries).unwrap();
        assert_eq!(
            plan.order,
            vec!["noona-mongo", "noona-redis", "noona-vault", "noona-portal"]
        );
    }

    #[test]
    fn empty_request_installs_only_required_in_dependency_order() {
        let catalog = test_catalog(
            vec!["noona-mongo", "noona-redis", "noona-vault"],
            vec![
                descriptor("noona-vault", &["noona-mongo", "noona-redis"]),
                descriptor("noona-mongo", &[]),
                descriptor("noona-redis", &[]),
            ],
        );

        let plan = InstallationPlanner::plan(&catalog, &[]).unwrap();
        assert_eq!(
            plan.order,
            vec!["noona-mongo", "noona-redis", "noona-vault"]
        );
    }

    #[test]
    fn circular_dependency_is_rejected() {
        let catalog = test_catalog(
            vec![],
            vec![descriptor("x", &["y"]), descriptor("y", &["x"])],
        );

        let entries = vec![InstallRequestEntry::Bare(Value::String("x".to_owned()))];
        let err = InstallationPlanner::plan(&catalog, &entries).unwrap_err();
        match err {
            PlanError::Cycle(chain) => assert!(chain.contains("x -> y -> x")),
        }
    }

    #[test]
    fn unknown_name_is_not_rejected_by_the_planner() {
        let catalog = test_catalog(vec![], vec![]);
        let entries = vec![InstallRequestEntry::Bare(Value::String(
            "does-not-exist".to_owned(),
        ))];
        let plan = InstallationPlanner::plan(&catalog, &entries).unwrap();
        assert_eq!(plan.order, vec!["does-not-exist"]);
        assert!(plan.invalid.is_empty());
    }

    #[test]
    fn env_override_merges_later_entries_on_top() {
        let catalog = test_catalog(vec![], vec![descriptor("svc", &[])]);

        let mut env1 = StdHashMap::new();
        env1.insert("B".to_owned(), Value::String("2".to_owned()));

        let mut env2 = StdHashMap::new();
        env2.insert("B".to_owned(), Value::String("9".to_owned()));
        env2.insert("C".to_owned(), Value::String("3".to_owned()));

        let entries = vec![
            InstallRequestEntry::WithEnv {
                name: Value::String("svc".to_owned()),
                env: env1,
            },
            InstallRequestEntry::WithEnv {
                name: Value::String("svc".to_owned()),
                env: env2,
            },
        ];

        let plan = InstallationPlanner::plan(&catalog, &entries).unwrap();
        let merged = &plan.overrides["svc"];
        assert_eq!(merged.get("B").unwrap(), "9");
        assert_eq!(merged.get("C").unwrap(), "3");
    }

    #[test]
    fn invalid_entry_does_not_block_other_entries() {
        let catalog = test_catalog(vec![], vec![descriptor("good", &[])]);

        let entries = vec![
            InstallRequestEntry::Bare(Value::String("good".to_owned())),
            InstallRequestEntry::Bare(Value::String(String::new())),
        ];

        let plan = InstallationPlanner::plan(&catalog, &entries).unwrap();
        assert_eq!(plan.order, vec!["good"]);
        assert_eq!(plan.invalid.len(), 1);
    }
}
