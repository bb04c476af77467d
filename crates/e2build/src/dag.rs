//! Operations on the result dependency graph.
//!
//! Depth-first traversal with three-colour marking; children are visited in
//! lexicographic order so every traversal is reproducible. The order
//! produced by [`dsort`] and [`dlist_recursive`] is the order the build
//! pipeline processes results in: dependencies always precede dependents.

use std::collections::BTreeMap;

use crate::model::ResultSpec;
use crate::types::{Error, RefKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Colour {
    White,
    Grey,
    Black,
}

/// Direct dependencies of one result, sorted.
pub fn dlist(results: &BTreeMap<String, ResultSpec>, name: &str) -> Result<Vec<String>, Error> {
    let result = results.get(name).ok_or_else(|| Error::ReferenceNotFound {
        kind: RefKind::Result,
        name: name.to_string(),
        referrer: "dlist".to_string(),
    })?;
    let mut deps = result.depends.clone();
    deps.sort();
    deps.dedup();
    Ok(deps)
}

/// Topological order over the whole graph. Every result appears exactly
/// once; ties break lexicographically.
pub fn dsort(results: &BTreeMap<String, ResultSpec>) -> Result<Vec<String>, Error> {
    let mut colours: BTreeMap<&str, Colour> = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for name in results.keys() {
        visit(name, results, &mut colours, &mut stack, &mut out)?;
    }
    Ok(out)
}

/// Topologically ordered closure reachable from `seeds`.
pub fn dlist_recursive(
    results: &BTreeMap<String, ResultSpec>,
    seeds: &[String],
) -> Result<Vec<String>, Error> {
    let mut colours: BTreeMap<&str, Colour> = BTreeMap::new();
    let mut stack: Vec<String> = Vec::new();
    let mut out: Vec<String> = Vec::new();
    for seed in seeds {
        if !results.contains_key(seed) {
            return Err(Error::ReferenceNotFound {
                kind: RefKind::Result,
                name: seed.clone(),
                referrer: "selection".to_string(),
            });
        }
        visit(seed, results, &mut colours, &mut stack, &mut out)?;
    }
    Ok(out)
}

fn visit<'a>(
    name: &'a str,
    results: &'a BTreeMap<String, ResultSpec>,
    colours: &mut BTreeMap<&'a str, Colour>,
    stack: &mut Vec<String>,
    out: &mut Vec<String>,
) -> Result<(), Error> {
    match colours.get(name).copied().unwrap_or(Colour::White) {
        Colour::Black => return Ok(()),
        Colour::Grey => {
            // Report the cycle from its first grey occurrence back to here.
            let start = stack.iter().position(|n| n == name).unwrap_or(0);
            let mut cycle: Vec<String> = stack[start..].to_vec();
            cycle.push(name.to_string());
            return Err(Error::DependencyCycle { cycle });
        }
        Colour::White => {}
    }

    let result = results.get(name).ok_or_else(|| Error::ReferenceNotFound {
        kind: RefKind::Result,
        name: name.to_string(),
        referrer: stack.last().cloned().unwrap_or_else(|| "graph".to_string()),
    })?;

    colours.insert(name, Colour::Grey);
    stack.push(name.to_string());

    let mut deps: Vec<&str> = result.depends.iter().map(String::as_str).collect();
    deps.sort_unstable();
    deps.dedup();
    for dep in deps {
        visit(dep, results, colours, stack, out)?;
    }

    stack.pop();
    colours.insert(name, Colour::Black);
    out.push(name.to_string());
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    fn result(name: &str, depends: &[&str]) -> (String, ResultSpec) {
        (
            name.to_string(),
            ResultSpec {
                name: name.to_string(),
                sources: Vec::new(),
                depends: depends.iter().map(|d| d.to_string()).collect(),
                chroot_groups: Vec::new(),
                env: crate::env::Environment::new(),
                script: PathBuf::from("build-script"),
                collect_project: None,
            },
        )
    }

    fn graph(entries: &[(&str, &[&str])]) -> BTreeMap<String, ResultSpec> {
        entries.iter().map(|(n, deps)| result(n, deps)).collect()
    }

    #[test]
    fn dsort_orders_dependencies_first() {
        let results = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a", "b"])]);
        assert_eq!(dsort(&results).expect("sort"), vec!["a", "b", "c"]);
    }

    #[test]
    fn dsort_is_a_linear_extension_with_unique_entries() {
        let results = graph(&[
            ("app", &["libs", "toolchain"]),
            ("libs", &["toolchain"]),
            ("toolchain", &[]),
            ("docs", &[]),
        ]);
        let order = dsort(&results).expect("sort");
        assert_eq!(order.len(), results.len());

        for (name, spec) in &results {
            let own = order.iter().position(|n| n == name).expect("present");
            for dep in &spec.depends {
                let dep_pos = order.iter().position(|n| n == dep).expect("dep present");
                assert!(dep_pos < own, "{dep} must precede {name}");
            }
        }
    }

    #[test]
    fn dsort_breaks_ties_lexicographically() {
        let results = graph(&[("zeta", &[]), ("alpha", &[]), ("mid", &[])]);
        assert_eq!(
            dsort(&results).expect("sort"),
            vec!["alpha", "mid", "zeta"]
        );
    }

    #[test]
    fn inserting_a_back_edge_reports_the_cycle() {
        let results = graph(&[("a", &["c"]), ("b", &["a"]), ("c", &["a", "b"])]);
        let err = dsort(&results).expect_err("cycle");
        match err {
            Error::DependencyCycle { cycle } => {
                assert!(cycle.len() >= 3);
                assert_eq!(cycle.first(), cycle.last());
            }
            other => panic!("expected cycle error, got {other}"),
        }
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let results = graph(&[("a", &["a"])]);
        let err = dsort(&results).expect_err("cycle");
        assert!(matches!(err, Error::DependencyCycle { cycle } if cycle == ["a", "a"]));
    }

    #[test]
    fn dlist_returns_sorted_direct_dependencies() {
        let results = graph(&[("a", &[]), ("b", &[]), ("c", &["b", "a"])]);
        assert_eq!(dlist(&results, "c").expect("dlist"), vec!["a", "b"]);
        assert!(dlist(&results, "a").expect("dlist").is_empty());
    }

    #[test]
    fn dlist_rejects_unknown_results() {
        let results = graph(&[("a", &[])]);
        assert!(matches!(
            dlist(&results, "ghost"),
            Err(Error::ReferenceNotFound { .. })
        ));
    }

    #[test]
    fn dlist_recursive_returns_the_ordered_closure() {
        let results = graph(&[
            ("app", &["libs"]),
            ("libs", &["toolchain"]),
            ("toolchain", &[]),
            ("unrelated", &[]),
        ]);
        let order = dlist_recursive(&results, &["app".to_string()]).expect("closure");
        assert_eq!(order, vec!["toolchain", "libs", "app"]);
    }

    #[test]
    fn dlist_recursive_merges_overlapping_seed_closures() {
        let results = graph(&[("a", &[]), ("b", &["a"]), ("c", &["a"])]);
        let order =
            dlist_recursive(&results, &["b".to_string(), "c".to_string()]).expect("closure");
        assert_eq!(order, vec!["a", "b", "c"]);
    }

    #[test]
    fn dlist_recursive_rejects_unknown_seeds() {
        let results = graph(&[("a", &[])]);
        assert!(matches!(
            dlist_recursive(&results, &["ghost".to_string()]),
            Err(Error::ReferenceNotFound { .. })
        ));
    }

    #[test]
    fn reference_to_missing_dependency_is_reported() {
        let results = graph(&[("a", &["ghost"])]);
        let err = dsort(&results).expect_err("must fail");
        assert!(matches!(
            err,
            Error::ReferenceNotFound { ref name, .. } if name == "ghost"
        ));
    }
}
