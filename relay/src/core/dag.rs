//! Stage-graph validation.
//!
//! Stages run in declared order; the graph is only checked so that a bad
//! configuration is rejected before any session starts.

use std::collections::HashMap;

use crate::error::RelayError;

/// Borrowed view of a stage for validation.
#[derive(Debug, Clone, Copy)]
pub struct StageNode<'a> {
    pub name: &'a str,
    pub depends_on: &'a [String],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Visited,
}

/// Reject duplicate names, dependencies on unknown stages, and cycles.
pub fn validate_graph(stages: &[StageNode<'_>]) -> Result<(), RelayError> {
    let mut by_name: HashMap<&str, &StageNode<'_>> = HashMap::new();
    for stage in stages {
        if by_name.insert(stage.name, stage).is_some() {
            return Err(RelayError::DuplicateStage(stage.name.to_string()));
        }
    }

    for stage in stages {
        for dep in stage.depends_on {
            if !by_name.contains_key(dep.as_str()) {
                return Err(RelayError::UnknownDependency {
                    stage: stage.name.to_string(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    let mut marks: HashMap<&str, Mark> = HashMap::new();
    for stage in stages {
        let mut path = Vec::new();
        visit(stage.name, &by_name, &mut marks, &mut path)?;
    }
    Ok(())
}

fn visit<'a>(
    name: &'a str,
    by_name: &HashMap<&'a str, &StageNode<'a>>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
) -> Result<(), RelayError> {
    match marks.get(name) {
        Some(Mark::Visited) => return Ok(()),
        Some(Mark::Visiting) => {
            let start = path.iter().position(|n| *n == name).unwrap_or(0);
            let mut cycle: Vec<String> = path[start..].iter().map(|n| n.to_string()).collect();
            cycle.push(name.to_string());
            return Err(RelayError::CircularDependency { cycle });
        }
        None => {}
    }

    marks.insert(name, Mark::Visiting);
    path.push(name);
    if let Some(stage) = by_name.get(name) {
        for dep in stage.depends_on {
            visit(dep.as_str(), by_name, marks, path)?;
        }
    }
    path.pop();
    marks.insert(name, Mark::Visited);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deps(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn accepts_a_chain() {
        let a = deps(&[]);
        let b = deps(&["a"]);
        let c = deps(&["a", "b"]);
        let stages = [
            StageNode { name: "a", depends_on: &a },
            StageNode { name: "b", depends_on: &b },
            StageNode { name: "c", depends_on: &c },
        ];
        validate_graph(&stages).expect("valid");
    }

    #[test]
    fn rejects_two_stage_cycle() {
        let a = deps(&["b"]);
        let b = deps(&["a"]);
        let stages = [
            StageNode { name: "a", depends_on: &a },
            StageNode { name: "b", depends_on: &b },
        ];
        let err = validate_graph(&stages).unwrap_err();
        match err {
            RelayError::CircularDependency { cycle } => {
                assert_eq!(cycle, vec!["a", "b", "a"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_self_dependency() {
        let a = deps(&["a"]);
        let stages = [StageNode { name: "a", depends_on: &a }];
        assert!(matches!(
            validate_graph(&stages),
            Err(RelayError::CircularDependency { .. })
        ));
    }

    #[test]
    fn rejects_unknown_dependency() {
        let a = deps(&["ghost"]);
        let stages = [StageNode { name: "a", depends_on: &a }];
        let err = validate_graph(&stages).unwrap_err();
        assert!(matches!(
            err,
            RelayError::UnknownDependency { ref dependency, .. } if dependency == "ghost"
        ));
    }

    #[test]
    fn rejects_duplicate_names() {
        let none = deps(&[]);
        let stages = [
            StageNode { name: "a", depends_on: &none },
            StageNode { name: "a", depends_on: &none },
        ];
        assert!(matches!(
            validate_graph(&stages),
            Err(RelayError::DuplicateStage(_))
        ));
    }
}
