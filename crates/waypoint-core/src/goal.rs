use serde::{Deserialize, Serialize};

/// What a workflow is trying to achieve. Immutable per workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Goal {
    /// Stable identifier; runs are indexed by it.
    pub id: String,
    /// Short human-readable name.
    pub name: String,
    /// Longer statement of the intended result.
    #[serde(default)]
    pub description: String,
    /// Weighted criteria that determine success.
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Limits the run must respect (cost, scope, safety and the like).
    #[serde(default)]
    pub constraints: Vec<Constraint>,
    /// Minimum weighted score to pass (0.0 to 1.0). Default: 0.9.
    #[serde(default = "default_threshold")]
    pub success_threshold: f64,
}

fn default_threshold() -> f64 {
    0.9
}

/// One weighted check against a run's final output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessCriterion {
    /// Unique within the goal.
    pub id: String,
    /// How the output is checked.
    pub criterion_type: CriterionType,
    /// Relative weight; scores are normalized over the evaluated criteria.
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub description: String,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionType {
    /// Substring match, case-insensitive unless `case_sensitive`.
    OutputContains {
        pattern: String,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Whole-output match after trimming whitespace.
    OutputEquals { expected: String },
    /// Evaluated by an external collaborator; skipped here.
    Custom { name: String },
}

/// A limit on how a run may reach its goal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Constraint {
    pub id: String,
    /// Hard constraints fail the evaluation when violated; soft ones are advisory.
    pub kind: ConstraintKind,
    pub description: String,
    /// Threshold or parameter, interpreted by whoever checks the constraint.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    Hard,
    Soft,
}

/// Outcome of one criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    /// Criterion this result belongs to.
    pub criterion_id: String,
    /// 0.0 to 1.0.
    pub score: f64,
    pub passed: bool,
    /// Why it passed or failed, for the run record.
    pub reasoning: String,
}

/// A constraint found broken during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintViolation {
    /// Constraint that was broken.
    pub constraint_id: String,
    /// Copied from the constraint, so a hard violation is visible on its own.
    pub kind: ConstraintKind,
    pub detail: String,
}

/// Advisory evaluation attached to a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoalEvaluation {
    /// Weighted mean of the criterion scores (0.0 to 1.0).
    pub overall_score: f64,
    /// Score reached the threshold and no hard constraint was violated.
    pub passed: bool,
    /// One entry per criterion that could be evaluated.
    pub criteria_results: Vec<CriterionResult>,
    /// Empty when every constraint held.
    #[serde(default)]
    pub constraint_violations: Vec<ConstraintViolation>,
}

impl Goal {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            success_criteria: vec![],
            constraints: vec![],
            success_threshold: default_threshold(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_criterion(mut self, criterion: SuccessCriterion) -> Self {
        self.success_criteria.push(criterion);
        self
    }

    pub fn with_constraint(mut self, constraint: Constraint) -> Self {
        self.constraints.push(constraint);
        self
    }

    /// Score the criteria that need no external judge.
    pub fn evaluate_deterministic(&self, output: &str) -> Vec<CriterionResult> {
        self.success_criteria
            .iter()
            .filter_map(|c| {
                let (passed, reasoning) = match &c.criterion_type {
                    CriterionType::OutputContains {
                        pattern,
                        case_sensitive,
                    } => {
                        let found = if *case_sensitive {
                            output.contains(pattern.as_str())
                        } else {
                            output.to_lowercase().contains(&pattern.to_lowercase())
                        };
                        let verb = if found { "contains" } else { "does not contain" };
                        (found, format!("Output {} '{}'", verb, pattern))
                    }
                    CriterionType::OutputEquals { expected } => {
                        let eq = output.trim() == expected.trim();
                        let verb = if eq { "matches" } else { "does not match" };
                        (eq, format!("Output {} expected value", verb))
                    }
                    CriterionType::Custom { .. } => return None,
                };
                Some(CriterionResult {
                    criterion_id: c.id.clone(),
                    score: if passed { 1.0 } else { 0.0 },
                    passed,
                    reasoning,
                })
            })
            .collect()
    }

    /// Weighted score over the evaluated criteria; a hard violation always fails.
    pub fn compute_evaluation(
        &self,
        criteria_results: Vec<CriterionResult>,
        constraint_violations: Vec<ConstraintViolation>,
    ) -> GoalEvaluation {
        let weight_of = |id: &str| {
            self.success_criteria
                .iter()
                .find(|c| c.id == id)
                .map(|c| c.weight)
        };

        let mut total_weight = 0.0;
        let mut weighted = 0.0;
        for r in &criteria_results {
            if let Some(w) = weight_of(&r.criterion_id) {
                total_weight += w;
                weighted += r.score * w;
            }
        }
        let overall_score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        let hard_violation = constraint_violations
            .iter()
            .any(|v| v.kind == ConstraintKind::Hard);

        GoalEvaluation {
            overall_score,
            passed: !hard_violation && overall_score >= self.success_threshold,
            criteria_results,
            constraint_violations,
        }
    }

    pub fn evaluate(&self, output: &str) -> GoalEvaluation {
        self.compute_evaluation(self.evaluate_deterministic(output), vec![])
    }
}

impl SuccessCriterion {
    pub fn contains(id: impl Into<String>, pattern: impl Into<String>, weight: f64) -> Self {
        let pattern = pattern.into();
        Self {
            id: id.into(),
            description: format!("output contains '{}'", pattern),
            criterion_type: CriterionType::OutputContains {
                pattern,
                case_sensitive: false,
            },
            weight,
        }
    }

    pub fn equals(id: impl Into<String>, expected: impl Into<String>, weight: f64) -> Self {
        let expected = expected.into();
        Self {
            id: id.into(),
            description: format!("output equals '{}'", expected),
            criterion_type: CriterionType::OutputEquals { expected },
            weight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weighted_score() {
        let mut goal = Goal::new("g1", "greet")
            .with_criterion(SuccessCriterion::contains("c1", "hello", 2.0))
            .with_criterion(SuccessCriterion::contains("c2", "world", 1.0));
        goal.success_threshold = 0.6;

        let eval = goal.evaluate("hello there");
        // (2*1 + 1*0) / 3
        assert!((eval.overall_score - 0.667).abs() < 0.01);
        assert!(eval.passed);
    }

    #[test]
    fn hard_violation_overrides_score() {
        let goal = Goal::new("g1", "x").with_criterion(SuccessCriterion::equals("c1", "ok", 1.0));
        let results = goal.evaluate_deterministic(" ok ");
        assert!(results[0].passed);

        let eval = goal.compute_evaluation(
            results,
            vec![ConstraintViolation {
                constraint_id: "budget".into(),
                kind: ConstraintKind::Hard,
                detail: "exceeded".into(),
            }],
        );
        assert!(!eval.passed);
    }

    #[test]
    fn custom_criteria_are_skipped() {
        let goal = Goal::new("g1", "x")
            .with_criterion(SuccessCriterion::contains("c1", "DONE", 1.0))
            .with_criterion(SuccessCriterion {
                id: "c2".into(),
                criterion_type: CriterionType::Custom {
                    name: "human_review".into(),
                },
                weight: 5.0,
                description: String::new(),
            });
        let results = goal.evaluate_deterministic("all done");
        assert_eq!(results.len(), 1);
        assert!(goal.compute_evaluation(results, vec![]).passed);
    }

    #[test]
    fn empty_criteria_never_pass() {
        let eval = Goal::new("g", "empty").evaluate("anything");
        assert_eq!(eval.overall_score, 0.0);
        assert!(!eval.passed);
    }

    #[test]
    fn deserializes_with_defaults() {
        let goal: Goal = serde_json::from_str(
            r#"{"id":"g","name":"n","success_criteria":[
                {"id":"c","criterion_type":{"type":"output_contains","pattern":"x"}}]}"#,
        )
        .unwrap();
        assert!((goal.success_threshold - 0.9).abs() < f64::EPSILON);
        assert!((goal.success_criteria[0].weight - 1.0).abs() < f64::EPSILON);
    }
}
