//! Result aggregation
//!
//! The aggregator is generic over a `CombinationRule` resolved from the
//! plugin's manifest at launch. Round results are put into node-id order
//! before the rule sees them, so a rule that is deterministic over an ordered
//! map yields the same state whatever order the results arrived in.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;

use flame_core::{FlameError, FlameResult, ImageRef, NodeId, Payload, RoundNumber};

/// Output of one combination step
#[derive(Clone, Debug, PartialEq)]
pub struct Combined {
    /// Next round's input, or the final result when `done`
    pub next_state: Payload,
    pub done: bool,
}

/// Plugin-defined combination of per-node round outputs
pub trait CombinationRule: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn combine(
        &self,
        previous: &Payload,
        results: &BTreeMap<NodeId, Payload>,
        round: RoundNumber,
    ) -> FlameResult<Combined>;
}

/// Generic result aggregator
#[derive(Clone)]
pub struct Aggregator {
    rule: Arc<dyn CombinationRule>,
    offload: bool,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("rule", &self.rule.name())
            .field("offload", &self.offload)
            .finish()
    }
}

impl Aggregator {
    pub fn new(rule: Arc<dyn CombinationRule>) -> Self {
        Aggregator {
            rule,
            offload: false,
        }
    }

    /// Run combination on the blocking pool instead of the coordinator task
    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }

    pub fn rule_name(&self) -> &str {
        self.rule.name()
    }

    /// Combine round results, in whatever order they were collected
    pub fn combine(
        &self,
        previous: &Payload,
        results: impl IntoIterator<Item = (NodeId, Payload)>,
        round: RoundNumber,
    ) -> FlameResult<Combined> {
        let canonical: BTreeMap<NodeId, Payload> = results.into_iter().collect();
        self.rule.combine(previous, &canonical, round)
    }

    /// Combine from async context, offloading when configured
    pub async fn combine_async(
        &self,
        previous: Payload,
        results: BTreeMap<NodeId, Payload>,
        round: RoundNumber,
    ) -> FlameResult<Combined> {
        if !self.offload {
            return self.rule.combine(&previous, &results, round);
        }
        let rule = Arc::clone(&self.rule);
        tokio::task::spawn_blocking(move || rule.combine(&previous, &results, round))
            .await
            .map_err(|e| FlameError::Aggregation(format!("combination task failed: {e}")))?
    }
}

// ============================================================================
// BUILT-IN RULES
// ============================================================================

/// Weighted mean of `{ "value": number | [number], "weight": number }` outputs.
///
/// Done after `rounds` rounds, or earlier once every component moved by at
/// most `tolerance` since the previous state.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedAverage {
    pub rounds: RoundNumber,
    pub tolerance: Option<f64>,
}

impl WeightedAverage {
    fn read_value(node: &NodeId, output: &Payload) -> FlameResult<(Vec<f64>, f64)> {
        let bad = |why: &str| FlameError::Aggregation(format!("output of {node}: {why}"));
        let weight = output
            .get("weight")
            .and_then(Payload::as_f64)
            .ok_or_else(|| bad("missing numeric weight"))?;
        if !weight.is_finite() || weight < 0.0 {
            return Err(bad("weight must be a non-negative number"));
        }
        let value = match output.get("value") {
            Some(Payload::Array(items)) => items
                .iter()
                .map(|v| v.as_f64().ok_or_else(|| bad("non-numeric value component")))
                .collect::<FlameResult<Vec<f64>>>()?,
            Some(v) => vec![v.as_f64().ok_or_else(|| bad("non-numeric value"))?],
            None => return Err(bad("missing value")),
        };
        Ok((value, weight))
    }
}

impl CombinationRule for WeightedAverage {
    fn name(&self) -> &str {
        "weighted_average"
    }

    fn combine(
        &self,
        previous: &Payload,
        results: &BTreeMap<NodeId, Payload>,
        round: RoundNumber,
    ) -> FlameResult<Combined> {
        let mut sums: Option<Vec<f64>> = None;
        let mut total_weight = 0.0;
        let mut scalar = true;
        for (node, output) in results {
            let (value, weight) = Self::read_value(node, output)?;
            scalar &= !matches!(output.get("value"), Some(Payload::Array(_)));
            let sums = sums.get_or_insert_with(|| vec![0.0; value.len()]);
            if sums.len() != value.len() {
                return Err(FlameError::Aggregation(format!(
                    "output of {node} has {} components, expected {}",
                    value.len(),
                    sums.len()
                )));
            }
            for (sum, v) in sums.iter_mut().zip(&value) {
                *sum += v * weight;
            }
            total_weight += weight;
        }

        let sums = sums.ok_or_else(|| FlameError::Aggregation("no results to combine".into()))?;
        if total_weight <= 0.0 {
            return Err(FlameError::Aggregation("total weight is zero".into()));
        }
        let mean: Vec<f64> = sums.iter().map(|s| s / total_weight).collect();

        // Round 0 compares against the launch parameters, not an earlier estimate
        let converged = round > 0 && self.tolerance.map_or(false, |tolerance| {
            let prev = match previous.get("value") {
                Some(Payload::Array(items)) => items.iter().map(Payload::as_f64).collect(),
                Some(v) => v.as_f64().map(|x| vec![x]),
                None => None,
            };
            matches!(prev, Some(prev) if prev.len() == mean.len()
                && prev.iter().zip(&mean).all(|(p, m)| (p - m).abs() <= tolerance))
        });

        let value = if scalar && mean.len() == 1 {
            json!(mean[0])
        } else {
            json!(mean)
        };
        Ok(Combined {
            next_state: json!({ "value": value, "weight": total_weight, "round": round }),
            done: converged || round + 1 >= self.rounds,
        })
    }
}

/// Node-ordered list of outputs; done after `rounds` rounds
#[derive(Clone, Debug, PartialEq)]
pub struct Concatenate {
    pub rounds: RoundNumber,
}

impl CombinationRule for Concatenate {
    fn name(&self) -> &str {
        "concatenate"
    }

    fn combine(
        &self,
        _previous: &Payload,
        results: &BTreeMap<NodeId, Payload>,
        round: RoundNumber,
    ) -> FlameResult<Combined> {
        let outputs: Vec<Payload> = results
            .iter()
            .map(|(node, output)| json!({ "node": node, "output": output }))
            .collect();
        Ok(Combined {
            next_state: json!({ "outputs": outputs, "round": round }),
            done: round + 1 >= self.rounds,
        })
    }
}

/// Most frequent output; ties go to the smallest canonical JSON. Always done.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MajorityVote;

impl CombinationRule for MajorityVote {
    fn name(&self) -> &str {
        "majority_vote"
    }

    fn combine(
        &self,
        _previous: &Payload,
        results: &BTreeMap<NodeId, Payload>,
        _round: RoundNumber,
    ) -> FlameResult<Combined> {
        let mut tally: BTreeMap<String, (usize, &Payload)> = BTreeMap::new();
        for output in results.values() {
            let entry = tally.entry(output.to_string()).or_insert((0, output));
            entry.0 += 1;
        }
        // BTreeMap iterates keys ascending; strict `>` keeps the smallest on ties.
        let mut winner: Option<(usize, &Payload)> = None;
        for (count, output) in tally.values() {
            if winner.map_or(true, |(best, _)| *count > best) {
                winner = Some((*count, *output));
            }
        }
        let (votes, output) =
            winner.ok_or_else(|| FlameError::Aggregation("no results to vote on".into()))?;
        Ok(Combined {
            next_state: json!({ "winner": output, "votes": votes, "voters": results.len() }),
            done: true,
        })
    }
}

// ============================================================================
// CATALOG
// ============================================================================

/// Builds a rule from manifest options and the run's computation parameters
pub type RuleFactory =
    Arc<dyn Fn(&Payload, &Payload) -> FlameResult<Arc<dyn CombinationRule>> + Send + Sync>;

/// What a computation plugin declares about its aggregation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginManifest {
    /// Rule id, e.g. `weighted_average`
    pub rule: String,
    #[serde(default)]
    pub options: Payload,
    /// Run the rule on the blocking pool
    #[serde(default)]
    pub offload: bool,
}

impl PluginManifest {
    pub fn new(rule: impl Into<String>) -> Self {
        PluginManifest {
            rule: rule.into(),
            options: Payload::Null,
            offload: false,
        }
    }

    pub fn with_options(mut self, options: Payload) -> Self {
        self.options = options;
        self
    }

    pub fn with_offload(mut self, offload: bool) -> Self {
        self.offload = offload;
        self
    }
}

/// Plugin manifests by image repository, and the rules they can name
#[derive(Clone)]
pub struct RuleCatalog {
    manifests: HashMap<String, PluginManifest>,
    factories: HashMap<String, RuleFactory>,
}

impl Default for RuleCatalog {
    fn default() -> Self {
        RuleCatalog::new()
    }
}

/// Run setting: computation parameters override manifest options
fn setting<'a>(options: &'a Payload, parameters: &'a Payload, key: &str) -> Option<&'a Payload> {
    parameters.get(key).or_else(|| options.get(key))
}

fn rounds_setting(options: &Payload, parameters: &Payload) -> FlameResult<RoundNumber> {
    match setting(options, parameters, "rounds") {
        None => Ok(1),
        Some(v) => match v.as_u64() {
            Some(n) if n >= 1 => Ok(n),
            _ => Err(FlameError::Validation(format!("rounds must be a positive integer, got {v}"))),
        },
    }
}

impl RuleCatalog {
    /// Catalog with the built-in rules and no plugins
    pub fn new() -> Self {
        let mut catalog = RuleCatalog {
            manifests: HashMap::new(),
            factories: HashMap::new(),
        };
        catalog.register_rule("weighted_average", |options, parameters| {
            let tolerance = match setting(options, parameters, "tolerance") {
                None => None,
                Some(v) => Some(v.as_f64().ok_or_else(|| {
                    FlameError::Validation(format!("tolerance must be a number, got {v}"))
                })?),
            };
            Ok(Arc::new(WeightedAverage {
                rounds: rounds_setting(options, parameters)?,
                tolerance,
            }))
        });
        catalog.register_rule("concatenate", |options, parameters| {
            Ok(Arc::new(Concatenate {
                rounds: rounds_setting(options, parameters)?,
            }))
        });
        catalog.register_rule("majority_vote", |_, _| Ok(Arc::new(MajorityVote)));
        catalog
    }

    pub fn register_rule<F>(&mut self, id: impl Into<String>, factory: F)
    where
        F: Fn(&Payload, &Payload) -> FlameResult<Arc<dyn CombinationRule>> + Send + Sync + 'static,
    {
        self.factories.insert(id.into(), Arc::new(factory));
    }

    /// Declare the manifest of a plugin image repository
    pub fn register_plugin(&mut self, repository: impl Into<String>, manifest: PluginManifest) {
        self.manifests.insert(repository.into(), manifest);
    }

    pub fn with_plugin(mut self, repository: impl Into<String>, manifest: PluginManifest) -> Self {
        self.register_plugin(repository, manifest);
        self
    }

    /// Manifest for an image: full repository first, then its final component
    pub fn manifest(&self, image: &ImageRef) -> Option<&PluginManifest> {
        self.manifests
            .get(image.repository())
            .or_else(|| self.manifests.get(image.name()))
    }

    /// Resolve the aggregator a run of `image` will use
    pub fn resolve(&self, image: &ImageRef, parameters: &Payload) -> FlameResult<Aggregator> {
        let manifest = self
            .manifest(image)
            .ok_or_else(|| FlameError::Validation(format!("no plugin manifest for {image}")))?;
        let factory = self.factories.get(&manifest.rule).ok_or_else(|| {
            FlameError::Validation(format!("{image} names unknown rule {:?}", manifest.rule))
        })?;
        let rule = factory(&manifest.options, parameters)?;
        Ok(Aggregator::new(rule).with_offload(manifest.offload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(id: &str) -> NodeId {
        NodeId::new(id)
    }

    fn weighted(rounds: RoundNumber, tolerance: Option<f64>) -> Aggregator {
        Aggregator::new(Arc::new(WeightedAverage { rounds, tolerance }))
    }

    #[test]
    fn test_weighted_average() {
        let results = vec![
            (node("a"), json!({"value": 1.0, "weight": 1})),
            (node("b"), json!({"value": 4.0, "weight": 2})),
        ];
        let combined = weighted(1, None).combine(&json!({}), results, 0).unwrap();
        assert!(combined.done);
        assert_eq!(combined.next_state["value"], json!(3.0));
        assert_eq!(combined.next_state["weight"], json!(3.0));
    }

    #[test]
    fn test_weighted_average_vectors_and_convergence() {
        let agg = weighted(10, Some(0.01));
        let results = vec![
            (node("a"), json!({"value": [1.0, 2.0], "weight": 1})),
            (node("b"), json!({"value": [3.0, 4.0], "weight": 1})),
        ];
        let first = agg.combine(&json!({}), results.clone(), 0).unwrap();
        assert!(!first.done);
        assert_eq!(first.next_state["value"], json!([2.0, 3.0]));

        let second = agg.combine(&first.next_state, results, 1).unwrap();
        assert!(second.done);
    }

    #[test]
    fn test_first_round_never_converges_on_parameters() {
        let agg = weighted(5, Some(0.5));
        let parameters = json!({"value": 2.0, "rounds": 5});
        let results = vec![
            (node("a"), json!({"value": 1.0, "weight": 1})),
            (node("b"), json!({"value": 3.0, "weight": 1})),
        ];
        let first = agg.combine(&parameters, results.clone(), 0).unwrap();
        assert!(!first.done);
        assert_eq!(first.next_state["value"], json!(2.0));

        let second = agg.combine(&first.next_state, results, 1).unwrap();
        assert!(second.done);
    }

    #[test]
    fn test_weighted_average_rejects_bad_outputs() {
        let agg = weighted(1, None);
        assert!(agg.combine(&json!({}), Vec::new(), 0).is_err());
        let missing = vec![(node("a"), json!({"value": 1}))];
        assert!(agg.combine(&json!({}), missing, 0).is_err());
        let mixed = vec![
            (node("a"), json!({"value": [1, 2], "weight": 1})),
            (node("b"), json!({"value": [1], "weight": 1})),
        ];
        let err = agg.combine(&json!({}), mixed, 0).unwrap_err();
        assert_eq!(err.code(), "AGGREGATION");
    }

    #[test]
    fn test_concatenate_is_node_ordered() {
        let agg = Aggregator::new(Arc::new(Concatenate { rounds: 2 }));
        let results = vec![(node("b"), json!(2)), (node("a"), json!(1))];
        let combined = agg.combine(&json!(null), results, 0).unwrap();
        assert!(!combined.done);
        assert_eq!(
            combined.next_state["outputs"],
            json!([{"node": "a", "output": 1}, {"node": "b", "output": 2}])
        );
    }

    #[test]
    fn test_majority_vote_tie_break() {
        let agg = Aggregator::new(Arc::new(MajorityVote));
        let results = vec![
            (node("a"), json!("yes")),
            (node("b"), json!("no")),
            (node("c"), json!("yes")),
        ];
        assert_eq!(agg.combine(&json!(null), results, 0).unwrap().next_state["winner"], json!("yes"));

        let tie = vec![(node("a"), json!("yes")), (node("b"), json!("no"))];
        assert_eq!(agg.combine(&json!(null), tie, 0).unwrap().next_state["winner"], json!("no"));
    }

    #[tokio::test]
    async fn test_offloaded_combine_matches_inline() {
        let inline = weighted(1, None);
        let offloaded = weighted(1, None).with_offload(true);
        let results: BTreeMap<NodeId, Payload> = [
            (node("a"), json!({"value": 2.0, "weight": 1})),
            (node("b"), json!({"value": 6.0, "weight": 1})),
        ]
        .into_iter()
        .collect();
        let a = inline.combine_async(json!({}), results.clone(), 0).await.unwrap();
        let b = offloaded.combine_async(json!({}), results, 0).await.unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_catalog_resolution() {
        let catalog = RuleCatalog::new()
            .with_plugin("stats/mean", PluginManifest::new("weighted_average"))
            .with_plugin(
                "vote",
                PluginManifest::new("majority_vote").with_offload(true),
            )
            .with_plugin("broken", PluginManifest::new("no_such_rule"));

        let image = ImageRef::parse("stats/mean:2").unwrap();
        let agg = catalog.resolve(&image, &json!({"rounds": 3})).unwrap();
        assert_eq!(agg.rule_name(), "weighted_average");

        let by_name = ImageRef::parse("registry.local/team/vote").unwrap();
        assert_eq!(catalog.resolve(&by_name, &json!({})).unwrap().rule_name(), "majority_vote");

        for raw in ["unknown/plugin", "broken"] {
            let image = ImageRef::parse(raw).unwrap();
            assert_eq!(catalog.resolve(&image, &json!({})).unwrap_err().code(), "VALIDATION");
        }
        assert!(catalog.resolve(&image, &json!({"rounds": 0})).is_err());
    }

    proptest! {
        #[test]
        fn prop_combine_ignores_insertion_order(
            samples in proptest::collection::btree_map("[a-z]{1,6}", (-1e6f64..1e6, 0.1f64..100.0), 1..12),
            seed in any::<u64>(),
        ) {
            let results: Vec<(NodeId, Payload)> = samples
                .iter()
                .map(|(id, (value, weight))| (node(id), json!({"value": value, "weight": weight})))
                .collect();
            let mut shuffled = results.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = (seed as usize).wrapping_mul(31).wrapping_add(i * 17) % len;
                shuffled.swap(i, j);
            }
            for agg in [weighted(1, None), Aggregator::new(Arc::new(Concatenate { rounds: 1 })), Aggregator::new(Arc::new(MajorityVote))] {
                let a = agg.combine(&json!({}), results.clone(), 0).unwrap();
                let b = agg.combine(&json!({}), shuffled.clone(), 0).unwrap();
                prop_assert_eq!(a, b);
            }
        }
    }
}
